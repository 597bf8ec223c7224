//! Engine that runs a configured command-line tool.
//!
//! Arguments may contain `{input}`, `{output}` and `{scale}` placeholders.
//! Progress is read from any output line containing a percentage such as
//! `42.5%`.

use super::{find_program, require_input, run_with_progress, timeout_from_secs};
use crate::engine::{Engine, EngineContext, EngineError, JobView, ProbeOutcome, StageSink};
use crate::hardware::HardwareInfo;
use crate::job::Feature;
use crate::progress::StagePlan;
use async_trait::async_trait;
use mediaq_config::ExternalEngineConfig;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const STAGE: &str = "process";

/// Upscale factor substituted for `{scale}` when the job does not set one.
const DEFAULT_SCALE: u32 = 2;

/// A configured external tool.
#[derive(Debug, Clone)]
pub struct ExternalToolEngine {
    name: String,
    program: String,
    resolved: Option<PathBuf>,
    args: Vec<String>,
    priority: i32,
    features: HashSet<Feature>,
    timeout: Option<Duration>,
    requires_gpu: bool,
}

impl ExternalToolEngine {
    pub fn from_config(config: &ExternalEngineConfig) -> Self {
        let features = config
            .features
            .iter()
            .filter_map(|raw| {
                let feature = Feature::parse(raw);
                if feature.is_none() {
                    warn!(engine = %config.name, feature = %raw, "Ignoring unknown feature");
                }
                feature
            })
            .collect();

        Self {
            name: config.name.clone(),
            program: config.program.clone(),
            resolved: find_program(&config.program),
            args: config.args.clone(),
            priority: config.priority,
            features,
            timeout: timeout_from_secs(config.timeout_secs),
            requires_gpu: config.requires_gpu,
        }
    }

    /// Arguments with placeholders filled in for `job`.
    pub fn expand_args(&self, job: &JobView) -> Vec<String> {
        let input = job.spec.source.to_string_lossy();
        let output = job.spec.destination.to_string_lossy();
        let scale = job.spec.options.upscale.unwrap_or(DEFAULT_SCALE).to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output}", &output)
                    .replace("{scale}", &scale)
            })
            .collect()
    }
}

/// Fraction from the last `NN%` or `NN.N%` token on a line.
pub fn parse_percent(line: &str) -> Option<f32> {
    line.split(|c: char| c.is_whitespace() || c == '[' || c == ']' || c == '(' || c == ')')
        .filter_map(|token| token.strip_suffix('%'))
        .filter_map(|number| number.parse::<f32>().ok())
        .filter(|value| value.is_finite())
        .last()
        .map(|value| (value / 100.0).clamp(0.0, 1.0))
}

#[async_trait]
impl Engine for ExternalToolEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn probe(&self, hw: &HardwareInfo) -> ProbeOutcome {
        if self.resolved.is_none() {
            return ProbeOutcome::unavailable(format!("'{}' not found", self.program));
        }
        if self.requires_gpu && !hw.has_gpu() {
            return ProbeOutcome::unavailable("requires a GPU");
        }
        ProbeOutcome::available(format!("'{}' present", self.program))
    }

    fn supports(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn stage_plan(&self, _job: &JobView) -> Vec<StagePlan> {
        vec![StagePlan::new(STAGE, 1.0)]
    }

    async fn run(
        &self,
        _ctx: &EngineContext,
        job: &JobView,
        sink: &dyn StageSink,
    ) -> Result<(), EngineError> {
        sink.report(STAGE, 1.0, 0.0).await?;
        require_input(&job.spec.source).await?;

        let program = self.resolved.clone().unwrap_or_else(|| PathBuf::from(&self.program));
        let args = self.expand_args(job);
        debug!(job_id = %job.id, engine = %self.name, program = %program.display(), "Starting tool");

        let mut cmd = Command::new(program);
        cmd.args(&args);
        run_with_progress(cmd, STAGE, 1.0, sink, parse_percent).await?;
        sink.report(STAGE, 1.0, 1.0).await?;
        Ok(())
    }
}
