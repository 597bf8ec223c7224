//! Built-in processing engines.
//!
//! - [`FfmpegEngine`] in three profiles: hardware accelerated, software and a
//!   libx264 baseline that works wherever ffmpeg runs.
//! - [`ExternalToolEngine`] for configured command-line tools such as AI
//!   upscalers.

pub mod external;
pub mod ffmpeg;

pub use external::ExternalToolEngine;
pub use ffmpeg::{FfmpegEngine, FfmpegProfile};

use crate::engine::{Engine, EngineError, StageSink};
use mediaq_config::Config;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Lines of stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 8;

/// Engines built from configuration, in registration order.
pub fn builtin_engines(config: &Config) -> Vec<Arc<dyn Engine>> {
    let engines_cfg = &config.engines;
    let mut engines: Vec<Arc<dyn Engine>> = [
        FfmpegProfile::Accelerated,
        FfmpegProfile::Software,
        FfmpegProfile::Baseline,
    ]
    .into_iter()
    .map(|profile| {
        Arc::new(FfmpegEngine::new(
            profile,
            &engines_cfg.ffmpeg_path,
            &engines_cfg.ffprobe_path,
        )) as Arc<dyn Engine>
    })
    .collect();

    for tool in &engines_cfg.external {
        engines.push(Arc::new(ExternalToolEngine::from_config(tool)));
    }
    engines
}

/// Resolve `program` the way a shell would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let dirs = std::env::var_os("PATH")?;
    std::env::split_paths(&dirs)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Fail fatally when the job input cannot be read; no engine can fix that.
pub(crate) async fn require_input(source: &Path) -> Result<(), EngineError> {
    match tokio::fs::metadata(source).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(EngineError::Fatal(format!(
            "input {} is not a regular file",
            source.display()
        ))),
        Err(e) => Err(EngineError::Fatal(format!(
            "input {} is not readable: {}",
            source.display(),
            e
        ))),
    }
}

/// Run a child process, turning progress lines into stage reports.
///
/// Both stdout and stderr are scanned with `parse`; stderr is also kept for
/// the error message. The child is killed if this future is dropped, which
/// is how engine timeouts and interrupts stop it.
pub(crate) async fn run_with_progress(
    mut cmd: Command,
    stage: &str,
    weight: f32,
    sink: &dyn StageSink,
    parse: impl Fn(&str) -> Option<f32>,
) -> Result<(), EngineError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Execution(format!("{}: stdout not captured", program)))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::Execution(format!("{}: stderr not captured", program)))?;

    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let (mut out_done, mut err_done) = (false, false);

    while !(out_done && err_done) {
        let line = tokio::select! {
            line = out_lines.next_line(), if !out_done => match line? {
                Some(line) => line,
                None => {
                    out_done = true;
                    continue;
                }
            },
            line = err_lines.next_line(), if !err_done => match line? {
                Some(line) => {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                    line
                }
                None => {
                    err_done = true;
                    continue;
                }
            },
        };
        if let Some(fraction) = parse(&line) {
            sink.report(stage, weight, fraction).await?;
        }
    }

    let status = child.wait().await?;
    if status.success() {
        debug!(program = %program, "Process finished");
        return Ok(());
    }
    let detail: Vec<String> = tail.into_iter().filter(|l| !l.trim().is_empty()).collect();
    Err(EngineError::Execution(format!(
        "{} exited with {}: {}",
        program,
        status,
        detail.join(" | ")
    )))
}

/// Engine timeout from an optional number of seconds.
pub(crate) fn timeout_from_secs(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|s| *s > 0).map(Duration::from_secs)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Sink that records every report.

    use super::*;
    use crate::engine::Interrupt;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub reports: Mutex<Vec<(String, f32)>>,
    }

    impl RecordingSink {
        pub fn stages(&self) -> Vec<String> {
            let mut stages: Vec<String> = Vec::new();
            for (stage, _) in self.reports.lock().iter() {
                if stages.last() != Some(stage) {
                    stages.push(stage.clone());
                }
            }
            stages
        }

        pub fn fractions(&self, stage: &str) -> Vec<f32> {
            self.reports
                .lock()
                .iter()
                .filter(|(s, _)| s == stage)
                .map(|(_, f)| *f)
                .collect()
        }
    }

    #[async_trait]
    impl StageSink for RecordingSink {
        async fn report(&self, stage: &str, _weight: f32, fraction: f32) -> Result<(), Interrupt> {
            self.reports.lock().push((stage.to_string(), fraction));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_program() {
        assert!(find_program("definitely-not-a-real-tool-4821").is_none());
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("tool");
        std::fs::write(&file, "").unwrap();
        assert_eq!(find_program(file.to_str().unwrap()), Some(file.clone()));
        assert!(find_program(dir.path().join("missing").to_str().unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_require_input() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("in.mkv");
        std::fs::write(&file, b"data").unwrap();
        assert!(require_input(&file).await.is_ok());
        assert!(matches!(
            require_input(&dir.path().join("nope.mkv")).await,
            Err(EngineError::Fatal(_))
        ));
        assert!(matches!(require_input(dir.path()).await, Err(EngineError::Fatal(_))));
    }

    #[test]
    fn test_builtin_engines_registration_order() {
        let mut config = Config::default();
        config.engines.external.push(mediaq_config::ExternalEngineConfig {
            name: "upscaler".to_string(),
            program: "realesrgan".to_string(),
            args: vec!["-i".into(), "{input}".into(), "-o".into(), "{output}".into()],
            priority: 70,
            features: vec!["upscale".to_string()],
            timeout_secs: None,
            requires_gpu: true,
        });
        let names: Vec<String> = builtin_engines(&config)
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["accelerated", "software", "baseline", "upscaler"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_progress_reads_both_streams() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 10; echo 50 1>&2; echo 100");
        let sink = RecordingSink::default();
        run_with_progress(cmd, "work", 1.0, &sink, |line| {
            line.trim().parse::<f32>().ok().map(|v| v / 100.0)
        })
        .await
        .unwrap();

        let mut seen = sink.fractions("work");
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, vec![0.1, 0.5, 1.0]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_with_progress_reports_exit_failure() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo broken pipe 1>&2; exit 3");
        let sink = RecordingSink::default();
        let err = run_with_progress(cmd, "work", 1.0, &sink, |_| None)
            .await
            .unwrap_err();
        match err {
            EngineError::Execution(message) => assert!(message.contains("broken pipe")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let cmd = Command::new("definitely-not-a-real-tool-4821");
        let sink = RecordingSink::default();
        let err = run_with_progress(cmd, "work", 1.0, &sink, |_| None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }
}
