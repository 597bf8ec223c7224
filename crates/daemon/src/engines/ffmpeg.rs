//! ffmpeg-backed transcoding engine.
//!
//! One engine type, three registered profiles. Each run has two stages:
//! `probe` (ffprobe reads the duration) and `encode` (ffmpeg with
//! `-progress pipe:1`, progress taken from `out_time_us / duration`).

use super::{find_program, require_input, run_with_progress};
use crate::engine::{Engine, EngineContext, EngineError, JobView, ProbeOutcome, StageSink};
use crate::hardware::{AccelBackend, HardwareInfo};
use crate::progress::StagePlan;
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Weight of the probe stage relative to encoding.
const PROBE_WEIGHT: f32 = 0.05;
const ENCODE_WEIGHT: f32 = 0.95;

/// Encoder used by the baseline profile.
const BASELINE_ENCODER: &str = "libx264";

/// Render node used for VAAPI encoding.
const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// Which flavour of ffmpeg encoding an engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfmpegProfile {
    /// Hardware encoder picked from the detected backends.
    Accelerated,
    /// The preset's (or job's) software encoder.
    Software,
    /// libx264, the encoder every ffmpeg build has.
    Baseline,
}

impl FfmpegProfile {
    pub fn name(&self) -> &'static str {
        match self {
            FfmpegProfile::Accelerated => "accelerated",
            FfmpegProfile::Software => "software",
            FfmpegProfile::Baseline => "baseline",
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            FfmpegProfile::Accelerated => 100,
            FfmpegProfile::Software => 50,
            FfmpegProfile::Baseline => 10,
        }
    }
}

/// Codec family of an encoder name, used to pick the matching hardware encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFamily {
    H264,
    Hevc,
    Av1,
}

impl CodecFamily {
    pub fn of(encoder: &str) -> Self {
        let lower = encoder.to_lowercase();
        if lower.contains("av1") {
            CodecFamily::Av1
        } else if lower.contains("265") || lower.contains("hevc") {
            CodecFamily::Hevc
        } else {
            CodecFamily::H264
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            CodecFamily::H264 => "h264",
            CodecFamily::Hevc => "hevc",
            CodecFamily::Av1 => "av1",
        }
    }
}

/// Hardware encoder for `family` on the first usable backend, e.g. `hevc_nvenc`.
pub fn select_hw_encoder(hw: &HardwareInfo, family: CodecFamily) -> Option<(AccelBackend, String)> {
    hw.backends
        .iter()
        .find(|b| b.is_encoder())
        .map(|backend| (*backend, format!("{}_{}", family.prefix(), backend.as_str())))
}

/// Parse one `-progress` line into a completed fraction.
pub fn parse_progress_line(line: &str, duration_us: u64) -> Option<f32> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" if duration_us > 0 => {
            let done: i64 = value.trim().parse().ok()?;
            Some((done.max(0) as f64 / duration_us as f64).clamp(0.0, 1.0) as f32)
        }
        "progress" if value.trim() == "end" => Some(1.0),
        _ => None,
    }
}

mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Duration in microseconds from `ffprobe -show_entries format=duration -of json`.
pub fn parse_duration_us(json_str: &str) -> Option<u64> {
    let output: ffprobe_json::FfprobeOutput = serde_json::from_str(json_str).ok()?;
    let secs: f64 = output.format?.duration?.parse().ok()?;
    (secs.is_finite() && secs > 0.0).then(|| (secs * 1_000_000.0) as u64)
}

/// ffmpeg engine in one profile.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    profile: FfmpegProfile,
    ffmpeg_path: String,
    ffprobe_path: String,
    ffmpeg_found: bool,
}

impl FfmpegEngine {
    pub fn new(profile: FfmpegProfile, ffmpeg_path: &str, ffprobe_path: &str) -> Self {
        Self {
            profile,
            ffmpeg_path: ffmpeg_path.to_string(),
            ffprobe_path: ffprobe_path.to_string(),
            ffmpeg_found: find_program(ffmpeg_path).is_some(),
        }
    }

    pub fn profile(&self) -> FfmpegProfile {
        self.profile
    }

    /// Encoder this engine would use for `job` on `hw`.
    pub fn encoder_for(&self, job: &JobView, hw: &HardwareInfo) -> Option<(Option<AccelBackend>, String)> {
        let requested = job
            .spec
            .options
            .encoder
            .clone()
            .unwrap_or_else(|| job.preset.video_codec.clone());
        match self.profile {
            FfmpegProfile::Accelerated => select_hw_encoder(hw, CodecFamily::of(&requested))
                .map(|(backend, encoder)| (Some(backend), encoder)),
            FfmpegProfile::Software => Some((None, requested)),
            FfmpegProfile::Baseline => Some((None, BASELINE_ENCODER.to_string())),
        }
    }

    /// Build the encode command.
    ///
    /// # Arguments
    /// * `job` - The job being run
    /// * `backend` - Hardware backend when the encoder is a hardware one
    /// * `encoder` - ffmpeg encoder name
    pub fn build_encode_command(
        &self,
        job: &JobView,
        backend: Option<AccelBackend>,
        encoder: &str,
    ) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-nostdin", "-y", "-loglevel", "error"]);
        if backend == Some(AccelBackend::Vaapi) {
            cmd.arg("-vaapi_device").arg(VAAPI_DEVICE);
        }
        cmd.arg("-i").arg(&job.spec.source);

        let mut filters: Vec<String> = Vec::new();
        if let Some(res) = job.spec.options.resolution {
            filters.push(format!("scale={}:{}", res.width, res.height));
        }
        if backend == Some(AccelBackend::Vaapi) {
            filters.push("format=nv12,hwupload".to_string());
        }
        if !filters.is_empty() {
            cmd.arg("-vf").arg(filters.join(","));
        }

        cmd.arg("-c:v").arg(encoder);
        let quality = job.preset.crf.to_string();
        match backend {
            Some(AccelBackend::Nvenc) => cmd.arg("-cq").arg(&quality),
            Some(AccelBackend::Qsv) => cmd.arg("-global_quality").arg(&quality),
            Some(_) => cmd.arg("-qp").arg(&quality),
            None => cmd.arg("-crf").arg(&quality),
        };

        if job.spec.options.strip_audio {
            cmd.arg("-an");
        } else {
            cmd.arg("-c:a").arg(&job.preset.audio_codec);
        }

        cmd.args(["-progress", "pipe:1", "-nostats"]);
        cmd.arg(&job.spec.destination);
        cmd
    }

    async fn probe_duration(&self, source: &Path) -> Result<u64, EngineError> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "json",
            ])
            .arg(source)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Fatal(format!(
                "ffprobe could not read {}: {}",
                source.display(),
                stderr.trim()
            )));
        }
        // Streams without a container duration still encode; progress then
        // only jumps at the end.
        Ok(parse_duration_us(&String::from_utf8_lossy(&output.stdout)).unwrap_or(0))
    }
}

#[async_trait]
impl Engine for FfmpegEngine {
    fn name(&self) -> &str {
        self.profile.name()
    }

    fn priority(&self) -> i32 {
        self.profile.priority()
    }

    fn probe(&self, hw: &HardwareInfo) -> ProbeOutcome {
        if !self.ffmpeg_found && !hw.capability("ffmpeg") {
            return ProbeOutcome::unavailable(format!("ffmpeg not found at '{}'", self.ffmpeg_path));
        }
        match self.profile {
            FfmpegProfile::Accelerated => {
                match hw.backends.iter().find(|b| b.is_encoder()) {
                    Some(backend) => ProbeOutcome::available(format!("hardware encoder {}", backend.as_str())),
                    None => ProbeOutcome::unavailable("no hardware encode backend"),
                }
            }
            FfmpegProfile::Software | FfmpegProfile::Baseline => ProbeOutcome::available("ffmpeg present"),
        }
    }

    fn stage_plan(&self, _job: &JobView) -> Vec<StagePlan> {
        vec![
            StagePlan::new("probe", PROBE_WEIGHT),
            StagePlan::new("encode", ENCODE_WEIGHT),
        ]
    }

    async fn run(
        &self,
        ctx: &EngineContext,
        job: &JobView,
        sink: &dyn StageSink,
    ) -> Result<(), EngineError> {
        sink.report("probe", PROBE_WEIGHT, 0.0).await?;
        require_input(&job.spec.source).await?;
        let duration_us = self.probe_duration(&job.spec.source).await?;
        sink.report("probe", PROBE_WEIGHT, 1.0).await?;

        let (backend, encoder) = self
            .encoder_for(job, &ctx.hardware)
            .ok_or_else(|| EngineError::Unavailable("no hardware encoder for this host".to_string()))?;
        debug!(job_id = %job.id, engine = %self.name(), encoder = %encoder, duration_us, "Encoding");

        sink.report("encode", ENCODE_WEIGHT, 0.0).await?;
        let cmd = self.build_encode_command(job, backend, &encoder);
        run_with_progress(cmd, "encode", ENCODE_WEIGHT, sink, |line| {
            parse_progress_line(line, duration_us)
        })
        .await?;
        sink.report("encode", ENCODE_WEIGHT, 1.0).await?;
        Ok(())
    }
}
