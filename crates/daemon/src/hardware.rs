//! Hardware capability detection with a bounded wait.
//!
//! Detection shells out to external tools (`nvidia-smi`, `ffmpeg`) that can
//! hang. [`HardwareProbe::detect`] runs the detector on a detached thread and
//! waits at most the caller's timeout; a late result still lands in the cache
//! for the next call.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Encoder name fragments that identify a hardware encode backend in
/// `ffmpeg -encoders` output.
const HW_ENCODER_MARKERS: &[(&str, AccelBackend)] = &[
    ("_nvenc", AccelBackend::Nvenc),
    ("_qsv", AccelBackend::Qsv),
    ("_vaapi", AccelBackend::Vaapi),
    ("_amf", AccelBackend::Amf),
    ("_videotoolbox", AccelBackend::VideoToolbox),
];

/// GPU vendor of the primary adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    None,
}

impl Default for GpuVendor {
    fn default() -> Self {
        Self::None
    }
}

/// Acceleration backend usable on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccelBackend {
    Cuda,
    Nvenc,
    Qsv,
    Vaapi,
    Amf,
    VideoToolbox,
}

impl AccelBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccelBackend::Cuda => "cuda",
            AccelBackend::Nvenc => "nvenc",
            AccelBackend::Qsv => "qsv",
            AccelBackend::Vaapi => "vaapi",
            AccelBackend::Amf => "amf",
            AccelBackend::VideoToolbox => "videotoolbox",
        }
    }

    /// Whether the backend provides a hardware video encoder.
    pub fn is_encoder(&self) -> bool {
        !matches!(self, AccelBackend::Cuda)
    }
}

/// Snapshot of what the host can do. Plain data, safe to clone and persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub vendor: GpuVendor,
    pub gpu_name: Option<String>,
    pub vram_mb: Option<u64>,
    pub cpu_cores: u32,
    pub total_memory_mb: u64,
    pub backends: Vec<AccelBackend>,
    pub hardware_encode: bool,
    pub ffmpeg_version: Option<u32>,
    /// Presence of optional tools and SDKs, keyed by name.
    pub capabilities: BTreeMap<String, bool>,
}

impl HardwareInfo {
    /// Conservative answer used when detection has not finished: no GPU,
    /// no acceleration, CPU count only.
    pub fn fallback() -> Self {
        Self {
            vendor: GpuVendor::None,
            gpu_name: None,
            vram_mb: None,
            cpu_cores: num_cpus::get() as u32,
            total_memory_mb: 0,
            backends: Vec::new(),
            hardware_encode: false,
            ffmpeg_version: None,
            capabilities: BTreeMap::new(),
        }
    }

    pub fn has_backend(&self, backend: AccelBackend) -> bool {
        self.backends.contains(&backend)
    }

    pub fn has_gpu(&self) -> bool {
        self.vendor != GpuVendor::None
    }

    pub fn capability(&self, name: &str) -> bool {
        self.capabilities.get(name).copied().unwrap_or(false)
    }

    /// Drop every acceleration claim, keeping CPU and tool facts.
    pub fn without_acceleration(mut self) -> Self {
        self.backends.clear();
        self.hardware_encode = false;
        self
    }
}

/// Something that can inspect the host. Blocking; may be slow or hang.
pub trait Detector: Send + Sync + 'static {
    fn detect(&self) -> HardwareInfo;
}

impl<F> Detector for F
where
    F: Fn() -> HardwareInfo + Send + Sync + 'static,
{
    fn detect(&self) -> HardwareInfo {
        self()
    }
}

/// Parse `nvidia-smi --query-gpu=name,memory.total --format=csv,noheader,nounits`.
pub fn parse_nvidia_smi(output: &str) -> Option<(String, u64)> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let mut parts = line.split(',').map(str::trim);
    let name = parts.next()?.to_string();
    let vram = parts.next()?.parse::<u64>().ok()?;
    if name.is_empty() {
        return None;
    }
    Some((name, vram))
}

/// Map a PCI vendor id such as `0x10de` to a vendor.
pub fn parse_pci_vendor(id: &str) -> GpuVendor {
    match id.trim().to_lowercase().as_str() {
        "0x10de" => GpuVendor::Nvidia,
        "0x1002" => GpuVendor::Amd,
        "0x8086" => GpuVendor::Intel,
        _ => GpuVendor::None,
    }
}

/// Collect hardware encode backends from `ffmpeg -hide_banner -encoders`.
pub fn parse_ffmpeg_encoders(output: &str) -> Vec<AccelBackend> {
    let mut found = Vec::new();
    for line in output.lines() {
        // Encoder lines look like " V....D h264_nvenc  NVIDIA NVENC H.264 encoder"
        let Some(name) = line.split_whitespace().nth(1) else {
            continue;
        };
        for (marker, backend) in HW_ENCODER_MARKERS {
            if name.ends_with(marker) && !found.contains(backend) {
                found.push(*backend);
            }
        }
    }
    found.sort();
    found
}

/// Parse FFmpeg version output and extract the major version number.
///
/// Handles "ffmpeg version 7.1 ..." and n-prefixed builds ("n7.1-...").
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .trim()
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;
    major_str.parse().ok()
}

/// Run a command and return stdout when it exits successfully.
fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Detector for the real host.
#[derive(Debug, Clone)]
pub struct SystemDetector {
    pub ffmpeg_path: String,
    pub disallow_hardware: bool,
}

impl SystemDetector {
    pub fn new(ffmpeg_path: impl Into<String>, disallow_hardware: bool) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            disallow_hardware,
        }
    }
}

impl Detector for SystemDetector {
    fn detect(&self) -> HardwareInfo {
        let mut info = HardwareInfo::fallback();

        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        info.total_memory_mb = sys.total_memory() / (1024 * 1024);

        let nvidia = command_stdout(
            "nvidia-smi",
            &[
                "--query-gpu=name,memory.total",
                "--format=csv,noheader,nounits",
            ],
        );
        info.capabilities
            .insert("nvidia_smi".to_string(), nvidia.is_some());
        if let Some((name, vram)) = nvidia.as_deref().and_then(parse_nvidia_smi) {
            info.vendor = GpuVendor::Nvidia;
            info.gpu_name = Some(name);
            info.vram_mb = Some(vram);
            info.backends.push(AccelBackend::Cuda);
        } else if cfg!(target_os = "macos") {
            info.vendor = GpuVendor::Apple;
        } else if let Ok(id) = std::fs::read_to_string("/sys/class/drm/card0/device/vendor") {
            info.vendor = parse_pci_vendor(&id);
        }

        info.capabilities.insert(
            "dri_render_node".to_string(),
            Path::new("/dev/dri/renderD128").exists(),
        );

        let version = command_stdout(&self.ffmpeg_path, &["-version"]);
        info.ffmpeg_version = version.as_deref().and_then(parse_ffmpeg_version);
        info.capabilities
            .insert("ffmpeg".to_string(), info.ffmpeg_version.is_some());

        if let Some(encoders) = command_stdout(&self.ffmpeg_path, &["-hide_banner", "-encoders"]) {
            for backend in parse_ffmpeg_encoders(&encoders) {
                // ffmpeg lists compiled-in encoders; keep only those the
                // detected hardware can drive.
                let usable = match backend {
                    AccelBackend::Nvenc => info.vendor == GpuVendor::Nvidia,
                    AccelBackend::Qsv => info.vendor == GpuVendor::Intel,
                    AccelBackend::Amf => info.vendor == GpuVendor::Amd,
                    AccelBackend::Vaapi => info.capability("dri_render_node"),
                    AccelBackend::VideoToolbox => info.vendor == GpuVendor::Apple,
                    AccelBackend::Cuda => false,
                };
                if usable && !info.backends.contains(&backend) {
                    info.backends.push(backend);
                }
            }
        }
        info.backends.sort();
        info.hardware_encode = info.backends.iter().any(AccelBackend::is_encoder);

        if self.disallow_hardware {
            info = info.without_acceleration();
        }
        info
    }
}

#[derive(Default)]
struct ProbeState {
    cached: Option<(HardwareInfo, Instant)>,
    in_flight: Option<watch::Receiver<Option<HardwareInfo>>>,
}

/// Bounded-time, cached hardware detection.
#[derive(Clone)]
pub struct HardwareProbe {
    detector: Arc<dyn Detector>,
    ttl: Duration,
    state: Arc<Mutex<ProbeState>>,
}

impl HardwareProbe {
    pub fn new(detector: impl Detector, ttl: Duration) -> Self {
        Self {
            detector: Arc::new(detector),
            ttl,
            state: Arc::new(Mutex::new(ProbeState::default())),
        }
    }

    /// Return hardware info, waiting at most `timeout` for detection.
    ///
    /// A fresh cached value is returned immediately. Otherwise a detection is
    /// started (or an in-flight one joined); if it does not finish in time the
    /// conservative [`HardwareInfo::fallback`] is returned and the detection
    /// keeps running to warm the cache.
    pub async fn detect(&self, timeout: Duration) -> HardwareInfo {
        let mut rx = {
            let mut state = self.state.lock();
            if let Some((info, at)) = &state.cached {
                if at.elapsed() < self.ttl {
                    return info.clone();
                }
            }
            match &state.in_flight {
                Some(rx) => rx.clone(),
                None => {
                    let rx = self.spawn_detection();
                    state.in_flight = Some(rx.clone());
                    rx
                }
            }
        };

        let info = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(value)) => (*value).clone().unwrap_or_else(HardwareInfo::fallback),
            Ok(Err(_)) => {
                warn!("Hardware detection ended without a result; assuming no acceleration");
                self.state.lock().in_flight = None;
                HardwareInfo::fallback()
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Hardware detection timed out; assuming no acceleration for now"
                );
                HardwareInfo::fallback()
            }
        };
        info
    }

    /// Last known-good result and its age, without probing.
    pub fn cached(&self) -> Option<(HardwareInfo, Duration)> {
        let state = self.state.lock();
        state
            .cached
            .as_ref()
            .map(|(info, at)| (info.clone(), at.elapsed()))
    }

    /// Forget the cached result so the next `detect` probes again.
    pub fn invalidate(&self) {
        self.state.lock().cached = None;
    }

    fn spawn_detection(&self) -> watch::Receiver<Option<HardwareInfo>> {
        let (tx, rx) = watch::channel(None);
        let detector = Arc::clone(&self.detector);
        let state = Arc::clone(&self.state);

        let spawned = std::thread::Builder::new()
            .name("hw-probe".to_string())
            .spawn(move || {
                let started = Instant::now();
                let info = detector.detect();
                info!(
                    vendor = ?info.vendor,
                    backends = ?info.backends,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Hardware detection finished"
                );
                {
                    let mut state = state.lock();
                    state.cached = Some((info.clone(), Instant::now()));
                    state.in_flight = None;
                }
                let _ = tx.send(Some(info));
            });

        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn hardware detection thread");
        } else {
            debug!("Hardware detection started");
        }
        rx
    }
}
