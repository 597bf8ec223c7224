//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the preset that is always available, even when not configured.
pub const DEFAULT_PRESET: &str = "default";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Semantically invalid configuration value
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfig {
    /// Number of concurrent workers (0 = derive from core count)
    #[serde(default)]
    pub count: u32,
    /// Target CPU utilization used when deriving the worker count (0.5-1.0)
    #[serde(default = "default_target_cpu_utilization")]
    pub target_cpu_utilization: f32,
}

fn default_target_cpu_utilization() -> f32 {
    0.85
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 0,
            target_cpu_utilization: default_target_cpu_utilization(),
        }
    }
}

/// Queue persistence and notification settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Path of the JSON document holding the job table
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Interval of the periodic persistence timer
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,
    /// Quiet period before a mutation-triggered write hits disk
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
    /// Capacity of the observer broadcast channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("mediaq-state/jobs.json")
}

fn default_persist_interval_secs() -> u64 {
    30
}

fn default_persist_debounce_ms() -> u64 {
    250
}

fn default_event_buffer() -> usize {
    256
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            persist_interval_secs: default_persist_interval_secs(),
            persist_debounce_ms: default_persist_debounce_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Hardware detection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HardwareConfig {
    /// Maximum time a caller waits for detection
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// How long a detection result stays fresh
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Treat the host as having no acceleration at all
    #[serde(default)]
    pub disallow_hardware: bool,
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

fn default_cache_ttl_secs() -> u64 {
    600
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            disallow_hardware: false,
        }
    }
}

/// An external command-line engine, e.g. an AI upscaler.
///
/// `args` may contain the placeholders `{input}`, `{output}` and `{scale}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalEngineConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_external_priority")]
    pub priority: i32,
    /// Optional features the tool implements (upscale, face_restore, audio_upsample)
    #[serde(default)]
    pub features: Vec<String>,
    pub timeout_secs: Option<u64>,
    /// Only consider the engine when a GPU was detected
    #[serde(default)]
    pub requires_gpu: bool,
}

fn default_external_priority() -> i32 {
    50
}

/// Engine selection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnginesConfig {
    /// Engine names that may never run and may not be requested
    #[serde(default)]
    pub disallowed: Vec<String>,
    /// Timeout applied to built-in engines (0 = unbounded)
    #[serde(default = "default_engine_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    #[serde(default)]
    pub external: Vec<ExternalEngineConfig>,
}

fn default_engine_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            disallowed: Vec::new(),
            default_timeout_secs: default_engine_timeout_secs(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            external: Vec::new(),
        }
    }
}

/// A named set of encoding parameters referenced by job specs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresetConfig {
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_crf")]
    pub crf: u8,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
}

fn default_video_codec() -> String {
    "libx265".to_string()
}

fn default_crf() -> u8 {
    23
}

fn default_audio_codec() -> String {
    "copy".to_string()
}

impl Default for PresetConfig {
    fn default() -> Self {
        Self {
            video_codec: default_video_codec(),
            crf: default_crf(),
            audio_codec: default_audio_codec(),
        }
    }
}

/// HTTP status/submission API settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
    #[serde(default)]
    pub presets: BTreeMap<String, PresetConfig>,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// - MEDIAQ_WORKERS -> workers.count
    /// - MEDIAQ_STATE_PATH -> queue.state_path
    /// - MEDIAQ_PROBE_TIMEOUT_MS -> hardware.probe_timeout_ms
    /// - MEDIAQ_BIND -> server.bind
    /// - MEDIAQ_DISALLOW_HARDWARE -> hardware.disallow_hardware
    /// - MEDIAQ_DISALLOWED_ENGINES -> engines.disallowed (comma separated)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("MEDIAQ_WORKERS") {
            if let Ok(count) = val.parse::<u32>() {
                self.workers.count = count;
            }
        }

        if let Ok(val) = env::var("MEDIAQ_STATE_PATH") {
            if !val.trim().is_empty() {
                self.queue.state_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("MEDIAQ_PROBE_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.hardware.probe_timeout_ms = ms;
            }
        }

        if let Ok(val) = env::var("MEDIAQ_BIND") {
            if !val.trim().is_empty() {
                self.server.bind = val;
            }
        }

        if let Ok(val) = env::var("MEDIAQ_DISALLOW_HARDWARE") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.hardware.disallow_hardware = true,
                "false" | "0" | "no" => self.hardware.disallow_hardware = false,
                _ => {}
            }
        }

        if let Ok(val) = env::var("MEDIAQ_DISALLOWED_ENGINES") {
            self.engines.disallowed = val
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// Check values that parse fine but cannot work at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hardware.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "hardware.probe_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.queue.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "queue.event_buffer must be greater than zero".to_string(),
            ));
        }
        if self.presets.keys().any(|name| name.trim().is_empty()) {
            return Err(ConfigError::Invalid("preset names must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for engine in &self.engines.external {
            if engine.name.trim().is_empty() || engine.program.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "external engines need a name and a program".to_string(),
                ));
            }
            if !seen.insert(engine.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate external engine '{}'",
                    engine.name
                )));
            }
        }

        Ok(())
    }

    /// Look up a preset by name; `default` resolves even when not configured
    pub fn preset(&self, name: &str) -> Option<PresetConfig> {
        match self.presets.get(name) {
            Some(preset) => Some(preset.clone()),
            None if name == DEFAULT_PRESET => Some(PresetConfig::default()),
            None => None,
        }
    }

    /// All preset names a job spec may reference
    pub fn preset_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.presets.keys().cloned().collect();
        if !self.presets.contains_key(DEFAULT_PRESET) {
            names.push(DEFAULT_PRESET.to_string());
        }
        names.sort();
        names
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
