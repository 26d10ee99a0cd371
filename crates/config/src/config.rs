//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
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

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Target CPU utilization (0.5-1.0, default 0.85)
    #[serde(default = "default_target_cpu_utilization")]
    pub target_cpu_utilization: f32,
}

fn default_target_cpu_utilization() -> f32 {
    0.85
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            target_cpu_utilization: default_target_cpu_utilization(),
        }
    }
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// ffmpeg binary (name on PATH or absolute path)
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// ffprobe binary (name on PATH or absolute path)
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Default x264 preset when a request does not carry one
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Default constant rate factor
    #[serde(default = "default_crf")]
    pub crf: u8,
    /// Default audio bitrate (e.g. "192k")
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    /// Seconds to wait after a graceful stop before killing the encoder
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Minimum interval between progress notifications, in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_crf() -> u8 {
    18
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

fn default_stop_grace_secs() -> u64 {
    2
}

fn default_progress_interval_ms() -> u64 {
    500
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            preset: default_preset(),
            crf: default_crf(),
            audio_bitrate: default_audio_bitrate(),
            stop_grace_secs: default_stop_grace_secs(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

/// Where job state and history are kept
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Resume snapshot location
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Conversion history location
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,
    /// Oldest history entries beyond this count are evicted
    #[serde(default = "default_max_history_entries")]
    pub max_history_entries: usize,
    /// Size of the per-job log ring
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".conversion-state.json")
}

fn default_history_file() -> PathBuf {
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".vts-batch-history.json"),
        None => PathBuf::from(".vts-batch-history.json"),
    }
}

fn default_max_history_entries() -> usize {
    100
}

fn default_max_log_entries() -> usize {
    100
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            history_file: default_history_file(),
            max_history_entries: default_max_history_entries(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

/// HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address the API listens on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3001".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing optional fields fall back to their defaults.
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
    /// Overrides the following values if environment variables are set:
    /// - CPU_LOGICAL_CORES -> cpu.logical_cores
    /// - CPU_TARGET_UTILIZATION -> cpu.target_cpu_utilization
    /// - VTS_FFMPEG_PATH -> encoder.ffmpeg_path
    /// - VTS_FFPROBE_PATH -> encoder.ffprobe_path
    /// - VTS_STOP_GRACE_SECS -> encoder.stop_grace_secs
    /// - VTS_STATE_FILE -> storage.state_file
    /// - VTS_HISTORY_FILE -> storage.history_file
    /// - VTS_MAX_HISTORY_ENTRIES -> storage.max_history_entries
    /// - VTS_BIND_ADDR -> server.bind_addr
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CPU_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.cpu.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("CPU_TARGET_UTILIZATION") {
            if let Ok(util) = val.parse::<f32>() {
                self.cpu.target_cpu_utilization = util;
            }
        }

        if let Some(path) = non_empty_var("VTS_FFMPEG_PATH") {
            self.encoder.ffmpeg_path = path;
        }

        if let Some(path) = non_empty_var("VTS_FFPROBE_PATH") {
            self.encoder.ffprobe_path = path;
        }

        if let Ok(val) = env::var("VTS_STOP_GRACE_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.encoder.stop_grace_secs = secs;
            }
        }

        if let Some(path) = non_empty_var("VTS_STATE_FILE") {
            self.storage.state_file = PathBuf::from(path);
        }

        if let Some(path) = non_empty_var("VTS_HISTORY_FILE") {
            self.storage.history_file = PathBuf::from(path);
        }

        if let Ok(val) = env::var("VTS_MAX_HISTORY_ENTRIES") {
            if let Ok(max) = val.parse::<usize>() {
                self.storage.max_history_entries = max;
            }
        }

        if let Some(addr) = non_empty_var("VTS_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for key in [
            "CPU_LOGICAL_CORES",
            "CPU_TARGET_UTILIZATION",
            "VTS_FFMPEG_PATH",
            "VTS_FFPROBE_PATH",
            "VTS_STOP_GRACE_SECS",
            "VTS_STATE_FILE",
            "VTS_HISTORY_FILE",
            "VTS_MAX_HISTORY_ENTRIES",
            "VTS_BIND_ADDR",
        ] {
            env::remove_var(key);
        }
    }

    // **Feature: vts-batch, Property: Configuration Parsing and Environment Override**
    //
    // *For any* valid TOML configuration string, every section parses, and the
    // matching environment variables take precedence over file values.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            logical_cores in proptest::option::of(1u32..256),
            target_util in 0.0f32..2.0,
            crf in 0u8..52,
            grace in 0u64..30,
            max_history in 1usize..1000,
            port in 1024u16..65535,
        ) {
            let toml_str = format!(
                r#"
[cpu]
{}
target_cpu_utilization = {}

[encoder]
ffmpeg_path = "/opt/ffmpeg/bin/ffmpeg"
preset = "slow"
crf = {}
audio_bitrate = "256k"
stop_grace_secs = {}

[storage]
state_file = "/var/lib/vts/state.json"
max_history_entries = {}

[server]
bind_addr = "0.0.0.0:{}"
"#,
                logical_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default(),
                target_util,
                crf,
                grace,
                max_history,
                port,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.cpu.logical_cores, logical_cores);
            prop_assert!((config.cpu.target_cpu_utilization - target_util).abs() < 0.0001);
            prop_assert_eq!(config.encoder.ffmpeg_path.as_str(), "/opt/ffmpeg/bin/ffmpeg");
            prop_assert_eq!(config.encoder.ffprobe_path.as_str(), "ffprobe");
            prop_assert_eq!(config.encoder.preset.as_str(), "slow");
            prop_assert_eq!(config.encoder.crf, crf);
            prop_assert_eq!(config.encoder.audio_bitrate.as_str(), "256k");
            prop_assert_eq!(config.encoder.stop_grace_secs, grace);
            prop_assert_eq!(config.encoder.progress_interval_ms, 500);
            prop_assert_eq!(config.storage.state_file, PathBuf::from("/var/lib/vts/state.json"));
            prop_assert_eq!(config.storage.max_history_entries, max_history);
            prop_assert_eq!(config.server.bind_addr, format!("0.0.0.0:{}", port));
        }

        #[test]
        fn prop_env_overrides_cpu_logical_cores(
            initial_cores in proptest::option::of(1u32..128),
            override_cores in 1u32..256,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[cpu]\n{}\n",
                initial_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default()
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");
            env::set_var("CPU_LOGICAL_CORES", override_cores.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.cpu.logical_cores, Some(override_cores));
        }

        #[test]
        fn prop_env_overrides_stop_grace(
            initial in 0u64..10,
            override_secs in 0u64..60,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[encoder]\nstop_grace_secs = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("VTS_STOP_GRACE_SECS", override_secs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.encoder.stop_grace_secs, override_secs);
        }

        #[test]
        fn prop_env_overrides_max_history_entries(
            initial in 1usize..100,
            override_max in 1usize..10_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[storage]\nmax_history_entries = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("VTS_MAX_HISTORY_ENTRIES", override_max.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.storage.max_history_entries, override_max);
        }
    }

    #[test]
    fn test_env_overrides_paths_and_bind_addr() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("VTS_FFMPEG_PATH", "/usr/local/bin/ffmpeg");
        env::set_var("VTS_FFPROBE_PATH", "/usr/local/bin/ffprobe");
        env::set_var("VTS_STATE_FILE", "/tmp/state.json");
        env::set_var("VTS_HISTORY_FILE", "/tmp/history.json");
        env::set_var("VTS_BIND_ADDR", "0.0.0.0:8080");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.encoder.ffmpeg_path, "/usr/local/bin/ffmpeg");
        assert_eq!(config.encoder.ffprobe_path, "/usr/local/bin/ffprobe");
        assert_eq!(config.storage.state_file, PathBuf::from("/tmp/state.json"));
        assert_eq!(config.storage.history_file, PathBuf::from("/tmp/history.json"));
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("CPU_LOGICAL_CORES", "lots");
        env::set_var("VTS_STOP_GRACE_SECS", "-1");
        env::set_var("VTS_FFMPEG_PATH", "   ");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.cpu.logical_cores, None);
        assert_eq!(config.encoder.stop_grace_secs, 2);
        assert_eq!(config.encoder.ffmpeg_path, "ffmpeg");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.cpu.logical_cores, None);
        assert!((config.cpu.target_cpu_utilization - 0.85).abs() < 0.0001);
        assert_eq!(config.encoder.preset, "medium");
        assert_eq!(config.encoder.crf, 18);
        assert_eq!(config.encoder.audio_bitrate, "192k");
        assert_eq!(config.encoder.stop_grace_secs, 2);
        assert_eq!(config.storage.state_file, PathBuf::from(".conversion-state.json"));
        assert_eq!(config.storage.max_history_entries, 100);
        assert_eq!(config.storage.max_log_entries, 100);
        assert_eq!(config.server.bind_addr, "127.0.0.1:3001");
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[encoder]
crf = 22
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.encoder.crf, 22);
        assert_eq!(config.encoder.preset, "medium"); // default
        assert_eq!(config.encoder.ffmpeg_path, "ffmpeg"); // default
        assert_eq!(config.cpu.logical_cores, None); // default
    }

    #[test]
    fn test_load_or_default_with_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::load_or_default("/nonexistent/vts-batch.toml")
            .expect("missing file falls back to defaults");
        assert_eq!(config.encoder, EncoderConfig::default());
        assert_eq!(config.server, ServerConfig::default());
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let err = Config::parse_toml("[encoder]\ncrf = \"high\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().starts_with("Failed to parse config"));
    }
}
