//! Typed server configuration, loaded from a TOML file with environment
//! overrides for the secrets.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Severity of a configuration validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

/// One validation finding, printable as `section: message`.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub section: &'static str,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.section, self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

/// Reserved tunnel port bands and the background sweep cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub phone_start: u16,
    pub phone_end: u16,
    pub pc_start: u16,
    pub pc_end: u16,
    /// Seconds between scanner sweeps.
    pub scan_interval_secs: u64,
    /// Socket probe deadline per port.
    pub probe_timeout_secs: u64,
    /// Seconds between zombie-reaper sweeps.
    pub reaper_interval_secs: u64,
    /// Seconds a listening port may sit without a live device before it is
    /// considered a zombie.
    pub zombie_timeout_secs: u64,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            phone_start: 6100,
            phone_end: 6199,
            pc_start: 6200,
            pc_end: 6299,
            scan_interval_secs: 10,
            probe_timeout_secs: 2,
            reaper_interval_secs: 300,
            zombie_timeout_secs: 600,
        }
    }
}

impl PortsConfig {
    pub fn full_range(&self) -> std::ops::RangeInclusive<u16> {
        self.phone_start..=self.pc_end
    }

    pub fn is_phone_port(&self, port: u16) -> bool {
        (self.phone_start..=self.phone_end).contains(&port)
    }

    pub fn is_pc_port(&self, port: u16) -> bool {
        (self.pc_start..=self.pc_end).contains(&port)
    }
}

/// LLM endpoint configuration. `api_key` may come from the
/// `FG_LLM_API_KEY` environment variable instead of the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Model used by the structured kernel (text + JSON mode).
    pub structured_model: String,
    /// Model used by the vision kernel (multimodal).
    pub vision_model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://open.bigmodel.cn/api/paas/v4".into(),
            api_key: String::new(),
            structured_model: "glm-4-flash".into(),
            vision_model: "glm-4v".into(),
            temperature: None,
            max_tokens: None,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for the SQLite database and audit logs.
    pub data_dir: PathBuf,
    /// Root of the screenshot store.
    pub screenshots_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            screenshots_dir: PathBuf::from("./data/screenshots"),
        }
    }
}

/// Kernel and scheduler tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub max_steps: u32,
    /// Settling delay between kernel steps, in milliseconds.
    pub step_delay_ms: u64,
    /// How long an `ask_user` rendezvous waits before failing the task.
    pub ask_user_timeout_secs: u64,
    /// WebSocket heartbeat interval.
    pub heartbeat_interval_secs: u64,
    /// Pong deadline after a ping.
    pub heartbeat_timeout_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            step_delay_ms: 400,
            ask_user_timeout_secs: 300,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ports: PortsConfig,
    pub llm: LlmConfig,
    pub storage: StorageConfig,
    pub tasks: TasksConfig,
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults; the
    /// `FG_LLM_API_KEY` environment variable overrides the file key either
    /// way.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str::<Config>(&raw)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
        } else {
            Config::default()
        };
        if let Ok(key) = std::env::var("FG_LLM_API_KEY") {
            if !key.is_empty() {
                config.llm.api_key = key;
            }
        }
        Ok(config)
    }

    /// Validate the configuration and report findings. Errors should abort
    /// startup; warnings are logged and ignored.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.ports.phone_start > self.ports.phone_end {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                section: "ports",
                message: format!(
                    "phone band is inverted ({}-{})",
                    self.ports.phone_start, self.ports.phone_end
                ),
            });
        }
        if self.ports.pc_start > self.ports.pc_end {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                section: "ports",
                message: format!(
                    "pc band is inverted ({}-{})",
                    self.ports.pc_start, self.ports.pc_end
                ),
            });
        }
        if self.ports.phone_end >= self.ports.pc_start {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                section: "ports",
                message: "phone and pc bands overlap".into(),
            });
        }
        if self.llm.api_key.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                section: "llm",
                message: "no API key configured; tasks will fail until one is supplied".into(),
            });
        }
        if self.tasks.max_steps == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                section: "tasks",
                message: "max_steps must be at least 1".into(),
            });
        }
        issues
    }
}

/// Mask a secret as `prefix8…suffix4` for logs and API echoes.
///
/// Secrets shorter than 12 characters are fully masked.
pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    if secret.chars().count() <= 12 {
        return "…".into();
    }
    let prefix: String = secret.chars().take(8).collect();
    let suffix: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{prefix}…{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        let errors: Vec<_> = config
            .validate()
            .into_iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn overlapping_bands_rejected() {
        let mut config = Config::default();
        config.ports.phone_end = 6250;
        assert!(config
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.ports.phone_start, 6100);
    }

    #[test]
    fn load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetgate.toml");
        std::fs::write(&path, "[server]\nport = 9001\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 9001);
        // Untouched sections keep their defaults.
        assert_eq!(config.ports.pc_end, 6299);
    }

    #[test]
    fn mask_secret_shapes() {
        assert_eq!(mask_secret(""), "");
        assert_eq!(mask_secret("short"), "…");
        let masked = mask_secret("sk-abcdefghijklmnopqrstuvwx");
        assert_eq!(masked, "sk-abcde…uvwx");
    }

    #[test]
    fn port_band_helpers() {
        let ports = PortsConfig::default();
        assert!(ports.is_phone_port(6100));
        assert!(ports.is_phone_port(6199));
        assert!(!ports.is_phone_port(6200));
        assert!(ports.is_pc_port(6299));
        assert_eq!(ports.full_range(), 6100..=6299);
    }
}
