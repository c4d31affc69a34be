use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub librespot: LibrespotConfig,
    #[serde(default)]
    pub oauth: OauthConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrespotConfig {
    /// Explicit path to the librespot binary. When unset the daemon looks
    /// beside its own executable, in the bundled data dir, then on PATH.
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Audio-sink address injected into the child environment. Root
    /// processes on SteamOS cannot see the user pulse socket otherwise.
    #[serde(default = "default_pulse_server")]
    pub pulse_server: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthConfig {
    #[serde(default = "default_oauth_bind")]
    pub bind_address: String,
    #[serde(default = "default_oauth_port")]
    pub port: u16,
    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_dashboard_bind")]
    pub bind_address: String,
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
    /// Root of the built dashboard bundle (static files).
    #[serde(default = "default_dashboard_dir")]
    pub static_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            settings_file: default_settings_file(),
        }
    }
}

impl Default for LibrespotConfig {
    fn default() -> Self {
        Self {
            binary: None,
            device_type: default_device_type(),
            backend: default_backend(),
            pulse_server: default_pulse_server(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl Default for OauthConfig {
    fn default() -> Self {
        Self {
            bind_address: default_oauth_bind(),
            port: default_oauth_port(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            bind_address: default_dashboard_bind(),
            port: default_dashboard_port(),
            static_dir: default_dashboard_dir(),
        }
    }
}

fn default_pid_file() -> PathBuf {
    platform::data_dir().join("librespot.pid")
}

fn default_settings_file() -> PathBuf {
    platform::data_dir().join("settings.json")
}

fn default_device_type() -> String {
    "computer".to_string()
}

fn default_backend() -> String {
    "pulseaudio".to_string()
}

fn default_pulse_server() -> String {
    "unix:/run/user/1000/pulse/native".to_string()
}

fn default_cache_dir() -> PathBuf {
    platform::cache_dir()
}

fn default_oauth_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_oauth_port() -> u16 {
    platform::OAUTH_PORT
}

fn default_cert_file() -> PathBuf {
    platform::data_dir().join("cert.pem")
}

fn default_key_file() -> PathBuf {
    platform::data_dir().join("key.pem")
}

fn default_dashboard_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_dashboard_port() -> u16 {
    platform::DASHBOARD_PORT
}

fn default_dashboard_dir() -> PathBuf {
    platform::data_dir().join("dashboard").join("dist")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
