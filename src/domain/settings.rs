use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_true(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "hm10_switch".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: Uuid,
    #[serde(default = "default_scan_period_ms")]
    pub scan_period_ms: u64,
    #[serde(default = "default_false")]
    pub auto_connect: bool,
    #[serde(default = "default_auto_connect_name")]
    pub auto_connect_name: String,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            scan_period_ms: default_scan_period_ms(),
            auto_connect: default_false(),
            auto_connect_name: default_auto_connect_name(),
        }
    }
}

impl BleSettings {
    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.scan_period_ms)
    }
}

fn default_service_uuid() -> Uuid {
    protocol::SERVICE_UUID
}
fn default_characteristic_uuid() -> Uuid {
    protocol::CHARACTERISTIC_UUID
}
fn default_scan_period_ms() -> u64 {
    protocol::SCAN_PERIOD_MS
}
fn default_auto_connect_name() -> String {
    protocol::DEFAULT_DEVICE_NAME.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchangeSettings {
    #[serde(default = "default_key_exchange_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_key_exchange_name")]
    pub service_name: String,
    /// Per-read timeout on the key socket, 0 disables it
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// How long the initiator waits for the peer to hang up after `DONE`
    #[serde(default = "default_close_linger_ms")]
    pub close_linger_ms: u64,
    /// Listen address of the TCP loopback transport
    #[serde(default = "default_tcp_bind")]
    pub tcp_bind: String,
}

impl Default for KeyExchangeSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_key_exchange_uuid(),
            service_name: default_key_exchange_name(),
            read_timeout_ms: default_read_timeout_ms(),
            close_linger_ms: default_close_linger_ms(),
            tcp_bind: default_tcp_bind(),
        }
    }
}

fn default_key_exchange_uuid() -> Uuid {
    protocol::KEY_EXCHANGE_UUID
}
fn default_key_exchange_name() -> String {
    protocol::KEY_EXCHANGE_NAME.to_string()
}
fn default_read_timeout_ms() -> u64 {
    30_000
}
fn default_close_linger_ms() -> u64 {
    2_000
}
fn default_tcp_bind() -> String {
    "127.0.0.1:7373".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default)]
    pub ble: BleSettings,

    // Key handoff Settings
    #[serde(default)]
    pub key_exchange: KeyExchangeSettings,

    /// Where authorization flags live; next to settings.json when unset
    #[serde(default)]
    pub authorization_file: Option<PathBuf>,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit path, falling back to defaults if it cannot be read.
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("Hm10SwitchController");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Resolved location of the authorization file.
    pub fn authorization_path(&self) -> PathBuf {
        match &self.settings.authorization_file {
            Some(path) => path.clone(),
            None => self
                .settings_path
                .with_file_name("authorizations.json"),
        }
    }
}
