use crate::domain::alerts::{AlertPolicy, DEFAULT_IGNORED_BITS};
use crate::domain::machine::MachineOptions;
use crate::infrastructure::bluetooth::connection::LinkTiming;
use crate::infrastructure::bluetooth::polling::PollPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
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
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
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
    "jura_ble".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Discovery
    /// Connect to this address only; otherwise the first Jura machine seen
    #[serde(default)]
    pub device_address: Option<String>,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,
    #[serde(default = "default_machine_name")]
    pub machine_name: String,
    /// Statistics and alert refresh period
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,

    // Link Timing
    #[serde(default = "default_active_time_secs")]
    pub active_time_secs: u64,
    #[serde(default = "default_command_grace_secs")]
    pub command_grace_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    // Polling
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_connect_wait_secs")]
    pub connect_wait_secs: u64,

    // Alerts
    #[serde(default = "default_ignored_alert_bits")]
    pub ignored_alert_bits: BTreeSet<u16>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),

            device_address: None,
            scan_timeout_secs: default_scan_timeout_secs(),
            catalog_path: default_catalog_path(),
            machine_name: default_machine_name(),
            update_interval_secs: default_update_interval_secs(),

            active_time_secs: default_active_time_secs(),
            command_grace_secs: default_command_grace_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_attempts: default_connect_attempts(),
            connect_timeout_secs: default_connect_timeout_secs(),

            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            write_attempts: default_write_attempts(),
            write_timeout_ms: default_write_timeout_ms(),
            connect_wait_secs: default_connect_wait_secs(),

            ignored_alert_bits: default_ignored_alert_bits(),
        }
    }
}

fn default_scan_timeout_secs() -> u64 {
    15
}
fn default_catalog_path() -> String {
    "resources.zip".to_string()
}
fn default_machine_name() -> String {
    "Jura".to_string()
}
fn default_update_interval_secs() -> u64 {
    60
}
fn default_active_time_secs() -> u64 {
    120
}
fn default_command_grace_secs() -> u64 {
    10
}
fn default_heartbeat_interval_secs() -> u64 {
    9
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_connect_timeout_secs() -> u64 {
    20
}
fn default_poll_attempts() -> u32 {
    30
}
fn default_poll_interval_ms() -> u64 {
    800
}
fn default_write_attempts() -> u32 {
    30
}
fn default_write_timeout_ms() -> u64 {
    2000
}
fn default_connect_wait_secs() -> u64 {
    20
}
fn default_ignored_alert_bits() -> BTreeSet<u16> {
    DEFAULT_IGNORED_BITS.into_iter().collect()
}

impl Settings {
    pub fn link_timing(&self) -> LinkTiming {
        LinkTiming {
            active_time: Duration::from_secs(self.active_time_secs),
            command_grace: Duration::from_secs(self.command_grace_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            connect_attempts: self.connect_attempts,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.poll_attempts,
            interval: Duration::from_millis(self.poll_interval_ms),
            write_attempts: self.write_attempts,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            connect_wait: Duration::from_secs(self.connect_wait_secs),
        }
    }

    pub fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy {
            ignored_bits: self.ignored_alert_bits.clone(),
        }
    }

    pub fn machine_options(&self) -> MachineOptions {
        MachineOptions {
            timing: self.link_timing(),
            poll: self.poll_policy(),
            alert_policy: self.alert_policy(),
        }
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from `settings_path`, falling back to defaults when it is missing
    /// or unreadable
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("JuraBle");
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

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Remember the machine so later runs connect to it directly
    pub fn remember_device(&mut self, address: &str) -> anyhow::Result<()> {
        if self.settings.device_address.as_deref() != Some(address) {
            self.settings.device_address = Some(address.to_string());
            self.save()?;
        }
        Ok(())
    }
}
