//! Server configuration management
//!
//! Configuration is loaded and validated once, then passed into each
//! component as an immutable value at construction.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub state: StateSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// TCP port to listen on (the usbip default is 3240)
    #[serde(default = "NetworkSettings::default_port")]
    pub port: u16,
    /// Maximum simultaneously accepted connections
    #[serde(default = "NetworkSettings::default_max_connections")]
    pub max_connections: usize,
}

impl NetworkSettings {
    fn default_port() -> u16 {
        3240
    }

    fn default_max_connections() -> usize {
        16
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            max_connections: Self::default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Concurrent in-flight requests allowed per connection
    #[serde(default = "LimitSettings::default_per_connection")]
    pub max_concurrent_requests: usize,
    /// Concurrent in-flight requests allowed server-wide
    #[serde(default = "LimitSettings::default_total")]
    pub max_total_concurrent_requests: usize,
    /// Pending URBs allowed per device
    #[serde(default = "LimitSettings::default_per_device")]
    pub max_pending_urbs_per_device: usize,
    /// Deadline for one USB operation (e.g. "5s", "1m30s")
    #[serde(default = "LimitSettings::default_timeout", with = "duration_serde")]
    pub usb_operation_timeout: Duration,
    /// Maximum transfer buffer accepted or produced, in bytes
    #[serde(default = "LimitSettings::default_max_buffer")]
    pub max_usb_buffer_size: usize,
}

impl LimitSettings {
    fn default_per_connection() -> usize {
        64
    }

    fn default_total() -> usize {
        256
    }

    fn default_per_device() -> usize {
        32
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn default_max_buffer() -> usize {
        1024 * 1024
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: Self::default_per_connection(),
            max_total_concurrent_requests: Self::default_total(),
            max_pending_urbs_per_device: Self::default_per_device(),
            usb_operation_timeout: Self::default_timeout(),
            max_usb_buffer_size: Self::default_max_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsbSettings {
    /// Device allow-list (VID:PID patterns, e.g. "0x1234:0x5678" or
    /// "0x1234:*"); empty allows every device
    #[serde(default)]
    pub allowed_devices: Vec<String>,
    /// Claim every allow-listed device at startup and on arrival
    #[serde(default)]
    pub auto_bind_devices: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSettings {
    /// Where the persisted claim set lives
    #[serde(default = "StateSettings::default_claim_state_path")]
    pub claim_state_path: PathBuf,
}

impl StateSettings {
    fn default_claim_state_path() -> PathBuf {
        if let Some(data_dir) = dirs::data_local_dir() {
            data_dir.join("usbip-host").join("claims.json")
        } else {
            PathBuf::from("/var/lib/usbip-host/claims.json")
        }
    }
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            claim_state_path: Self::default_claim_state_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Custom serde module for human-readable durations ("5s", "1m30s", "1h")
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "1h", "30m", "1h30m", "500ms"
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total = Duration::ZERO;
        let mut current_num = String::new();
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                current_num.push(c);
                continue;
            }

            if current_num.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            current_num.clear();

            match c {
                'h' => total += Duration::from_secs(num * 3600),
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    total += Duration::from_millis(num);
                }
                'm' => total += Duration::from_secs(num * 60),
                's' => total += Duration::from_secs(num),
                _ => return Err(format!("Invalid duration unit: {}", c)),
            }
        }

        // A bare trailing number means seconds
        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            total += Duration::from_secs(num);
        }

        if total == Duration::ZERO {
            return Err("Duration must be greater than 0".to_string());
        }

        Ok(total)
    }

    fn format_duration(d: Duration) -> String {
        let millis = d.subsec_millis();
        let secs = d.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 || (result.is_empty() && millis == 0) {
            result.push_str(&format!("{}s", secs));
        }
        if millis > 0 {
            result.push_str(&format!("{}ms", millis));
        }
        result
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: NetworkSettings::default(),
            limits: LimitSettings::default(),
            usb: UsbSettings::default(),
            state: StateSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbip-host/server.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbip-host").join("server.toml")
        } else {
            PathBuf::from(".config/usbip-host/server.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.network.max_connections == 0 {
            return Err(anyhow!("max_connections must be greater than 0"));
        }

        if self.limits.max_concurrent_requests == 0
            || self.limits.max_total_concurrent_requests == 0
            || self.limits.max_pending_urbs_per_device == 0
        {
            return Err(anyhow!("concurrent-request limits must be greater than 0"));
        }

        if self.limits.max_total_concurrent_requests < self.limits.max_concurrent_requests {
            return Err(anyhow!(
                "max_total_concurrent_requests ({}) must be at least max_concurrent_requests ({})",
                self.limits.max_total_concurrent_requests,
                self.limits.max_concurrent_requests
            ));
        }

        if self.limits.usb_operation_timeout == Duration::ZERO {
            return Err(anyhow!("usb_operation_timeout must be greater than 0"));
        }

        if self.limits.max_usb_buffer_size == 0 {
            return Err(anyhow!("max_usb_buffer_size must be greater than 0"));
        }

        for filter in &self.usb.allowed_devices {
            Self::validate_filter(filter)?;
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Expand a user-supplied config path ("~/..." etc.)
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
