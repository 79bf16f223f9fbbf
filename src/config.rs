use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::FixedOffset;
use serde::Deserialize;
use thiserror::Error;

use crate::monitoring::transition::AlertPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Whether checks are scheduled at all.
    pub monitoring_live: bool,
    pub probe_timeout_seconds: u64,
    /// Offset used when showing next/last run times, e.g. `+02:00`.
    pub display_utc_offset: String,
    pub log_dir: String,
    pub database_url: Option<String>,

    pub email_alerts_enabled: bool,
    pub sms_alerts_enabled: bool,
    pub alert_email_to: Option<String>,
    pub alert_sms_to: Option<String>,
    pub mail_relay_url: Option<String>,
    pub mail_from: String,
    pub twilio_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_phone_number: Option<String>,

    /// Where HTTP timing breakdowns are archived. Unset disables archival.
    pub document_store_url: Option<String>,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialMonitorConfig {
    monitoring_live: Option<bool>,
    probe_timeout_seconds: Option<u64>,
    display_utc_offset: Option<String>,
    log_dir: Option<String>,
    database_url: Option<String>,
    email_alerts_enabled: Option<bool>,
    sms_alerts_enabled: Option<bool>,
    alert_email_to: Option<String>,
    alert_sms_to: Option<String>,
    mail_relay_url: Option<String>,
    mail_from: Option<String>,
    twilio_sid: Option<String>,
    twilio_auth_token: Option<String>,
    twilio_phone_number: Option<String>,
    document_store_url: Option<String>,
}

fn default_probe_timeout_seconds() -> u64 {
    10
}

fn default_display_utc_offset() -> String {
    "+00:00".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_mail_from() -> String {
    "monitor@localhost".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::merge(PartialMonitorConfig::default(), PartialMonitorConfig::default())
    }
}

impl MonitorConfig {
    /// Loads `.env`, then layers environment variables over the optional TOML
    /// file over defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::load_layered(config_path, std::env::vars())
    }

    pub fn load_layered<I>(config_path: Option<&str>, env: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        // 1. Load from file (optional)
        let file_config: PartialMonitorConfig = match config_path.map(Path::new) {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&contents)?
            }
            _ => PartialMonitorConfig::default(),
        };

        // 2. Load from environment variables
        let env_config: PartialMonitorConfig = envy::from_iter(env)?;

        // 3. Merge: environment overrides file
        let config = Self::merge(env_config, file_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(env: PartialMonitorConfig, file: PartialMonitorConfig) -> Self {
        Self {
            monitoring_live: env.monitoring_live.or(file.monitoring_live).unwrap_or(true),
            probe_timeout_seconds: env
                .probe_timeout_seconds
                .or(file.probe_timeout_seconds)
                .unwrap_or_else(default_probe_timeout_seconds),
            display_utc_offset: env
                .display_utc_offset
                .or(file.display_utc_offset)
                .unwrap_or_else(default_display_utc_offset),
            log_dir: env.log_dir.or(file.log_dir).unwrap_or_else(default_log_dir),
            database_url: env.database_url.or(file.database_url),
            email_alerts_enabled: env
                .email_alerts_enabled
                .or(file.email_alerts_enabled)
                .unwrap_or(false),
            sms_alerts_enabled: env
                .sms_alerts_enabled
                .or(file.sms_alerts_enabled)
                .unwrap_or(false),
            alert_email_to: env.alert_email_to.or(file.alert_email_to),
            alert_sms_to: env.alert_sms_to.or(file.alert_sms_to),
            mail_relay_url: env.mail_relay_url.or(file.mail_relay_url),
            mail_from: env.mail_from.or(file.mail_from).unwrap_or_else(default_mail_from),
            twilio_sid: env.twilio_sid.or(file.twilio_sid),
            twilio_auth_token: env.twilio_auth_token.or(file.twilio_auth_token),
            twilio_phone_number: env.twilio_phone_number.or(file.twilio_phone_number),
            document_store_url: env.document_store_url.or(file.document_store_url),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "probe_timeout_seconds must be at least 1".to_string(),
            ));
        }
        self.display_offset()?;
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy {
            email_enabled: self.email_alerts_enabled,
            sms_enabled: self.sms_alerts_enabled,
        }
    }

    pub fn display_offset(&self) -> Result<FixedOffset, ConfigError> {
        parse_utc_offset(&self.display_utc_offset)
    }
}

/// Accepts `UTC`, `Z`, `+HH`, `+HHMM` and `+HH:MM` (or `-`).
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset, ConfigError> {
    let invalid = || ConfigError::Invalid(format!("Invalid UTC offset '{raw}'"));
    let value = raw.trim();
    if value.eq_ignore_ascii_case("utc") || value.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = if let Some(rest) = value.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = value.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(invalid());
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let (hours, minutes) = match digits.len() {
        2 => (&digits[..2], "0"),
        4 => (&digits[..2], &digits[2..]),
        _ => return Err(invalid()),
    };
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_without_file_or_env() {
        let config = MonitorConfig::load_layered(None, Vec::new()).unwrap();
        assert_eq!(config, MonitorConfig::default());
        assert!(config.monitoring_live);
        assert_eq!(config.probe_timeout(), Duration::from_secs(10));
        assert_eq!(config.log_dir, "logs");
        assert_eq!(config.alert_policy(), AlertPolicy::default());
        assert_eq!(config.display_offset().unwrap().local_minus_utc(), 0);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "monitoring_live = false\nprobe_timeout_seconds = 5\nlog_dir = \"/var/log/monitor\"\nemail_alerts_enabled = true"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = MonitorConfig::load_layered(
            Some(&path),
            env(&[("PROBE_TIMEOUT_SECONDS", "30"), ("ALERT_EMAIL_TO", "ops@example.com")]),
        )
        .unwrap();

        assert!(!config.monitoring_live);
        assert_eq!(config.probe_timeout_seconds, 30);
        assert_eq!(config.log_dir, "/var/log/monitor");
        assert_eq!(config.alert_email_to.as_deref(), Some("ops@example.com"));
        assert!(config.alert_policy().email_enabled);
        assert!(!config.alert_policy().sms_enabled);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config =
            MonitorConfig::load_layered(Some("/nonexistent/monitor.toml"), Vec::new()).unwrap();
        assert_eq!(config, MonitorConfig::default());
    }

    #[test]
    fn test_malformed_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "probe_timeout_seconds = \"soon\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        assert!(matches!(
            MonitorConfig::load_layered(Some(&path), Vec::new()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            MonitorConfig::load_layered(None, env(&[("PROBE_TIMEOUT_SECONDS", "0")])),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            MonitorConfig::load_layered(None, env(&[("DISPLAY_UTC_OFFSET", "Mars/Olympus")])),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            MonitorConfig::load_layered(None, env(&[("MONITORING_LIVE", "maybe")])),
            Err(ConfigError::Env(_))
        ));
    }

    #[test]
    fn test_parse_utc_offset_forms() {
        assert_eq!(parse_utc_offset("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_utc_offset("+02:00").unwrap().local_minus_utc(), 7200);
        assert_eq!(parse_utc_offset("-0530").unwrap().local_minus_utc(), -19800);
        assert_eq!(parse_utc_offset("+09").unwrap().local_minus_utc(), 32400);
        for bad in ["", "02:00", "+2:00", "+15:00", "+01:60", "+ab:cd"] {
            assert!(parse_utc_offset(bad).is_err(), "{bad} should be rejected");
        }
    }
}
