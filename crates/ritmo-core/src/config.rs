//! Ritmo configuration system.

use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, RitmoError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RitmoConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cadence: CadenceConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub email: EmailConfig,
    /// Per-organization overrides, keyed by organization id.
    #[serde(default)]
    pub organizations: HashMap<String, OrganizationConfig>,
}

impl RitmoConfig {
    /// Load config from the default path (~/.ritmo/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RitmoError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| RitmoError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| RitmoError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Ritmo home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ritmo")
    }

    /// Check every value that can only be wrong at startup.
    pub fn validate(&self) -> Result<()> {
        parse_timezone(&self.calendar.default_timezone)?;
        parse_time_of_day(&self.calendar.send_time)?;
        for h in &self.calendar.fixed_holidays {
            h.validate()?;
        }
        for h in &self.calendar.movable_holidays {
            h.validate()?;
        }
        if self.scheduler.batch_size == 0 {
            return Err(RitmoError::Config("scheduler.batch_size must be > 0".into()));
        }
        if self.scheduler.claim_timeout_minutes == 0 {
            return Err(RitmoError::Config(
                "scheduler.claim_timeout_minutes must be > 0".into(),
            ));
        }
        if self.scheduler.max_attempts == 0 {
            return Err(RitmoError::Config("scheduler.max_attempts must be > 0".into()));
        }
        if !self.cadence.high_value_threshold.is_finite() {
            return Err(RitmoError::Config(
                "cadence.high_value_threshold must be a finite number".into(),
            ));
        }
        for (org_id, org) in &self.organizations {
            if let Some(tz) = &org.timezone {
                parse_timezone(tz)
                    .map_err(|e| RitmoError::Config(format!("organization '{org_id}': {e}")))?;
            }
            for t in [&org.send_window_start, &org.send_window_end].into_iter().flatten() {
                parse_time_of_day(t)
                    .map_err(|e| RitmoError::Config(format!("organization '{org_id}': {e}")))?;
            }
        }
        Ok(())
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| RitmoError::Config(format!("invalid timezone '{name}'")))
}

/// Parse "HH:MM" or "HH:MM:SS".
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| RitmoError::Config(format!("invalid time of day '{s}' (expected HH:MM)")))
}

/// SQLite store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> String { "~/.ritmo/ritmo.db".into() }
fn default_busy_timeout() -> u64 { 5000 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn expanded_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Constants of the fixed four-step cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// Quotes worth at least this much get a HIGH priority call.
    #[serde(default = "default_high_value_threshold")]
    pub high_value_threshold: f64,
    #[serde(default)]
    pub offsets: CadenceOffsets,
}

fn default_high_value_threshold() -> f64 { 1000.0 }

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            high_value_threshold: default_high_value_threshold(),
            offsets: CadenceOffsets::default(),
        }
    }
}

/// Business-day offsets from the send date, one per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceOffsets {
    #[serde(default = "default_offset_d1")]
    pub email_d1: u32,
    #[serde(default = "default_offset_d3")]
    pub email_d3: u32,
    #[serde(default = "default_offset_d7")]
    pub call_d7: u32,
    #[serde(default = "default_offset_d14")]
    pub email_d14: u32,
}

fn default_offset_d1() -> u32 { 1 }
fn default_offset_d3() -> u32 { 3 }
fn default_offset_d7() -> u32 { 7 }
fn default_offset_d14() -> u32 { 14 }

impl Default for CadenceOffsets {
    fn default() -> Self {
        Self {
            email_d1: default_offset_d1(),
            email_d3: default_offset_d3(),
            call_d7: default_offset_d7(),
            email_d14: default_offset_d14(),
        }
    }
}

/// Business calendar configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    /// Local time of day every computed due date lands on.
    #[serde(default = "default_send_time")]
    pub send_time: String,
    /// Built-in holiday set: "PT" or "none".
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub fixed_holidays: Vec<FixedHolidayConfig>,
    #[serde(default)]
    pub movable_holidays: Vec<MovableHolidayConfig>,
}

fn default_timezone() -> String { "Europe/Lisbon".into() }
fn default_send_time() -> String { "09:00".into() }
fn default_region() -> String { "PT".into() }

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            default_timezone: default_timezone(),
            send_time: default_send_time(),
            region: default_region(),
            fixed_holidays: Vec::new(),
            movable_holidays: Vec::new(),
        }
    }
}

/// Holiday on the same month/day every year.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedHolidayConfig {
    pub month: u32,
    pub day: u32,
    #[serde(default)]
    pub name: String,
}

impl FixedHolidayConfig {
    pub fn validate(&self) -> Result<()> {
        // 2024 is a leap year, so Feb 29 is accepted.
        NaiveDate::from_ymd_opt(2024, self.month, self.day)
            .map(|_| ())
            .ok_or_else(|| {
                RitmoError::Config(format!(
                    "malformed fixed holiday '{}': {}/{} is not a calendar day",
                    self.name, self.month, self.day
                ))
            })
    }
}

/// Holiday defined relative to Easter Sunday.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovableHolidayConfig {
    /// Days after Easter Sunday (negative = before).
    pub easter_offset: i32,
    #[serde(default)]
    pub name: String,
}

impl MovableHolidayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.easter_offset.abs() > 200 {
            return Err(RitmoError::Config(format!(
                "malformed movable holiday '{}': easter offset {} out of range",
                self.name, self.easter_offset
            )));
        }
        Ok(())
    }
}

/// Claim processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_minutes: u32,
    /// Failed automatic sends before the event is downgraded to a manual task.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Runner identity written to `claimed_by`. Generated when absent.
    #[serde(default)]
    pub worker_id: Option<String>,
}

fn default_poll_interval() -> u64 { 300 }
fn default_batch_size() -> u32 { 50 }
fn default_claim_timeout() -> u32 { 15 }
fn default_max_attempts() -> u32 { 3 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            claim_timeout_minutes: default_claim_timeout(),
            max_attempts: default_max_attempts(),
            worker_id: None,
        }
    }
}

/// SMTP sending configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub from_name: Option<String>,
    /// Overrides for the built-in templates, keyed by template code.
    #[serde(default)]
    pub templates: HashMap<String, EmailTemplateConfig>,
}

fn default_smtp_port() -> u16 { 587 }

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_address: String::new(),
            from_name: None,
            templates: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplateConfig {
    pub subject: String,
    pub body: String,
}

/// Per-organization settings. Missing fields fall back to the calendar
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrganizationConfig {
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub send_window_start: Option<String>,
    #[serde(default)]
    pub send_window_end: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RitmoConfig::default();
        assert_eq!(config.calendar.default_timezone, "Europe/Lisbon");
        assert_eq!(config.scheduler.claim_timeout_minutes, 15);
        assert!((config.cadence.high_value_threshold - 1000.0).abs() < f64::EPSILON);
        assert_eq!(config.cadence.offsets.call_d7, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [calendar]
            default_timezone = "America/Sao_Paulo"
            region = "none"
            fixed_holidays = [{ month = 9, day = 7, name = "Independencia" }]

            [scheduler]
            batch_size = 10

            [organizations.acme]
            timezone = "Europe/Madrid"
            send_window_start = "09:30"
        "#;

        let config: RitmoConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.calendar.default_timezone, "America/Sao_Paulo");
        assert_eq!(config.calendar.fixed_holidays.len(), 1);
        assert_eq!(config.scheduler.batch_size, 10);
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(
            config.organizations["acme"].timezone.as_deref(),
            Some("Europe/Madrid")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: RitmoConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.poll_interval_secs, 300);
        assert_eq!(config.calendar.send_time, "09:00");
        assert_eq!(config.database.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_invalid_timezone_is_config_error() {
        let mut config = RitmoConfig::default();
        config.calendar.default_timezone = "Mars/Olympus".into();
        assert!(matches!(config.validate(), Err(RitmoError::Config(_))));
    }

    #[test]
    fn test_malformed_holiday_is_config_error() {
        let mut config = RitmoConfig::default();
        config.calendar.fixed_holidays.push(FixedHolidayConfig {
            month: 2,
            day: 30,
            name: "nope".into(),
        });
        assert!(matches!(config.validate(), Err(RitmoError::Config(_))));
    }

    #[test]
    fn test_org_send_window_validated() {
        let mut config = RitmoConfig::default();
        config.organizations.insert(
            "acme".into(),
            OrganizationConfig {
                send_window_end: Some("25:00".into()),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_home_dir() {
        let home = RitmoConfig::home_dir();
        assert!(home.to_string_lossy().contains("ritmo"));
    }
}
