// ⚙️ Configuration - One validated struct, loaded once at startup
//
// YAML on disk (config.yml by default). Every optional knob has a serde
// default; `validate()` rejects values the engine cannot work with.

use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::guild::{MemberId, RoleId};
use crate::logging::LogFormat;
use crate::plan::{PlanId, PlanResolver, ResolutionMode};
use crate::retry::RetryPolicy;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "PATRON_GATE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

// ============================================================================
// ROOT CONFIG
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Plan id → role granted for it. The values form the managed role set.
    pub plan_roles: BTreeMap<PlanId, RoleId>,

    /// Granted when coverage is active but no plan can be resolved
    #[serde(default)]
    pub fallback_role: Option<RoleId>,

    /// Grace period in days
    #[serde(default = "default_leeway_days")]
    pub leeway_days: i64,

    #[serde(default)]
    pub resolution: ResolutionMode,

    /// Offset used for calendar-month windows (the provider bills in JST)
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,

    pub billing: BillingConfig,

    /// One subscriber id may be bound to only one member
    #[serde(default)]
    pub strict_access: bool,

    /// Minimum seconds between two access checks from the same member
    #[serde(default = "default_access_rate_limit")]
    pub access_rate_limit_seconds: u64,

    /// Receives a direct message before a fatal shutdown
    #[serde(default)]
    pub admin_id: Option<MemberId>,

    #[serde(default)]
    pub sweep: SweepConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Creator whose plan catalog is fetched
    pub creator_id: String,

    /// Minimum spacing between two billing API calls
    #[serde(default = "default_billing_rate_limit")]
    pub rate_limit_seconds: u64,

    #[serde(default)]
    pub session_cookies: BTreeMap<String, String>,

    #[serde(default)]
    pub session_headers: BTreeMap<String, String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    #[serde(default)]
    pub run: bool,
    #[serde(default = "default_period_hours")]
    pub period_hours: u64,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    #[serde(default)]
    pub run: bool,
    #[serde(default = "default_period_hours")]
    pub period_hours: u64,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Roleless members younger than this are left alone
    #[serde(default = "default_member_age_hours")]
    pub member_age_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// ============================================================================
// DEFAULTS
// ============================================================================

fn default_database_path() -> PathBuf {
    PathBuf::from("registry.db")
}

fn default_leeway_days() -> i64 {
    5
}

fn default_utc_offset_hours() -> i32 {
    9
}

fn default_base_url() -> String {
    "https://api.fanbox.cc/".to_string()
}

fn default_billing_rate_limit() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_access_rate_limit() -> u64 {
    30
}

fn default_period_hours() -> u64 {
    24
}

fn default_timeout_minutes() -> u64 {
    60
}

fn default_member_age_hours() -> i64 {
    72
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for SweepConfig {
    fn default() -> Self {
        SweepConfig {
            run: false,
            period_hours: default_period_hours(),
            timeout_minutes: default_timeout_minutes(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig {
            run: false,
            period_hours: default_period_hours(),
            timeout_minutes: default_timeout_minutes(),
            member_age_hours: default_member_age_hours(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// ============================================================================
// LOADING + VALIDATION
// ============================================================================

impl Config {
    /// Load from `PATRON_GATE_CONFIG`, falling back to `config.yml`.
    pub fn load_default() -> Result<Config> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(Path::new(&path))
    }

    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {:?}: {}", path, e)))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Config> {
        let config: Config =
            serde_yaml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.plan_roles.is_empty() {
            return Err(SyncError::Config("plan_roles must not be empty".into()));
        }
        if !(0..=31).contains(&self.leeway_days) {
            return Err(SyncError::Config(format!(
                "leeway_days must be within 0..=31, got {}",
                self.leeway_days
            )));
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(SyncError::Config(format!(
                "utc_offset_hours must be within -12..=14, got {}",
                self.utc_offset_hours
            )));
        }
        if self.billing.rate_limit_seconds == 0 {
            return Err(SyncError::Config("billing.rate_limit_seconds must be > 0".into()));
        }
        if self.billing.creator_id.trim().is_empty() {
            return Err(SyncError::Config("billing.creator_id must not be empty".into()));
        }
        if self.sweep.run && self.sweep.period_hours == 0 {
            return Err(SyncError::Config("sweep.period_hours must be > 0".into()));
        }
        if self.cleanup.run && self.cleanup.period_hours == 0 {
            return Err(SyncError::Config("cleanup.period_hours must be > 0".into()));
        }
        if self.sweep.run && self.sweep.timeout_minutes == 0 {
            return Err(SyncError::Config("sweep.timeout_minutes must be > 0".into()));
        }
        if self.cleanup.run && self.cleanup.timeout_minutes == 0 {
            return Err(SyncError::Config("cleanup.timeout_minutes must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be >= 1".into()));
        }
        if let Some(fallback) = self.fallback_role {
            if self.plan_roles.values().any(|role| *role == fallback) {
                return Err(SyncError::Config(
                    "fallback_role must differ from every plan role".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn offset(&self) -> FixedOffset {
        // validated to -12..=14 hours
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    pub fn resolver(&self) -> PlanResolver {
        PlanResolver::new(
            self.leeway_days,
            self.resolution == ResolutionMode::RangeLimited,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn access_rate_limit(&self) -> Duration {
        Duration::from_secs(self.access_rate_limit_seconds)
    }
}

impl SweepConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_hours * 3600)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }
}

impl CleanupConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_hours * 3600)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
plan_roles:
  "1": 1001
  "2": 1002
billing:
  creator_id: "creator"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_yaml_str(MINIMAL).unwrap();

        assert_eq!(config.database_path, PathBuf::from("registry.db"));
        assert_eq!(config.leeway_days, 5);
        assert_eq!(config.resolution, ResolutionMode::RangeLimited);
        assert_eq!(config.billing.rate_limit_seconds, 5);
        assert_eq!(config.billing.base_url, "https://api.fanbox.cc/");
        assert!(!config.strict_access);
        assert!(!config.sweep.run);
        assert_eq!(config.cleanup.member_age_hours, 72);
        assert_eq!(config.offset().local_minus_utc(), 9 * 3600);
        assert!(config.resolver().limit_range);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
database_path: /var/lib/patron-gate/registry.db
plan_roles:
  "1": 1001
  "2": 1002
  "3": 1003
fallback_role: 1999
leeway_days: 3
resolution: highest_ever
utc_offset_hours: 0
strict_access: true
access_rate_limit_seconds: 10
admin_id: 42
billing:
  creator_id: "creator"
  rate_limit_seconds: 2
  session_cookies:
    FANBOXSESSID: "secret"
  session_headers:
    Origin: "https://www.fanbox.cc"
sweep:
  run: true
  period_hours: 12
cleanup:
  run: true
  period_hours: 6
  member_age_hours: 24
retry:
  max_attempts: 5
log:
  format: json
"#;
        let config = Config::from_yaml_str(yaml).unwrap();

        assert_eq!(config.plan_roles.len(), 3);
        assert_eq!(config.fallback_role, Some(RoleId(1999)));
        assert_eq!(config.resolution, ResolutionMode::HighestEver);
        assert!(!config.resolver().limit_range);
        assert_eq!(config.admin_id, Some(MemberId(42)));
        assert_eq!(config.billing.session_cookies["FANBOXSESSID"], "secret");
        assert_eq!(config.sweep.period(), Duration::from_secs(12 * 3600));
        assert_eq!(config.sweep.timeout(), Duration::from_secs(3600));
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let empty_roles = "plan_roles: {}\nbilling:\n  creator_id: c\n";
        assert!(Config::from_yaml_str(empty_roles).is_err());

        let bad_leeway = format!("{}leeway_days: 40\n", MINIMAL);
        assert!(Config::from_yaml_str(&bad_leeway).is_err());

        let zero_rate = MINIMAL.replace("creator_id: \"creator\"", "creator_id: \"creator\"\n  rate_limit_seconds: 0");
        assert!(Config::from_yaml_str(&zero_rate).is_err());

        let clashing_fallback = format!("{}fallback_role: 1001\n", MINIMAL);
        assert!(Config::from_yaml_str(&clashing_fallback).is_err());
    }

    #[test]
    fn test_zero_timeout_rejected_only_when_running() {
        let idle_sweep = format!("{}sweep:\n  run: false\n  timeout_minutes: 0\n", MINIMAL);
        assert!(Config::from_yaml_str(&idle_sweep).is_ok());

        let live_sweep = format!("{}sweep:\n  run: true\n  timeout_minutes: 0\n", MINIMAL);
        let err = Config::from_yaml_str(&live_sweep).unwrap_err();
        assert!(err.to_string().contains("sweep.timeout_minutes"));

        let live_cleanup = format!("{}cleanup:\n  run: true\n  timeout_minutes: 0\n", MINIMAL);
        assert!(Config::from_yaml_str(&live_cleanup).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.plan_roles.len(), 2);

        assert!(Config::load(&dir.path().join("missing.yml")).is_err());
    }
}
