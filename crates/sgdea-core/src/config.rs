//! SGDEA configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SgdeaError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SgdeaConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub triggers: TriggerConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub sms: SmsConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub reports: ReportConfig,
}

impl SgdeaConfig {
    /// Load config from the default path (~/.sgdea/config.toml).
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
            .map_err(|e| SgdeaError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SgdeaError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| SgdeaError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the SGDEA home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".sgdea")
    }

    /// Apply `SGDEA_*` environment overrides for secrets and the database path.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("SGDEA_DATABASE_PATH").filter(|v| !v.is_empty()) {
            self.database.path = path;
        }
        if let Some(password) = lookup("SGDEA_SMTP_PASSWORD").filter(|v| !v.is_empty()) {
            self.email.password = password;
        }
        if let Some(key) = lookup("SGDEA_SMS_API_KEY").filter(|v| !v.is_empty()) {
            self.sms.api_key = key;
        }
    }

    /// Reject settings the jobs cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(SgdeaError::Config("database.path is empty".into()));
        }
        if self.notifications.admin_role.trim().is_empty() {
            return Err(SgdeaError::Config("notifications.admin_role is empty".into()));
        }
        if self.notifications.overdue_window_days == 0
            || self.notifications.approaching_window_days == 0
        {
            return Err(SgdeaError::Config("dedupe windows must be at least one day".into()));
        }
        if self.notifications.dispatch_window_minutes == 0 {
            return Err(SgdeaError::Config("notifications.dispatch_window_minutes must be positive".into()));
        }
        if self.email.enabled && (self.email.smtp_host.is_empty() || self.email.from_address.is_empty()) {
            return Err(SgdeaError::Config(
                "email is enabled but smtp_host or from_address is missing".into(),
            ));
        }
        if self.sms.enabled && self.sms.gateway_url.is_empty() {
            return Err(SgdeaError::Config("sms is enabled but gateway_url is missing".into()));
        }
        Ok(())
    }
}

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.sgdea/sgdea.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Notification materialization and dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Role whose members receive notifications for ownerless records.
    #[serde(default = "default_admin_role")]
    pub admin_role: String,
    /// Dedupe window for "overdue"/"expired" notification types.
    #[serde(default = "default_overdue_window")]
    pub overdue_window_days: u32,
    /// Dedupe window for "approaching" notification types.
    #[serde(default = "default_approaching_window")]
    pub approaching_window_days: u32,
    /// How far back the dispatcher looks for fresh notifications.
    #[serde(default = "default_dispatch_window")]
    pub dispatch_window_minutes: u32,
}

fn default_admin_role() -> String { "admin".into() }
fn default_overdue_window() -> u32 { 3 }
fn default_approaching_window() -> u32 { 7 }
fn default_dispatch_window() -> u32 { 10 }

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            admin_role: default_admin_role(),
            overdue_window_days: default_overdue_window(),
            approaching_window_days: default_approaching_window(),
            dispatch_window_minutes: default_dispatch_window(),
        }
    }
}

/// Thresholds for the trigger predicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Age at which a case file still in `gestion` is overdue for transfer.
    #[serde(default = "default_expediente_max_age")]
    pub expediente_max_age_months: u32,
    #[serde(default = "default_expediente_warning")]
    pub expediente_warning_days: u32,
    #[serde(default = "default_loan_warning")]
    pub loan_warning_days: u32,
    #[serde(default = "default_certificate_warning")]
    pub certificate_warning_days: u32,
    #[serde(default = "default_task_warning")]
    pub task_warning_hours: u32,
}

fn default_expediente_max_age() -> u32 { 24 }
fn default_expediente_warning() -> u32 { 30 }
fn default_loan_warning() -> u32 { 3 }
fn default_certificate_warning() -> u32 { 30 }
fn default_task_warning() -> u32 { 24 }

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            expediente_max_age_months: default_expediente_max_age(),
            expediente_warning_days: default_expediente_warning(),
            loan_warning_days: default_loan_warning(),
            certificate_warning_days: default_certificate_warning(),
            task_warning_hours: default_task_warning(),
        }
    }
}

/// Overdue task escalation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Escalations allowed before a task is marked failed.
    #[serde(default = "default_max_levels")]
    pub max_levels: u32,
    /// New deadline granted to the escalation target.
    #[serde(default = "default_extension_hours")]
    pub extension_hours: u32,
    /// Role used when nobody is configured up the chain.
    #[serde(default = "default_admin_role")]
    pub fallback_role: String,
}

fn default_max_levels() -> u32 { 3 }
fn default_extension_hours() -> u32 { 48 }

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_levels: default_max_levels(),
            extension_hours: default_extension_hours(),
            fallback_role: default_admin_role(),
        }
    }
}

/// Age thresholds for the housekeeping job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_archived_days")]
    pub archived_days: u32,
    #[serde(default = "default_read_days")]
    pub read_days: u32,
    #[serde(default = "default_non_critical_days")]
    pub non_critical_days: u32,
    #[serde(default = "default_workflow_days")]
    pub workflow_archive_days: u32,
}

fn default_archived_days() -> u32 { 90 }
fn default_read_days() -> u32 { 180 }
fn default_non_critical_days() -> u32 { 365 }
fn default_workflow_days() -> u32 { 180 }

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            archived_days: default_archived_days(),
            read_days: default_read_days(),
            non_critical_days: default_non_critical_days(),
            workflow_archive_days: default_workflow_days(),
        }
    }
}

/// SMTP delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
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
    #[serde(default = "default_from_name")]
    pub from_name: String,
}

fn default_smtp_port() -> u16 { 587 }
fn default_from_name() -> String { "SGDEA".into() }

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_address: String::new(),
            from_name: default_from_name(),
        }
    }
}

/// HTTP SMS gateway delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub gateway_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_from_name")]
    pub sender_id: String,
    #[serde(default = "default_sms_timeout")]
    pub timeout_secs: u64,
}

fn default_sms_timeout() -> u64 { 10 }

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gateway_url: String::new(),
            api_key: String::new(),
            sender_id: default_from_name(),
            timeout_secs: default_sms_timeout(),
        }
    }
}

/// Cron expressions (MIN HOUR DOM MON DOW) for `sgdea schedule`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_scan_cron")]
    pub scan: String,
    #[serde(default = "default_dispatch_cron")]
    pub dispatch: String,
    #[serde(default = "default_escalate_cron")]
    pub escalate: String,
    #[serde(default = "default_cleanup_cron")]
    pub cleanup: String,
}

fn default_check_interval() -> u64 { 30 }
fn default_scan_cron() -> String { "0 7 * * *".into() }
fn default_dispatch_cron() -> String { "*/10 * * * *".into() }
fn default_escalate_cron() -> String { "0 * * * *".into() }
fn default_cleanup_cron() -> String { "30 2 * * 0".into() }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            scan: default_scan_cron(),
            dispatch: default_dispatch_cron(),
            escalate: default_escalate_cron(),
            cleanup: default_cleanup_cron(),
        }
    }
}

/// JSON run reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_report_dir")]
    pub dir: String,
}

fn default_report_dir() -> String { "~/.sgdea/reports".into() }

impl Default for ReportConfig {
    fn default() -> Self {
        Self { dir: default_report_dir() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SgdeaConfig::default();
        assert_eq!(config.notifications.admin_role, "admin");
        assert_eq!(config.notifications.overdue_window_days, 3);
        assert_eq!(config.notifications.approaching_window_days, 7);
        assert_eq!(config.notifications.dispatch_window_minutes, 10);
        assert_eq!(config.retention.archived_days, 90);
        assert_eq!(config.retention.non_critical_days, 365);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [database]
            path = "/var/lib/sgdea/sgdea.db"

            [escalation]
            max_levels = 1
            fallback_role = "jefe_archivo"

            [email]
            enabled = true
            smtp_host = "smtp.example.org"
            from_address = "archivo@example.org"
        "#;

        let config: SgdeaConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.path, "/var/lib/sgdea/sgdea.db");
        assert_eq!(config.escalation.max_levels, 1);
        assert_eq!(config.escalation.fallback_role, "jefe_archivo");
        assert_eq!(config.escalation.extension_hours, 48);
        assert_eq!(config.email.smtp_port, 587);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: SgdeaConfig = toml::from_str("").unwrap();
        assert_eq!(config.schedule.dispatch, "*/10 * * * *");
        assert_eq!(config.triggers.expediente_max_age_months, 24);
    }

    #[test]
    fn test_validate_rejects_incomplete_channels() {
        let mut config = SgdeaConfig::default();
        config.email.enabled = true;
        assert!(matches!(config.validate(), Err(SgdeaError::Config(_))));

        let mut config = SgdeaConfig::default();
        config.sms.enabled = true;
        assert!(config.validate().is_err());

        let mut config = SgdeaConfig::default();
        config.notifications.overdue_window_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SGDEA_DATABASE_PATH", "/tmp/override.db"),
            ("SGDEA_SMS_API_KEY", "secret-key"),
            ("SGDEA_SMTP_PASSWORD", ""),
        ]);
        let mut config = SgdeaConfig::default();
        config.email.password = "from-file".into();
        config.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.database.path, "/tmp/override.db");
        assert_eq!(config.sms.api_key, "secret-key");
        assert_eq!(config.email.password, "from-file");
    }

    #[test]
    fn test_home_dir() {
        let home = SgdeaConfig::home_dir();
        assert!(home.to_string_lossy().contains(".sgdea"));
    }
}
