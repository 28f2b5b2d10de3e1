use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use sapn_adapters::{InovarPortalConfig, DEFAULT_BASE_URL, DEFAULT_REQUEST_TOKEN, DEFAULT_USER_AGENT};
use sapn_notify::{SmtpConfig, DEFAULT_SMTP_PORT, DEFAULT_SUBJECT_PREFIX};
use sapn_storage::{HttpClientConfig, StoreConfig};
use thiserror::Error;

use crate::DriverOptions;

pub const DEFAULT_DATABASE_PATH: &str = "alerts.db";
pub const DEFAULT_CHECK_CRON: &str = "0 0 14 * * *";
pub const DEFAULT_WEB_PORT: u16 = 8000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Process configuration, read once at startup and handed to constructors.
///
/// Credentials are optional at parse time so that dry runs and read-only
/// commands work without them; [`AppConfig::portal_config`],
/// [`AppConfig::smtp_config`] and [`AppConfig::require_all`] enforce them.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub portal_base_url: String,
    pub portal_username: Option<String>,
    pub portal_password: Option<String>,
    pub portal_request_token: String,
    pub proxy_url: Option<String>,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,
    pub smtp_from: Option<String>,
    pub recipients: Vec<String>,
    pub database_path: PathBuf,
    pub store_busy_timeout_secs: u64,
    pub timezone: Tz,
    pub scheduler_enabled: bool,
    pub check_cron: String,
    pub retry_unnotified: bool,
    pub notify_on_failure: bool,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub web_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // blank values count as unset
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let timezone = match get("TIMEZONE") {
            Some(name) => name.parse::<Tz>().map_err(|e| ConfigError::Invalid {
                var: "TIMEZONE".to_string(),
                reason: e.to_string(),
            })?,
            None => chrono_tz::Europe::Lisbon,
        };

        Ok(Self {
            portal_base_url: get("PORTAL_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            portal_username: get("PORTAL_USERNAME"),
            portal_password: get("PORTAL_PASSWORD"),
            portal_request_token: get("PORTAL_REQUEST_TOKEN")
                .unwrap_or_else(|| DEFAULT_REQUEST_TOKEN.to_string()),
            proxy_url: get("PROXY_URL"),
            smtp_host: get("SMTP_HOST"),
            smtp_port: parse_number("SMTP_PORT", get("SMTP_PORT"), DEFAULT_SMTP_PORT)?,
            smtp_user: get("SMTP_USER"),
            smtp_pass: get("SMTP_PASS"),
            smtp_from: get("SMTP_FROM"),
            recipients: SmtpConfig::resolve_recipients(
                get("ALERT_EMAIL_TO").as_deref(),
                get("ALERT_EMAIL_TO_FALLBACK").as_deref(),
            ),
            database_path: get("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            store_busy_timeout_secs: parse_number(
                "SAPN_STORE_BUSY_TIMEOUT_SECS",
                get("SAPN_STORE_BUSY_TIMEOUT_SECS"),
                5,
            )?,
            timezone,
            scheduler_enabled: parse_flag(
                "SAPN_SCHEDULER_ENABLED",
                get("SAPN_SCHEDULER_ENABLED"),
                false,
            )?,
            check_cron: get("CHECK_CRON").unwrap_or_else(|| DEFAULT_CHECK_CRON.to_string()),
            retry_unnotified: parse_flag(
                "SAPN_RETRY_UNNOTIFIED",
                get("SAPN_RETRY_UNNOTIFIED"),
                true,
            )?,
            notify_on_failure: parse_flag(
                "SAPN_NOTIFY_ON_FAILURE",
                get("SAPN_NOTIFY_ON_FAILURE"),
                true,
            )?,
            http_timeout_secs: parse_number(
                "SAPN_HTTP_TIMEOUT_SECS",
                get("SAPN_HTTP_TIMEOUT_SECS"),
                30,
            )?,
            user_agent: get("SAPN_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            web_port: parse_number("SAPN_WEB_PORT", get("SAPN_WEB_PORT"), DEFAULT_WEB_PORT)?,
        })
    }

    /// Checks every credential needed for a live run and reports all gaps at once.
    pub fn require_all(&self) -> Result<(), ConfigError> {
        let mut missing = self.missing_portal();
        missing.extend(self.missing_smtp());
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Missing(missing))
        }
    }

    pub fn portal_config(&self) -> Result<InovarPortalConfig, ConfigError> {
        let missing = self.missing_portal();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        Ok(InovarPortalConfig {
            base_url: self.portal_base_url.clone(),
            username: self.portal_username.clone().unwrap_or_default(),
            password: self.portal_password.clone().unwrap_or_default(),
            request_token: self.portal_request_token.clone(),
            http: self.http_config(),
        })
    }

    pub fn smtp_config(&self) -> Result<SmtpConfig, ConfigError> {
        let missing = self.missing_smtp();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        Ok(SmtpConfig {
            host: self.smtp_host.clone().unwrap_or_default(),
            port: self.smtp_port,
            username: self.smtp_user.clone().unwrap_or_default(),
            password: self.smtp_pass.clone().unwrap_or_default(),
            from: self.smtp_from.clone().unwrap_or_default(),
            recipients: self.recipients.clone(),
            timezone: self.timezone,
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
        })
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            proxy_url: self.proxy_url.clone(),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.database_path.clone(),
            busy_timeout: Duration::from_secs(self.store_busy_timeout_secs),
        }
    }

    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            retry_unnotified: self.retry_unnotified,
            notify_on_failure: self.notify_on_failure,
        }
    }

    fn missing_portal(&self) -> Vec<String> {
        missing_vars(&[
            ("PORTAL_USERNAME", &self.portal_username),
            ("PORTAL_PASSWORD", &self.portal_password),
        ])
    }

    fn missing_smtp(&self) -> Vec<String> {
        missing_vars(&[
            ("SMTP_HOST", &self.smtp_host),
            ("SMTP_USER", &self.smtp_user),
            ("SMTP_PASS", &self.smtp_pass),
            ("SMTP_FROM", &self.smtp_from),
        ])
    }
}

fn missing_vars(vars: &[(&str, &Option<String>)]) -> Vec<String> {
    vars.iter()
        .filter(|(_, value)| value.is_none())
        .map(|(name, _)| name.to_string())
        .collect()
}

fn parse_flag(var: &str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var: var.to_string(),
            reason: format!("expected a boolean, got `{value}`"),
        }),
    }
}

fn parse_number<T>(var: &str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: var.to_string(),
            reason: format!("`{value}`: {e}"),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn full_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("PORTAL_USERNAME", "21084"),
            ("PORTAL_PASSWORD", "segredo"),
            ("SMTP_HOST", "smtp.example.org"),
            ("SMTP_USER", "bot"),
            ("SMTP_PASS", "pw"),
            ("SMTP_FROM", "bot@example.org"),
            ("ALERT_EMAIL_TO", "parent@example.org"),
        ]
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = AppConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.portal_base_url, DEFAULT_BASE_URL);
        assert_eq!(config.database_path, PathBuf::from("alerts.db"));
        assert_eq!(config.smtp_port, 587);
        assert_eq!(config.timezone, chrono_tz::Europe::Lisbon);
        assert_eq!(config.check_cron, DEFAULT_CHECK_CRON);
        assert!(!config.scheduler_enabled);
        assert!(config.retry_unnotified);
        assert!(config.notify_on_failure);
        assert_eq!(config.web_port, 8000);
        assert!(config.recipients.is_empty());
    }

    #[test]
    fn require_all_lists_every_missing_variable() {
        let config = AppConfig::from_lookup(lookup_from(&[("SMTP_HOST", "smtp.example.org")])).unwrap();
        let err = config.require_all().unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec![
                "PORTAL_USERNAME".to_string(),
                "PORTAL_PASSWORD".to_string(),
                "SMTP_USER".to_string(),
                "SMTP_PASS".to_string(),
                "SMTP_FROM".to_string(),
            ])
        );
        assert!(err.to_string().contains("PORTAL_USERNAME, PORTAL_PASSWORD"));
    }

    #[test]
    fn complete_env_builds_component_configs() {
        let mut env = full_env();
        env.push(("PROXY_URL", "http://proxy.local:3128"));
        env.push(("TIMEZONE", "UTC"));
        let config = AppConfig::from_lookup(lookup_from(&env)).unwrap();
        config.require_all().unwrap();

        let portal = config.portal_config().unwrap();
        assert_eq!(portal.username, "21084");
        assert_eq!(portal.http.proxy_url.as_deref(), Some("http://proxy.local:3128"));

        let smtp = config.smtp_config().unwrap();
        assert_eq!(smtp.recipients, vec!["parent@example.org".to_string()]);
        assert_eq!(smtp.timezone, chrono_tz::UTC);
    }

    #[test]
    fn blank_values_are_treated_as_unset() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("PORTAL_USERNAME", "   "),
            ("ALERT_EMAIL_TO", ""),
            ("ALERT_EMAIL_TO_FALLBACK", "backup@example.org"),
        ]))
        .unwrap();
        assert!(config.portal_username.is_none());
        assert_eq!(config.recipients, vec!["backup@example.org".to_string()]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = AppConfig::from_lookup(lookup_from(&[("SAPN_RETRY_UNNOTIFIED", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "SAPN_RETRY_UNNOTIFIED"));

        let err = AppConfig::from_lookup(lookup_from(&[("SMTP_PORT", "abc")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "SMTP_PORT"));

        let err = AppConfig::from_lookup(lookup_from(&[("TIMEZONE", "Mars/Olympus")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "TIMEZONE"));
    }

    #[test]
    fn flags_accept_common_spellings() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("SAPN_SCHEDULER_ENABLED", "TRUE"),
            ("SAPN_NOTIFY_ON_FAILURE", "off"),
        ]))
        .unwrap();
        assert!(config.scheduler_enabled);
        assert!(!config.notify_on_failure);
    }
}
