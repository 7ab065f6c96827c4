//! Configuration loading and validation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level voice satellite bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    /// Satellites paired at start-up.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub satellites: Vec<SatelliteConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<TimeoutsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<KeepAliveConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,
}

fn default_port() -> u16 {
    18790
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    /// Auth mode: "none", "token", or "password". Default: "none".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

impl GatewayAuthConfig {
    /// Resolve the auth token from direct value or env var.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }

    /// Resolve the auth password from direct value or env var.
    pub fn resolve_password(&self) -> Option<String> {
        resolve_secret_field(&self.password, &self.password_env)
    }

    pub fn effective_mode(&self) -> &str {
        self.mode.as_deref().unwrap_or("none")
    }
}

/// A satellite device paired when the gateway starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatelliteConfig {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Target kept awake while the satellite is busy (e.g. a screensaver entity).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive_target: Option<String>,
}

/// Bounds for every blocking wait in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_announce_secs")]
    pub announce_secs: u64,

    #[serde(default = "default_replace_grace_secs")]
    pub replace_grace_secs: u64,

    #[serde(default = "default_teardown_grace_secs")]
    pub teardown_grace_secs: u64,

    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            announce_secs: default_announce_secs(),
            replace_grace_secs: default_replace_grace_secs(),
            teardown_grace_secs: default_teardown_grace_secs(),
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
        }
    }
}

fn default_announce_secs() -> u64 {
    120
}

fn default_replace_grace_secs() -> u64 {
    3
}

fn default_teardown_grace_secs() -> u64 {
    5
}

fn default_keep_alive_interval_secs() -> u64 {
    5
}

/// Resolved session timing values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub announce: Duration,
    pub replace_grace: Duration,
    pub teardown_grace: Duration,
    pub keep_alive_interval: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        TimeoutsConfig::default().timings()
    }
}

impl TimeoutsConfig {
    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            announce: Duration::from_secs(self.announce_secs),
            replace_grace: Duration::from_secs(self.replace_grace_secs),
            teardown_grace: Duration::from_secs(self.teardown_grace_secs),
            keep_alive_interval: Duration::from_secs(self.keep_alive_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    /// Webhook receiving keep-awake calls. Without it keep-alive is log-only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "satellite_session=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::SatelliteError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the default config.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw)?;

        json5::from_str(&substituted)
            .map_err(|e| crate::error::SatelliteError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn auth(&self) -> Option<&GatewayAuthConfig> {
        self.gateway.as_ref().and_then(|g| g.auth.as_ref())
    }

    pub fn auth_mode(&self) -> &str {
        self.auth().map(|a| a.effective_mode()).unwrap_or("none")
    }

    pub fn timings(&self) -> SessionTimings {
        self.timeouts.clone().unwrap_or_default().timings()
    }

    pub fn keep_alive_webhook(&self) -> Option<&str> {
        self.keep_alive.as_ref().and_then(|k| k.webhook_url.as_deref())
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "timeouts.announce_secs").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        if let Some(auth) = self.auth() {
            match auth.effective_mode() {
                "none" => {}
                "token" if auth.resolve_token().is_none() => {
                    errors.push("Auth mode 'token' but no token configured".to_string());
                }
                "password" if auth.resolve_password().is_none() => {
                    errors.push("Auth mode 'password' but no password configured".to_string());
                }
                "token" | "password" => {}
                other => errors.push(format!("Unknown auth mode: {other}")),
            }
        }

        let mut seen = HashSet::new();
        for sat in &self.satellites {
            if sat.id.trim().is_empty() {
                errors.push("Satellite id cannot be empty".to_string());
            } else if !seen.insert(sat.id.as_str()) {
                errors.push(format!("Duplicate satellite id: {}", sat.id));
            }
        }

        if let Some(t) = &self.timeouts {
            for (name, value) in [
                ("announce_secs", t.announce_secs),
                ("replace_grace_secs", t.replace_grace_secs),
                ("teardown_grace_secs", t.teardown_grace_secs),
                ("keep_alive_interval_secs", t.keep_alive_interval_secs),
            ] {
                if value == 0 {
                    errors.push(format!("timeouts.{name} cannot be 0"));
                }
            }
        }

        let wants_keep_alive = self.satellites.iter().any(|s| s.keep_alive_target.is_some());
        if wants_keep_alive && self.keep_alive_webhook().is_none() {
            warnings.push(
                "keep_alive_target set but no keep_alive.webhook_url; keep-alive will only be logged"
                    .to_string(),
            );
        }

        (warnings, errors)
    }
}

/// Base directory for bridge data: `~/.voice_satellite/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voice_satellite")
}

/// Expand a leading `~` in a user-supplied path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, the variable name is unique to this test
        unsafe { std::env::set_var("TEST_VS_TOKEN", "tok-123") };
        let input = r#"{"token": "${TEST_VS_TOKEN}", "other": "plain"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("tok-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_VS_TOKEN") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_VS_TEST}"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 18790);
        assert_eq!(config.auth_mode(), "none");
        let timings = config.timings();
        assert_eq!(timings.announce, Duration::from_secs(120));
        assert_eq!(timings.replace_grace, Duration::from_secs(3));
        assert_eq!(timings.teardown_grace, Duration::from_secs(5));
        assert_eq!(timings.keep_alive_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are allowed
                gateway: { port: 19000 },
                satellites: [ { id: "kitchen", name: "Kitchen Tablet", keep_alive_target: "switch.kiosk" } ],
                timeouts: { announce_secs: 30 },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway_port(), 19000);
        assert_eq!(config.satellites.len(), 1);
        assert_eq!(config.satellites[0].keep_alive_target.as_deref(), Some("switch.kiosk"));
        let timings = config.timings();
        assert_eq!(timings.announce, Duration::from_secs(30));
        assert_eq!(timings.replace_grace, Duration::from_secs(3));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.satellites.is_empty());
    }

    #[test]
    fn test_load_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ gateway: ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert_eq!(err.code(), "config_error");
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_duplicate_satellites() {
        let config = Config {
            satellites: vec![
                SatelliteConfig { id: "a".into(), name: None, keep_alive_target: None },
                SatelliteConfig { id: "a".into(), name: None, keep_alive_target: None },
            ],
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("Duplicate")), "got: {errors:?}");
    }

    #[test]
    fn test_validate_token_mode_without_token() {
        let config = Config {
            gateway: Some(GatewayConfig {
                port: 18790,
                bind: None,
                auth: Some(GatewayAuthConfig {
                    mode: Some("token".into()),
                    token: None,
                    token_env: Some("NONEXISTENT_VS_TOKEN_ENV".into()),
                    password: None,
                    password_env: None,
                }),
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("token")), "got: {errors:?}");
    }

    #[test]
    fn test_validate_keep_alive_without_webhook_warns() {
        let config = Config {
            satellites: vec![SatelliteConfig {
                id: "a".into(),
                name: None,
                keep_alive_target: Some("switch.screen".into()),
            }],
            ..Config::default()
        };
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_expand_path_plain() {
        assert_eq!(expand_path("/etc/vs.json"), PathBuf::from("/etc/vs.json"));
    }

    #[test]
    fn test_get_path() {
        let config: Config = json5::from_str(r#"{ gateway: { port: 1234 } }"#).unwrap();
        assert_eq!(config.get_path("gateway.port"), Some(serde_json::json!(1234)));
        assert_eq!(config.get_path("gateway.nope"), None);
    }
}
