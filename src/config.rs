//! Configuration loader and validator for the cutover orchestrator.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::{ConnectionConfig, DialectType};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub oms: Oms,
    #[serde(default)]
    pub osc: Osc,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub database_url: String,
    pub tick_interval_ms: u64,
}

/// Migration service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Oms {
    pub url: String,
    #[serde(default)]
    pub authorization: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_failed_timeout")]
    pub check_project_step_failed_timeout_seconds: u64,
}

/// Orchestration knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Osc {
    #[serde(default)]
    pub enable_full_verify: bool,
    #[serde(default = "default_catch_up_timeout")]
    pub swap_table_catch_up_timeout_seconds: u64,
    #[serde(default = "default_catch_up_interval")]
    pub swap_table_catch_up_poll_interval_ms: u64,
    #[serde(default = "default_lock_user_interval")]
    pub lock_user_monitor_interval_ms: u64,
}

fn default_region() -> String {
    "default".into()
}

fn default_failed_timeout() -> u64 {
    600
}

fn default_catch_up_timeout() -> u64 {
    60
}

fn default_catch_up_interval() -> u64 {
    1000
}

fn default_lock_user_interval() -> u64 {
    1000
}

impl Default for Osc {
    fn default() -> Self {
        Self {
            enable_full_verify: false,
            swap_table_catch_up_timeout_seconds: default_catch_up_timeout(),
            swap_table_catch_up_poll_interval_ms: default_catch_up_interval(),
            lock_user_monitor_interval_ms: default_lock_user_interval(),
        }
    }
}

/// Runtime view of the knobs the stages need, detached from the YAML layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OscProperties {
    pub enable_full_verify: bool,
    pub region: String,
    pub check_project_step_failed_timeout: Duration,
    pub catch_up_timeout: Duration,
    pub catch_up_poll_interval: Duration,
    pub lock_user_monitor_interval: Duration,
}

impl Default for OscProperties {
    fn default() -> Self {
        Self {
            enable_full_verify: false,
            region: default_region(),
            check_project_step_failed_timeout: Duration::from_secs(default_failed_timeout()),
            catch_up_timeout: Duration::from_secs(default_catch_up_timeout()),
            catch_up_poll_interval: Duration::from_millis(default_catch_up_interval()),
            lock_user_monitor_interval: Duration::from_millis(default_lock_user_interval()),
        }
    }
}

impl Config {
    pub fn properties(&self) -> OscProperties {
        OscProperties {
            enable_full_verify: self.osc.enable_full_verify,
            region: self.oms.region.clone(),
            check_project_step_failed_timeout: Duration::from_secs(
                self.oms.check_project_step_failed_timeout_seconds,
            ),
            catch_up_timeout: Duration::from_secs(self.osc.swap_table_catch_up_timeout_seconds),
            catch_up_poll_interval: Duration::from_millis(
                self.osc.swap_table_catch_up_poll_interval_ms,
            ),
            lock_user_monitor_interval: Duration::from_millis(
                self.osc.lock_user_monitor_interval_ms,
            ),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.app.tick_interval_ms)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.database_url.trim().is_empty() {
        return Err(ConfigError::Invalid("app.database_url must be non-empty"));
    }
    if cfg.app.tick_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.tick_interval_ms must be > 0"));
    }

    if cfg.oms.url.trim().is_empty() {
        return Err(ConfigError::Invalid("oms.url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.oms.url).is_err() {
        return Err(ConfigError::Invalid("oms.url must be an absolute URL"));
    }
    if cfg.oms.check_project_step_failed_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "oms.check_project_step_failed_timeout_seconds must be > 0",
        ));
    }

    if cfg.osc.swap_table_catch_up_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "osc.swap_table_catch_up_timeout_seconds must be > 0",
        ));
    }
    if cfg.osc.swap_table_catch_up_poll_interval_ms == 0 {
        return Err(ConfigError::Invalid(
            "osc.swap_table_catch_up_poll_interval_ms must be > 0",
        ));
    }
    if cfg.osc.lock_user_monitor_interval_ms == 0 {
        return Err(ConfigError::Invalid(
            "osc.lock_user_monitor_interval_ms must be > 0",
        ));
    }

    for conn in &cfg.connections {
        if conn.id.trim().is_empty() {
            return Err(ConfigError::Invalid("connections[].id must be non-empty"));
        }
        if conn.host.trim().is_empty() {
            return Err(ConfigError::Invalid("connections[].host must be non-empty"));
        }
        if conn.username.trim().is_empty() {
            return Err(ConfigError::Invalid("connections[].username must be non-empty"));
        }
        if conn.dialect == DialectType::ObOracle && conn.tenant.is_none() {
            return Err(ConfigError::Invalid(
                "connections[].tenant is required for OB_ORACLE",
            ));
        }
    }
    let mut ids: Vec<&str> = cfg.connections.iter().map(|c| c.id.as_str()).collect();
    ids.sort_unstable();
    if ids.windows(2).any(|w| w[0] == w[1]) {
        return Err(ConfigError::Invalid("connections[].id must be unique"));
    }

    Ok(())
}

/// Returns the canonical example YAML content.
pub fn example() -> &'static str {
    r#"app:
  database_url: "sqlite://./data/osc.db"
  tick_interval_ms: 5000

oms:
  url: "http://127.0.0.1:8089"
  authorization: "Basic b21zOm9tcw=="
  region: "default"
  check_project_step_failed_timeout_seconds: 600

osc:
  enable_full_verify: false
  swap_table_catch_up_timeout_seconds: 60
  swap_table_catch_up_poll_interval_ms: 1000
  lock_user_monitor_interval_ms: 1000

connections:
  - id: "ob-mysql"
    dialect: "OB_MYSQL"
    host: "127.0.0.1"
    port: 2881
    username: "osc_user"
    password: "osc_password"
    tenant: "mysql_tenant"
    cluster: "obcluster"
    sys_tenant_username: "root"
    sys_tenant_password: "sys_password"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.connections.len(), 1);
        assert_eq!(cfg.connections[0].dialect, DialectType::ObMysql);
    }

    #[test]
    fn invalid_oms_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.oms.url = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("oms.url")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.oms.url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_intervals() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.tick_interval_ms = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("tick_interval_ms")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.osc.swap_table_catch_up_timeout_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.osc.swap_table_catch_up_poll_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_connection_ids() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        let dup = cfg.connections[0].clone();
        cfg.connections.push(dup);
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("unique")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn osc_section_defaults_when_missing() {
        let yaml = r#"app:
  database_url: "sqlite::memory:"
  tick_interval_ms: 100
oms:
  url: "http://localhost:8089"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        let props = cfg.properties();
        assert!(!props.enable_full_verify);
        assert_eq!(props.catch_up_timeout, Duration::from_secs(60));
        assert_eq!(props.check_project_step_failed_timeout, Duration::from_secs(600));
        assert_eq!(props.region, "default");
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.oms.region, "default");
        assert_eq!(cfg.tick_interval(), Duration::from_millis(5000));
    }
}
