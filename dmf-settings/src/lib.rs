use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid settings file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid setting {key}: {message}")]
    Invalid { key: String, message: String },
    #[error("cannot install log subscriber: {0}")]
    Logging(String),
}

/// Console settings. Every field has a default, so an empty file is valid.
///
/// Environment variables (`DMF_*`) override whatever the file says.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    /// Fully qualified DMF configuration table.
    pub config_table: String,
    /// Fully qualified management procedure.
    pub procedure: String,
    pub cache: CacheSettings,
    /// Per-call limit for the management procedure; unset waits indefinitely.
    pub call_timeout_secs: Option<u64>,
    pub audit_file: Option<String>,
    pub http_addr: String,
    pub log_level: String,
    pub sql_api: SqlApiSettings,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub config_ttl_secs: u64,
    pub applied_ttl_secs: u64,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SqlApiSettings {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub token_type: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub warehouse: Option<String>,
    pub role: Option<String>,
    pub statement_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            config_table: "DEMO.GOVERNANCE.DMF_CONFIG".into(),
            procedure: "DEMO.GOVERNANCE.SP_MANAGE_DMF".into(),
            cache: CacheSettings::default(),
            call_timeout_secs: None,
            audit_file: None,
            http_addr: "0.0.0.0:7000".into(),
            log_level: "info".into(),
            sql_api: SqlApiSettings::default(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            config_ttl_secs: 60,
            applied_ttl_secs: 60,
        }
    }
}

impl Default for SqlApiSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            token_type: None,
            database: None,
            schema: None,
            warehouse: None,
            role: None,
            statement_timeout_secs: 60,
            request_timeout_secs: 90,
        }
    }
}

impl fmt::Debug for ConsoleSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleSettings")
            .field("config_table", &self.config_table)
            .field("procedure", &self.procedure)
            .field("cache", &self.cache)
            .field("call_timeout_secs", &self.call_timeout_secs)
            .field("audit_file", &self.audit_file)
            .field("http_addr", &self.http_addr)
            .field("log_level", &self.log_level)
            .field("sql_api", &self.sql_api)
            .finish()
    }
}

impl fmt::Debug for SqlApiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlApiSettings")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "***REDACTED***"))
            .field("token_type", &self.token_type)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("warehouse", &self.warehouse)
            .field("role", &self.role)
            .field("statement_timeout_secs", &self.statement_timeout_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl ConsoleSettings {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| SettingsError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, SettingsError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// File (if given) then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut settings = match path {
            Some(p) => Self::from_path(p)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), SettingsError> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("DMF_CONFIG_TABLE") {
            self.config_table = v;
        }
        if let Some(v) = get("DMF_PROCEDURE") {
            self.procedure = v;
        }
        if let Some(v) = get("DMF_CACHE_TTL_SECS") {
            let ttl = parse_secs("DMF_CACHE_TTL_SECS", &v)?;
            self.cache.config_ttl_secs = ttl;
            self.cache.applied_ttl_secs = ttl;
        }
        if let Some(v) = get("DMF_CALL_TIMEOUT_SECS") {
            self.call_timeout_secs = Some(parse_secs("DMF_CALL_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("DMF_AUDIT_FILE") {
            self.audit_file = Some(v);
        }
        if let Some(v) = get("DMF_HTTP_ADDR") {
            self.http_addr = v;
        }
        if let Some(v) = get("DMF_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("DMF_SQL_API_URL") {
            self.sql_api.base_url = Some(v);
        }
        if let Some(v) = get("DMF_TOKEN") {
            self.sql_api.token = Some(v);
        }
        if let Some(v) = get("DMF_TOKEN_TYPE") {
            self.sql_api.token_type = Some(v);
        }
        if let Some(v) = get("DMF_WAREHOUSE") {
            self.sql_api.warehouse = Some(v);
        }
        if let Some(v) = get("DMF_ROLE") {
            self.sql_api.role = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.config_table.trim().is_empty() {
            return Err(SettingsError::Invalid {
                key: "config_table".into(),
                message: "cannot be empty".into(),
            });
        }
        if self.procedure.trim().is_empty() {
            return Err(SettingsError::Invalid {
                key: "procedure".into(),
                message: "cannot be empty".into(),
            });
        }
        if self.call_timeout_secs == Some(0) {
            return Err(SettingsError::Invalid {
                key: "call_timeout_secs".into(),
                message: "must be positive when set".into(),
            });
        }
        Ok(())
    }

    pub fn config_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.config_ttl_secs)
    }

    pub fn applied_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.applied_ttl_secs)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_tracing<W>(level: &str, writer: W) -> Result<(), SettingsError>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => level_filter(level)?,
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(writer))
        .with(filter)
        .try_init()
        .map_err(|e| SettingsError::Logging(e.to_string()))
}

fn level_filter(level: &str) -> Result<EnvFilter, SettingsError> {
    EnvFilter::try_new(level).map_err(|e| SettingsError::Invalid {
        key: "log_level".into(),
        message: e.to_string(),
    })
}

fn parse_secs(key: &str, value: &str) -> Result<u64, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::Invalid {
        key: key.into(),
        message: format!("expected whole seconds, got {value:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_defaults() {
        let s = ConsoleSettings::from_yaml("").unwrap();
        assert_eq!(s.config_table, "DEMO.GOVERNANCE.DMF_CONFIG");
        assert_eq!(s.procedure, "DEMO.GOVERNANCE.SP_MANAGE_DMF");
        assert_eq!(s.config_ttl(), Duration::from_secs(60));
        assert_eq!(s.applied_ttl(), Duration::from_secs(60));
        assert_eq!(s.call_timeout(), None);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let s = ConsoleSettings::from_yaml(
            r#"
config_table: GOV.DQ.DMF_CONFIG
cache:
  applied_ttl_secs: 15
call_timeout_secs: 120
sql_api:
  base_url: https://acme.snowflakecomputing.com
  warehouse: COMPUTE_WH
"#,
        )
        .unwrap();
        assert_eq!(s.config_table, "GOV.DQ.DMF_CONFIG");
        assert_eq!(s.cache.config_ttl_secs, 60);
        assert_eq!(s.cache.applied_ttl_secs, 15);
        assert_eq!(s.call_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(s.sql_api.warehouse.as_deref(), Some("COMPUTE_WH"));
        assert_eq!(s.sql_api.statement_timeout_secs, 60);
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("DMF_CONFIG_TABLE", "X.Y.Z"),
            ("DMF_CACHE_TTL_SECS", "5"),
            ("DMF_TOKEN", "tok"),
            ("DMF_ROLE", ""),
        ]
        .into_iter()
        .collect();
        let mut s = ConsoleSettings::default();
        s.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.config_table, "X.Y.Z");
        assert_eq!(s.cache.config_ttl_secs, 5);
        assert_eq!(s.cache.applied_ttl_secs, 5);
        assert_eq!(s.sql_api.token.as_deref(), Some("tok"));
        assert_eq!(s.sql_api.role, None);
        assert!(!format!("{s:?}").contains("tok\""));
    }

    #[test]
    fn bad_env_number_is_rejected() {
        let mut s = ConsoleSettings::default();
        let err = s
            .apply_env(|k| (k == "DMF_CALL_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { .. }));
    }

    #[test]
    fn log_level_accepts_directives() {
        assert!(level_filter("info").is_ok());
        assert!(level_filter("warn,dmf_loader=debug").is_ok());
        let err = level_filter("dmf_core=loudest").unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { ref key, .. } if key == "log_level"));
    }

    #[test]
    fn validation_rejects_empty_table() {
        let s = ConsoleSettings {
            config_table: " ".into(),
            ..ConsoleSettings::default()
        };
        assert!(s.validate().is_err());
    }
}
