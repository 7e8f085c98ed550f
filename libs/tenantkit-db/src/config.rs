//! Configuration of the isolation core.
//!
//! Loaded from a figment under the `isolation` key, so the same YAML file and
//! `TENANTKIT__ISOLATION__*` environment overrides can feed it:
//!
//! ```yaml
//! isolation:
//!   dsn: "postgres://app:${DB_PASSWORD}@db:5432/inventory"
//!   pool:
//!     max_conns: 20
//!     acquire_timeout: 5s
//!   retry:
//!     max_retries: 5
//!     base_backoff: 200ms
//!   unit_timeout: 30s
//!   marker_scope: transaction
//!   app_role: app_user
//!   query_defaults:
//!     page_size: 50
//!     low_stock_threshold: 10
//! ```

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{IsolationError, Result};
use crate::marker::MarkerScope;
use crate::retry::RetryCfg;
use crate::tables::is_identifier;

/// Figment key holding the isolation section.
pub const CONFIG_KEY: &str = "isolation";

/// Environment prefix; `TENANTKIT__ISOLATION__DSN` overrides `isolation.dsn`.
pub const ENV_PREFIX: &str = "TENANTKIT__";

static ENV_VAR_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok());

fn default_true() -> bool {
    true
}

/// Top-level isolation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IsolationConfig {
    /// Connection string; `${VAR}` placeholders are expanded from the environment.
    pub dsn: String,

    #[serde(default)]
    pub pool: PoolCfg,

    #[serde(default)]
    pub retry: RetryCfg,

    /// Upper bound on one unit of work, callback included.
    #[serde(default, with = "humantime_serde")]
    pub unit_timeout: Option<Duration>,

    #[serde(default)]
    pub marker_scope: MarkerScope,

    /// Check pooled connections for a residual marker on acquire and release.
    #[serde(default = "default_true")]
    pub leak_guard: bool,

    /// Accept a backend that only emulates the row policies (`SQLite`).
    /// Meant for development and tests.
    #[serde(default)]
    pub allow_emulated_isolation: bool,

    /// Application role granted EXECUTE on the context functions (`PostgreSQL`).
    #[serde(default)]
    pub app_role: Option<String>,

    #[serde(default)]
    pub query_defaults: QueryDefaults,
}

/// Pool sizing and timeouts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolCfg {
    pub max_conns: Option<u32>,
    pub min_conns: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Option<Duration>,
}

/// Defaults applied when a caller leaves a query parameter unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryDefaults {
    /// Rows per page for list queries.
    pub page_size: u32,
    /// Quantity at or below which a product counts as low on stock.
    pub low_stock_threshold: u32,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            page_size: 50,
            low_stock_threshold: 10,
        }
    }
}

impl QueryDefaults {
    /// Requested page size, or the configured default when absent or zero.
    #[must_use]
    pub fn resolve_page_size(&self, requested: Option<u32>) -> u32 {
        requested.filter(|n| *n > 0).unwrap_or(self.page_size)
    }

    #[must_use]
    pub fn resolve_low_stock_threshold(&self, requested: Option<u32>) -> u32 {
        requested.unwrap_or(self.low_stock_threshold)
    }
}

/// Settings the manager keeps after the pool is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerSettings {
    pub unit_timeout: Option<Duration>,
    pub marker_scope: MarkerScope,
    pub query_defaults: QueryDefaults,
}

impl IsolationConfig {
    /// Minimal config for a DSN with every other setting at its default.
    #[must_use]
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            pool: PoolCfg::default(),
            retry: RetryCfg::default(),
            unit_timeout: None,
            marker_scope: MarkerScope::default(),
            leak_guard: true,
            allow_emulated_isolation: false,
            app_role: None,
            query_defaults: QueryDefaults::default(),
        }
    }

    /// Extract and validate the `isolation` section of a figment.
    ///
    /// # Errors
    /// Returns `IsolationError::Config` when the section is missing or malformed,
    /// and `IsolationError::InvalidConfig` when a value fails validation or a
    /// referenced environment variable is unset.
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let mut cfg: Self = figment.extract_inner(CONFIG_KEY)?;
        cfg.dsn = expand_env_vars(&cfg.dsn)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a YAML file layered with `TENANTKIT__` environment overrides.
    ///
    /// # Errors
    /// See [`IsolationConfig::from_figment`].
    pub fn load(path: &Path) -> Result<Self> {
        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(&figment)
    }

    /// Load from an inline YAML document.
    ///
    /// # Errors
    /// See [`IsolationConfig::from_figment`].
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::from_figment(&Figment::from(Yaml::string(yaml)))
    }

    /// Check values that serde cannot.
    ///
    /// # Errors
    /// Returns `IsolationError::InvalidConfig` describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.dsn.trim().is_empty() {
            return Err(IsolationError::InvalidConfig("dsn must not be empty".to_owned()));
        }
        if let Some(max) = self.pool.max_conns {
            if max == 0 {
                return Err(IsolationError::InvalidConfig(
                    "pool.max_conns must be at least 1".to_owned(),
                ));
            }
            if self.pool.min_conns.is_some_and(|min| min > max) {
                return Err(IsolationError::InvalidConfig(
                    "pool.min_conns must not exceed pool.max_conns".to_owned(),
                ));
            }
        }
        if self.unit_timeout.is_some_and(|t| t.is_zero()) {
            return Err(IsolationError::InvalidConfig(
                "unit_timeout must be greater than zero".to_owned(),
            ));
        }
        if let Some(role) = &self.app_role
            && !is_identifier(role)
        {
            return Err(IsolationError::InvalidConfig(format!(
                "app_role '{role}' is not a valid role name"
            )));
        }
        if self.query_defaults.page_size == 0 {
            return Err(IsolationError::InvalidConfig(
                "query_defaults.page_size must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn settings(&self) -> ManagerSettings {
        ManagerSettings {
            unit_timeout: self.unit_timeout,
            marker_scope: self.marker_scope,
            query_defaults: self.query_defaults,
        }
    }

    /// DSN safe for logs.
    #[must_use]
    pub fn redacted_dsn(&self) -> String {
        redact_dsn(&self.dsn)
    }
}

/// Replace `${VAR}` placeholders with environment values.
///
/// # Errors
/// Returns `IsolationError::InvalidConfig` naming the first unset variable.
pub fn expand_env_vars(input: &str) -> Result<String> {
    let Some(re) = ENV_VAR_RE.as_ref() else {
        return Ok(input.to_owned());
    };
    let mut result = input.to_owned();
    for caps in re.captures_iter(input) {
        let var_name = &caps[1];
        let value = std::env::var(var_name).map_err(|_| {
            IsolationError::InvalidConfig(format!("environment variable '{var_name}' is not set"))
        })?;
        result = result.replace(&caps[0], &value);
    }
    Ok(result)
}

/// Mask the password of a URL-style DSN.
#[must_use]
pub fn redact_dsn(dsn: &str) -> String {
    if !dsn.contains('@') {
        return dsn.to_owned();
    }
    match url::Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() && parsed.set_password(Some("***")).is_err() {
                return "***".to_owned();
            }
            parsed.to_string()
        }
        Err(_) => "***".to_owned(),
    }
}
