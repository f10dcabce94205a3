//! Configuration for the integration run
//!
//! This module centralizes tunable constants and resolves the run configuration
//! from environment input into immutable values that are passed explicitly to
//! every component.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;
use crate::io::StorageUri;

// ============================================================================
// Pipeline Configuration
// ============================================================================

/// Default deadline applied to each pipeline phase
///
/// Collection jobs scrape remote sites and can legitimately run for a long
/// time, so the default is generous. A stuck network call or child process is
/// interrupted once the phase deadline passes.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Number of concurrent object fetches within one source's remote download
pub const REMOTE_FETCH_CONCURRENCY: usize = 5;

/// Interpreter used to launch job entry points when no virtualenv is present
pub const DEFAULT_INTERPRETER: &str = "python3";

// ============================================================================
// Environment Keys
// ============================================================================

pub const SOURCE_MODE_KEY: &str = "INTEGRATION_SOURCE";
pub const FORCE_REFRESH_KEY: &str = "INTEGRATION_RESCRAPE";
pub const PERSIST_KEY: &str = "INTEGRATION_PERSIST";
pub const GATHER_POLICY_KEY: &str = "INTEGRATION_GATHER_POLICY";
pub const STORAGE_URI_KEY: &str = "STORAGE_URI";
pub const STORAGE_ENDPOINT_KEY: &str = "STORAGE_ENDPOINT_URL";
pub const REGION_KEY: &str = "AWS_REGION";

const SOURCE_MODE_VALUES: &[&str] = &["local", "dev", "prod"];
const GATHER_POLICY_VALUES: &[&str] = &["strict", "partial"];
const BOOL_VALUES: &[&str] = &["true", "false", "1", "0", "yes", "no", "on", "off"];

/// Where source data is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Local,
    RemoteDev,
    RemoteProd,
}

impl SourceMode {
    /// Parse a mode token (case-insensitive)
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "local" => Ok(SourceMode::Local),
            "dev" => Ok(SourceMode::RemoteDev),
            "prod" => Ok(SourceMode::RemoteProd),
            _ => Err(ConfigError::invalid(SOURCE_MODE_KEY, value, SOURCE_MODE_VALUES)),
        }
    }

    pub fn is_remote(self) -> bool {
        !matches!(self, SourceMode::Local)
    }

    /// Key segment isolating this environment in the remote store
    pub fn environment(self) -> Option<&'static str> {
        match self {
            SourceMode::Local => None,
            SourceMode::RemoteDev => Some("dev"),
            SourceMode::RemoteProd => Some("prod"),
        }
    }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceMode::Local => write!(f, "local"),
            SourceMode::RemoteDev => write!(f, "dev"),
            SourceMode::RemoteProd => write!(f, "prod"),
        }
    }
}

/// How the gather phase treats sources that produced nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatherPolicy {
    /// Every declared source must gather; any failure aborts the run
    #[default]
    Strict,
    /// Failed sources are dropped; the run aborts only when none gathered
    Partial,
}

impl GatherPolicy {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "strict" => Ok(GatherPolicy::Strict),
            "partial" => Ok(GatherPolicy::Partial),
            _ => Err(ConfigError::invalid(
                GATHER_POLICY_KEY,
                value,
                GATHER_POLICY_VALUES,
            )),
        }
    }
}

/// Immutable configuration for one integration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunConfig {
    pub source_mode: SourceMode,
    pub force_refresh: bool,
    pub persist_remote: bool,
    pub gather_policy: GatherPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            source_mode: SourceMode::Local,
            force_refresh: false,
            persist_remote: false,
            gather_policy: GatherPolicy::Strict,
        }
    }
}

impl RunConfig {
    /// Resolve the run configuration from environment key/value pairs
    pub fn resolve<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env = Environment::new(vars);

        let source_mode = match env.get(SOURCE_MODE_KEY) {
            Some(value) => SourceMode::parse(value)?,
            None => SourceMode::Local,
        };
        let force_refresh = env.flag(FORCE_REFRESH_KEY)?.unwrap_or(false);
        let persist_remote = env
            .flag(PERSIST_KEY)?
            .unwrap_or_else(|| source_mode.is_remote());
        let gather_policy = match env.get(GATHER_POLICY_KEY) {
            Some(value) => GatherPolicy::parse(value)?,
            None => GatherPolicy::default(),
        };

        if persist_remote && !source_mode.is_remote() {
            return Err(ConfigError::Conflict {
                key: PERSIST_KEY,
                reason: format!(
                    "remote persistence needs {} set to 'dev' or 'prod'",
                    SOURCE_MODE_KEY
                ),
            });
        }

        Ok(Self {
            source_mode,
            force_refresh,
            persist_remote,
            gather_policy,
        })
    }

    /// Whether any phase talks to the remote store
    pub fn needs_store(&self) -> bool {
        self.source_mode.is_remote() || self.persist_remote
    }
}

/// Location and connection settings of the remote object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub uri: StorageUri,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
}

impl StoreSettings {
    /// Resolve store settings; returns `None` when the run never touches the store
    pub fn resolve<I, K, V>(config: &RunConfig, vars: I) -> Result<Option<Self>, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        // Persistence is only allowed in remote modes, so the mode alone decides
        let Some(environment) = config.source_mode.environment() else {
            return Ok(None);
        };

        let env = Environment::new(vars);
        let raw = env
            .get(STORAGE_URI_KEY)
            .ok_or(ConfigError::Missing {
                key: STORAGE_URI_KEY,
                reason: format!("required when {} is '{}'", SOURCE_MODE_KEY, environment),
            })?;

        let uri = StorageUri::parse(raw)
            .map_err(|e| ConfigError::Malformed {
                key: STORAGE_URI_KEY,
                value: raw.to_string(),
                reason: e.to_string(),
            })?
            .scoped(environment);

        Ok(Some(Self {
            uri,
            region: env.get(REGION_KEY).map(str::to_string),
            endpoint_url: env.get(STORAGE_ENDPOINT_KEY).map(str::to_string),
        }))
    }
}

/// Snapshot of environment input with empty values treated as absent
struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    fn new<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::invalid(key, value, BOOL_VALUES)),
        }
    }
}
