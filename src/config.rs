//! Runtime configuration.
//!
//! Every value is optional and defaulted. [`Config::from_env`] overlays
//! environment variables on the defaults.

use std::time::Duration;

use crate::error::ConfigError;

/// Idle connection TTL, in seconds.
pub const CONNECTION_TTL_ENV_VAR: &str = "TABSYNC_CONNECTION_TTL_SECS";
/// Session cookie max-age and session data TTL, in seconds.
pub const SESSION_MAX_AGE_ENV_VAR: &str = "TABSYNC_SESSION_MAX_AGE_SECS";
/// Patch queue capacity per connection.
pub const PATCH_QUEUE_CAPACITY_ENV_VAR: &str = "TABSYNC_PATCH_QUEUE_CAPACITY";
/// Name of the session cookie.
pub const COOKIE_NAME_ENV_VAR: &str = "TABSYNC_COOKIE_NAME";
/// URL of the client script referenced by the page shell.
pub const CLIENT_SCRIPT_ENV_VAR: &str = "TABSYNC_CLIENT_SCRIPT";

const DEFAULT_CONNECTION_TTL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_SESSION_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_PATCH_QUEUE_CAPACITY: usize = 64;
const DEFAULT_COOKIE_NAME: &str = "tabsync_session";

/// Engine configuration.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tabsync::Config;
///
/// let config = Config {
///     connection_ttl: Duration::from_secs(60),
///     ..Config::default()
/// };
/// assert_eq!(config.patch_queue_capacity, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Connections idle for longer than this are swept.
    pub connection_ttl: Duration,
    /// Session cookie `Max-Age`; also the idle window for session data and
    /// for remembering invalidated session ids.
    pub session_max_age: Duration,
    /// Maximum undelivered patches per connection.
    pub patch_queue_capacity: usize,
    /// Session cookie name.
    pub cookie_name: String,
    /// Script URL added to the page shell, if any.
    pub client_script: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_ttl: DEFAULT_CONNECTION_TTL,
            session_max_age: DEFAULT_SESSION_MAX_AGE,
            patch_queue_capacity: DEFAULT_PATCH_QUEUE_CAPACITY,
            cookie_name: DEFAULT_COOKIE_NAME.to_owned(),
            client_script: None,
        }
    }
}

impl Config {
    /// Defaults overlaid with the `TABSYNC_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unparsable or zero value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Blank values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unparsable or zero value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();
        if let Some(raw) = get(CONNECTION_TTL_ENV_VAR) {
            config.connection_ttl = Duration::from_secs(positive(CONNECTION_TTL_ENV_VAR, &raw)?);
        }
        if let Some(raw) = get(SESSION_MAX_AGE_ENV_VAR) {
            config.session_max_age = Duration::from_secs(positive(SESSION_MAX_AGE_ENV_VAR, &raw)?);
        }
        if let Some(raw) = get(PATCH_QUEUE_CAPACITY_ENV_VAR) {
            let capacity = positive(PATCH_QUEUE_CAPACITY_ENV_VAR, &raw)?;
            config.patch_queue_capacity =
                usize::try_from(capacity).map_err(|_| ConfigError::Invalid {
                    var: PATCH_QUEUE_CAPACITY_ENV_VAR,
                    value: raw.clone(),
                    reason: "too large",
                })?;
        }
        if let Some(raw) = get(COOKIE_NAME_ENV_VAR) {
            let name = raw.trim();
            if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(ConfigError::Invalid {
                    var: COOKIE_NAME_ENV_VAR,
                    value: raw.clone(),
                    reason: "cookie names may only use letters, digits, '_' and '-'",
                });
            }
            config.cookie_name = name.to_owned();
        }
        if let Some(raw) = get(CLIENT_SCRIPT_ENV_VAR) {
            config.client_script = Some(raw.trim().to_owned());
        }
        Ok(config)
    }
}

fn positive(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    let invalid = |reason| ConfigError::Invalid {
        var,
        value: raw.to_owned(),
        reason,
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(invalid("must be at least 1")),
        Ok(n) => Ok(n),
        Err(_) => Err(invalid("not a positive integer")),
    }
}
