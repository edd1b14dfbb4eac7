//! Session configuration.
//!
//! Both structs deserialise from any `serde` format with every field optional,
//! so an application can embed them in its own configuration file:
//!
//! ```
//! use switchyard::session::SessionConfig;
//!
//! let config: SessionConfig =
//!     serde_json::from_str(r#"{ "cookie_name": "sid", "timeout_ms": 60000 }"#).unwrap();
//! assert_eq!(config.cookie_name, "sid");
//! assert_eq!(config.cookie_path, "/");
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http::SameSite;

/// How [`SessionHandler`](super::SessionHandler) names, times out and
/// cookies sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub cookie_path: String,
    /// Idle time after which a session expires.
    pub timeout_ms: u64,
    pub cookie_secure: bool,
    pub cookie_http_only: bool,
    pub cookie_same_site: Option<SameSite>,
    /// `Max-Age` of the session cookie in seconds; a browser-session cookie
    /// when unset.
    pub cookie_max_age_secs: Option<i64>,
    /// Random bytes per session id.
    pub id_length: usize,
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "switchyard.session".to_owned(),
            cookie_path: "/".to_owned(),
            timeout_ms: 30 * 60 * 1000,
            cookie_secure: false,
            cookie_http_only: false,
            cookie_same_site: None,
            cookie_max_age_secs: None,
            id_length: super::DEFAULT_ID_LENGTH,
        }
    }
}

/// Settings of [`LocalSessionStore`](super::LocalSessionStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStoreConfig {
    /// How often the reaper evicts expired sessions.
    pub reaper_interval_ms: u64,
}

impl LocalStoreConfig {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            reaper_interval_ms: 1000,
        }
    }
}
