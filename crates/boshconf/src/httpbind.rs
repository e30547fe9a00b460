//! HTTP binding parameters advertised to every client.
//!
//! These are read once at startup and never change for the life of the
//! process. Sessions copy what they need when they are created.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Process-wide session layer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpBindConfig {
    /// Seconds without client activity before a session is evicted.
    /// Default: 1800
    #[serde(default = "HttpBindConfig::default_inactivity_timeout")]
    pub inactivity_timeout: u64,

    /// Maximum simultaneous requests a client may make (`requests` attribute).
    /// Default: 2
    #[serde(default = "HttpBindConfig::default_max_requests")]
    pub max_requests: u32,

    /// Shortest allowed interval between two polls, in seconds.
    /// Zero disables the check.
    /// Default: 5
    #[serde(default = "HttpBindConfig::default_polling_interval")]
    pub polling_interval: u64,
}

impl HttpBindConfig {
    fn default_inactivity_timeout() -> u64 {
        1800
    }

    fn default_max_requests() -> u32 {
        2
    }

    fn default_polling_interval() -> u64 {
        5
    }

    /// Inactivity timeout as a [`Duration`].
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout)
    }

    /// Minimum polling interval as a [`Duration`].
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval)
    }
}

impl Default for HttpBindConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Self::default_inactivity_timeout(),
            max_requests: Self::default_max_requests(),
            polling_interval: Self::default_polling_interval(),
        }
    }
}
