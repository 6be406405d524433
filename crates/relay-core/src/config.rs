//! Runtime configuration consumed by the core.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::sweep::SweepPolicy;

/// Default bound on pushed-but-unacknowledged events per connection.
pub const DEFAULT_MAX_UNACKED: usize = 256;

/// Relay configuration.
///
/// Durations serialize as whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Root directory for durable session records.
    pub sessions_root: PathBuf,
    /// Root directory for report artifacts.
    pub reports_root: PathBuf,
    #[serde(with = "secs")]
    pub inactivity_timeout: Duration,
    #[serde(with = "secs")]
    pub expiry_grace: Duration,
    #[serde(with = "secs")]
    pub sweep_interval: Duration,
    /// Per-connection bound on unacknowledged pushed events.
    pub max_unacked_events: usize,
    /// Default execution budget for handlers that do not declare one.
    #[serde(with = "secs")]
    pub handler_timeout: Duration,
    #[serde(with = "secs")]
    pub keepalive_interval: Duration,
    /// Retention cap on idle plus active sessions.
    pub max_sessions: Option<usize>,
    /// Storage limit for one session not currently attached.
    pub max_session_bytes: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let policy = SweepPolicy::default();
        Self {
            sessions_root: PathBuf::from("sessions"),
            reports_root: PathBuf::from("reports"),
            inactivity_timeout: policy.inactivity_timeout,
            expiry_grace: policy.grace,
            sweep_interval: Duration::from_secs(3600),
            max_unacked_events: DEFAULT_MAX_UNACKED,
            handler_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(15),
            max_sessions: policy.max_sessions,
            max_session_bytes: policy.max_session_bytes,
        }
    }
}

impl RelayConfig {
    /// Expiry policy derived from this configuration.
    #[must_use]
    pub const fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            inactivity_timeout: self.inactivity_timeout,
            grace: self.expiry_grace,
            max_sessions: self.max_sessions,
            max_session_bytes: self.max_session_bytes,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
