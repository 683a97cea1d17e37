//! Per-connection health verdict state machine (spec §4.5):
//!
//! ```text
//! NotConnected -> NotYetHeartbeated -> Healthy <-> Unhealthy(cause)
//! ```
//!
//! The first two transitions are one-shot (dial, then first heartbeat
//! outcome); the last is driven by every subsequent heartbeat outcome.

use std::fmt;

/// The registry's verdict on a peer's reachability.
#[derive(Debug, Clone)]
pub enum HealthVerdict {
    /// No `Dial` has ever been issued for this address.
    NotConnected,
    /// Dialled (TLS handshake complete) but no heartbeat has completed.
    NotYetHeartbeated,
    /// Most recent heartbeat succeeded.
    Healthy,
    /// Most recent heartbeat failed; `cause` is a human-readable summary.
    Unhealthy { cause: String },
}

impl HealthVerdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthVerdict::Healthy)
    }
}

impl fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::NotYetHeartbeated => write!(f, "not yet heartbeated"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy { cause } => write!(f, "unhealthy: {cause}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_verdict() {
        assert_eq!(HealthVerdict::NotConnected.to_string(), "not connected");
        assert!(HealthVerdict::Healthy.is_healthy());
        assert!(!HealthVerdict::NotYetHeartbeated.is_healthy());
        assert!(!HealthVerdict::Unhealthy {
            cause: "timeout".into()
        }
        .is_healthy());
    }
}
