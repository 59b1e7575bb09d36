//! Error taxonomy and backoff shared by the RPC fetchers.

use std::time::Duration;

use thiserror::Error;

/// Retry delays are capped here regardless of how many attempts remain.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid range: from {from} > to {to}")]
    InvalidRange { from: u64, to: u64 },
    /// Transient: the syncer logs it and retries the window.
    #[error("{0}")]
    Rpc(String),
    /// Fatal: advancing past this would corrupt downstream derivations.
    #[error("data integrity violation: {0}")]
    Integrity(String),
}

impl FetchError {
    /// True for errors the sync loop must not retry past.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FetchError::Integrity(_) | FetchError::InvalidRange { .. }
        )
    }
}

/// Exponential backoff from `base`, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let delay = base.saturating_mul(1 << exponent);
    delay.min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 6), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, 30), Duration::from_secs(10));
    }

    #[test]
    fn integrity_errors_are_fatal() {
        assert!(FetchError::Integrity("hole".into()).is_fatal());
        assert!(FetchError::InvalidRange { from: 2, to: 1 }.is_fatal());
        assert!(!FetchError::Rpc("timeout".into()).is_fatal());
    }
}
