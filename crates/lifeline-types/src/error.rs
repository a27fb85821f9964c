//! Error taxonomy shared by every lifeline crate.
//!
//! Each collaborator has its own enum so callers can match on the exact
//! failure class (transient, capability-absent, policy); [`LifelineError`]
//! unifies them for the boot sequence and the command surface.

use thiserror::Error;

/// Backing-store and persistence failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage partition `{0}` could not be opened")]
    Open(String),

    #[error("storage mount failed: {0}")]
    Mount(String),

    #[error("storage device not ready")]
    NotReady,

    #[error("storage not mounted")]
    NotMounted,

    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("stored record has unexpected length {actual} (expected {expected})")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("record cipher failed: {0}")]
    Cipher(#[from] CipherError),
}

/// Failures reported by the record cipher collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("cipher is disabled")]
    Disabled,

    #[error("invalid key length {0} (expected 16, 24 or 32 bytes)")]
    InvalidKey(usize),

    #[error("invalid key encoding: {0}")]
    KeyEncoding(String),

    #[error("cipher output length {actual} does not match input length {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Generic peripheral failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    #[error("device not ready")]
    NotReady,

    #[error("hardware error: {0}")]
    Hardware(String),
}

/// Outcome classes of a live watchdog retune.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetuneError {
    /// This hardware family cannot change its window while running.
    /// Permanent for the boot; never retried.
    #[error("live retune not supported by this watchdog")]
    Unsupported,

    /// The register update did not settle in time. Retryable.
    #[error("watchdog busy: register update did not settle")]
    Busy,

    #[error("timeout {0} ms cannot be represented by the watchdog")]
    InvalidTimeout(u32),

    #[error("watchdog not installed")]
    NotInstalled,
}

/// Result classes of a watchdog feed.
///
/// [`FeedError::Disabled`] is deliberate: feeding was gated off so the
/// hardware is allowed to reset the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("feeding disabled by policy")]
    Disabled,

    #[error("watchdog not installed")]
    NotInstalled,

    #[error("feed failed: {0}")]
    Hardware(HalError),
}

/// Umbrella error for the boot sequence and operator commands.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Hal(#[from] HalError),

    #[error(transparent)]
    Retune(#[from] RetuneError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("requested timeout {requested} ms out of range ({min}-{max})")]
    TimeoutOutOfRange { requested: u32, min: u32, max: u32 },

    #[error("command rejected: {0}")]
    Command(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_error_converts_into_storage_error() {
        let err: StorageError = CipherError::Disabled.into();
        assert!(matches!(err, StorageError::Cipher(CipherError::Disabled)));
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn out_of_range_display_names_bounds() {
        let err = LifelineError::TimeoutOutOfRange {
            requested: 50,
            min: 100,
            max: 60_000,
        };
        let text = err.to_string();
        assert!(text.contains("50"));
        assert!(text.contains("100-60000"));
    }

    #[test]
    fn transparent_errors_keep_inner_message() {
        let err: LifelineError = RetuneError::Unsupported.into();
        assert_eq!(err.to_string(), RetuneError::Unsupported.to_string());
    }
}
