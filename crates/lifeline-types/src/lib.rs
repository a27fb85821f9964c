//! `lifeline-types` – shared vocabulary for the lifeline recovery core.
//!
//! Everything that crosses a crate boundary lives here: the persisted
//! [`FaultRecord`] and its on-disk shapes, the fixed set of
//! [`RecoveryReason`]s and their [`RecoveryReasons`] flag set, reset/reboot enums, and the error taxonomy.

pub mod error;
pub mod record;

pub use error::{
    CipherError, FeedError, HalError, LifelineError, RetuneError, StorageError,
};
pub use record::{
    ENCRYPTED_RECORD_LEN, EncryptedRecord, FaultRecord, IV_LEN, RECORD_LEN, RECORD_MAGIC,
};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Coalescing set of pending recovery reasons, one bit per
    /// [`RecoveryReason`].
    ///
    /// Inserting a reason that is already present is a no-op, so several
    /// requests posted before the coordinator wakes collapse into one entry.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct RecoveryReasons: u8 {
        const HEALTH_FAULT          = 0b0000_0001;
        const MANUAL_TRIGGER        = 0b0000_0010;
        const SAFE_MODE_TIMEOUT     = 0b0000_0100;
        const WATCHDOG_INIT_FAILURE = 0b0000_1000;
    }
}

/// Why the recovery coordinator was asked to reboot the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryReason {
    /// Repeated feed failures or sustained degraded liveness.
    HealthFault,
    /// Operator asked for a reboot.
    ManualTrigger,
    /// The safe-mode stabilisation window ran out.
    SafeModeTimeout,
    /// The hardware watchdog could not be installed at boot.
    WatchdogInitFailure,
}

impl RecoveryReason {
    /// Flag assigned to this reason inside [`RecoveryReasons`].
    pub const fn flag(self) -> RecoveryReasons {
        match self {
            RecoveryReason::HealthFault => RecoveryReasons::HEALTH_FAULT,
            RecoveryReason::ManualTrigger => RecoveryReasons::MANUAL_TRIGGER,
            RecoveryReason::SafeModeTimeout => RecoveryReasons::SAFE_MODE_TIMEOUT,
            RecoveryReason::WatchdogInitFailure => RecoveryReasons::WATCHDOG_INIT_FAILURE,
        }
    }

    /// Human readable description used in log events.
    pub const fn describe(self) -> &'static str {
        match self {
            RecoveryReason::HealthFault => "persistent health fault",
            RecoveryReason::ManualTrigger => "manual recovery request",
            RecoveryReason::SafeModeTimeout => "safe-mode timeout",
            RecoveryReason::WatchdogInitFailure => "watchdog init failure",
        }
    }
}

impl From<RecoveryReason> for RecoveryReasons {
    fn from(reason: RecoveryReason) -> Self {
        reason.flag()
    }
}

impl std::fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// Reboot flavour requested from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebootMode {
    /// Core reset; RAM retention is platform defined.
    Warm,
    /// Full power-cycle equivalent.
    Cold,
}

/// Hardware-reported cause of the most recent reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetCause {
    PowerOn,
    Watchdog,
    Software,
    Unknown,
}

impl ResetCause {
    /// `true` when the hardware watchdog fired.
    pub fn is_watchdog(self) -> bool {
        matches!(self, ResetCause::Watchdog)
    }
}
