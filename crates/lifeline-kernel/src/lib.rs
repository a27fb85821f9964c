//! `lifeline-kernel` – Liveness & Recovery Core
//!
//! Keeps a deployed device alive and recoverable.  It does not sample
//! sensors or parse commands; it decides when the hardware watchdog is fed
//! and when the device must reboot.
//!
//! # Modules
//!
//! - [`fault_store`] – [`PersistentFaultStore`][fault_store::PersistentFaultStore]:
//!   the durable boot/crash counters and watchdog override, optionally
//!   encrypted at rest, mounted with bounded retries.
//! - [`watchdog`] – [`WatchdogTimer`][watchdog::WatchdogTimer]:
//!   install/feed/retune/enable over a single hardware channel.
//! - [`supervisor`] – [`Supervisor`][supervisor::Supervisor]:
//!   the periodic loop that samples liveness, feeds or withholds the feed,
//!   applies deferred retunes, and escalates to recovery.
//! - [`recovery`] – [`RecoveryCoordinator`][recovery::RecoveryCoordinator]:
//!   event- and deadline-driven reboot orchestration.
//! - [`retry`] – bounded fixed-delay retry helper.

pub mod fault_store;
pub mod recovery;
pub mod retry;
pub mod supervisor;
pub mod watchdog;

pub use fault_store::{FaultStoreConfig, PersistentFaultStore, RECORD_ID};
pub use recovery::{
    DeadlineChange, RecoveryConfig, RecoveryCoordinator, RecoveryHandle, RecoveryTrigger,
};
pub use retry::retry;
pub use supervisor::{
    HealthStatus, MAX_TIMEOUT_MS, MIN_TIMEOUT_MS, Supervisor, SupervisorConfig, SupervisorDeps,
    SupervisorHandle, TickReport, WatchdogConfig, WatchdogTarget,
};
pub use watchdog::WatchdogTimer;
