//! `lifeline-hal` – Hardware Abstraction Layer
//!
//! Every collaborator the recovery core talks to is a trait defined here, so
//! the kernel never branches on hardware type.
//!
//! # Modules
//!
//! - [`watchdog`] – [`WatchdogPeripheral`][watchdog::WatchdogPeripheral]:
//!   one-time channel install, setup, and feed.
//! - [`retune`] – [`Retune`][retune::Retune]: live window reconfiguration,
//!   one implementation per hardware family
//!   ([`IwdgRetune`][retune::IwdgRetune], [`FixedWindow`][retune::FixedWindow]).
//! - [`storage`] – [`BackingStore`][storage::BackingStore]: open/mount with
//!   id-addressed records; [`FileStore`][storage::FileStore] keeps them in a
//!   directory.
//! - [`cipher`] – [`RecordCipher`][cipher::RecordCipher]: optional
//!   encryption at rest.
//! - [`clock`] – [`Clock`][clock::Clock]: monotonic milliseconds.
//! - [`reboot`] – [`Rebooter`][reboot::Rebooter] and
//!   [`ResetCauseSource`][reboot::ResetCauseSource].
//! - [`sim`] – in-process doubles for CI and the host simulator.

pub mod cipher;
pub mod clock;
pub mod reboot;
pub mod retune;
pub mod sim;
pub mod storage;
pub mod watchdog;

pub use cipher::{DisabledCipher, KeystreamCipher, RecordCipher};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use reboot::{Rebooter, ResetCauseSource};
pub use retune::{FixedWindow, IwdgRegisters, IwdgRetune, IwdgSetting, Retune};
pub use storage::{BackingStore, FileStore, PartitionInfo};
pub use watchdog::{ChannelId, WatchdogPeripheral};
