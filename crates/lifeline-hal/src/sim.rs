//! In-process simulation doubles for CI and the host device simulator.
//!
//! Every double is a cheap handle around shared state: clone it, hand one
//! clone to the component under test, and keep the other to inject faults and
//! inspect what happened.  Cloning a [`SimFlash`] before a simulated reboot
//! keeps its records, exactly like real flash.
//!
//! # Example
//!
//! ```rust
//! use lifeline_hal::sim::SimFlash;
//! use lifeline_hal::storage::BackingStore;
//!
//! let flash = SimFlash::new();
//! flash.fail_next_opens(2);
//!
//! let mut dev = flash.clone();
//! assert!(dev.open("storage").is_err());
//! assert!(dev.open("storage").is_err());
//! assert!(dev.open("storage").is_ok());
//! assert_eq!(flash.open_attempts(), 3);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use lifeline_types::{HalError, RebootMode, StorageError};
use parking_lot::Mutex;

use crate::reboot::Rebooter;
use crate::retune::{IwdgRegisters, IwdgSetting, LSI_HZ};
use crate::storage::{BackingStore, PartitionInfo};
use crate::watchdog::{ChannelId, WatchdogPeripheral};

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SimWatchdogState {
    ready: bool,
    channel: Option<ChannelId>,
    running: bool,
    window_ms: u32,
    last_feed: Option<Instant>,
    feed_count: u64,
    install_count: u32,
    setup_count: u32,
    failing_feeds: u32,
    // Register block
    pending: IwdgSetting,
    settle_polls: Option<u32>,
    polls_left: Option<u32>,
    counter_reloads: u32,
}

/// Simulated single-channel watchdog whose expiry can be observed.
#[derive(Debug, Clone)]
pub struct SimWatchdog {
    state: Arc<Mutex<SimWatchdogState>>,
}

impl Default for SimWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl SimWatchdog {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimWatchdogState {
                ready: true,
                channel: None,
                running: false,
                window_ms: 0,
                last_feed: None,
                feed_count: 0,
                install_count: 0,
                setup_count: 0,
                failing_feeds: 0,
                pending: IwdgSetting {
                    prescaler_code: 0,
                    reload: 0,
                },
                settle_polls: Some(0),
                polls_left: None,
                counter_reloads: 0,
            })),
        }
    }

    /// A device whose driver never became ready.
    pub fn not_ready() -> Self {
        let wdt = Self::new();
        wdt.state.lock().ready = false;
        wdt
    }

    /// Make the next `n` feeds fail with a hardware error.
    pub fn fail_next_feeds(&self, n: u32) {
        self.state.lock().failing_feeds = n;
    }

    /// Number of polls before a register write settles; `None` never settles.
    pub fn set_settle_polls(&self, polls: Option<u32>) {
        self.state.lock().settle_polls = polls;
    }

    pub fn feed_count(&self) -> u64 {
        self.state.lock().feed_count
    }

    pub fn install_count(&self) -> u32 {
        self.state.lock().install_count
    }

    pub fn setup_count(&self) -> u32 {
        self.state.lock().setup_count
    }

    /// Window currently enforced by the simulated hardware.
    pub fn window_ms(&self) -> u32 {
        self.state.lock().window_ms
    }

    pub fn counter_reloads(&self) -> u32 {
        self.state.lock().counter_reloads
    }

    /// `true` once the running watchdog has gone a full window unfed.
    pub fn expired(&self) -> bool {
        let s = self.state.lock();
        match (s.running, s.last_feed) {
            (true, Some(at)) => at.elapsed().as_millis() > u128::from(s.window_ms),
            _ => false,
        }
    }

    /// Register block view used by [`IwdgRetune`][crate::retune::IwdgRetune].
    pub fn registers(&self) -> SimIwdgRegisters {
        SimIwdgRegisters {
            state: Arc::clone(&self.state),
        }
    }
}

impl WatchdogPeripheral for SimWatchdog {
    fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    fn install_timeout(&mut self, window_max_ms: u32) -> Result<ChannelId, HalError> {
        let mut s = self.state.lock();
        if s.channel.is_some() {
            return Err(HalError::Hardware("timeout channel already installed".into()));
        }
        s.install_count += 1;
        s.window_ms = window_max_ms;
        let id = ChannelId(0);
        s.channel = Some(id);
        Ok(id)
    }

    fn setup(&mut self) -> Result<(), HalError> {
        let mut s = self.state.lock();
        if s.channel.is_none() {
            return Err(HalError::Hardware("no timeout channel installed".into()));
        }
        s.setup_count += 1;
        s.running = true;
        s.last_feed = Some(Instant::now());
        Ok(())
    }

    fn feed(&mut self, channel: ChannelId) -> Result<(), HalError> {
        let mut s = self.state.lock();
        if s.channel != Some(channel) {
            return Err(HalError::Hardware(format!("unknown channel {}", channel.0)));
        }
        if s.failing_feeds > 0 {
            s.failing_feeds -= 1;
            return Err(HalError::Hardware("feed register write failed".into()));
        }
        s.feed_count += 1;
        s.last_feed = Some(Instant::now());
        Ok(())
    }
}

/// Prescaler/reload registers of a [`SimWatchdog`].
#[derive(Debug, Clone)]
pub struct SimIwdgRegisters {
    state: Arc<Mutex<SimWatchdogState>>,
}

impl IwdgRegisters for SimIwdgRegisters {
    fn enable_write_access(&mut self) {}

    fn set_prescaler(&mut self, code: u32) {
        let mut s = self.state.lock();
        s.pending.prescaler_code = code;
        s.polls_left = s.settle_polls;
    }

    fn set_reload(&mut self, reload: u32) {
        let mut s = self.state.lock();
        s.pending.reload = reload;
        s.polls_left = s.settle_polls;
    }

    fn is_ready(&self) -> bool {
        let mut s = self.state.lock();
        match s.polls_left {
            Some(0) => true,
            Some(n) => {
                s.polls_left = Some(n - 1);
                false
            }
            None => false,
        }
    }

    fn reload_counter(&mut self) {
        let mut s = self.state.lock();
        s.window_ms = s.pending.window_ms(LSI_HZ);
        s.last_feed = Some(Instant::now());
        s.counter_reloads += 1;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Flash
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimFlashState {
    records: HashMap<u16, Vec<u8>>,
    mounted: bool,
    open_failures: u32,
    mount_failures: u32,
    write_failure: bool,
    open_attempts: u32,
    mount_attempts: u32,
    write_count: u32,
}

/// In-memory [`BackingStore`] with fault injection.
#[derive(Debug, Clone, Default)]
pub struct SimFlash {
    state: Arc<Mutex<SimFlashState>>,
}

impl SimFlash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.state.lock().open_failures = n;
    }

    pub fn fail_next_mounts(&self, n: u32) {
        self.state.lock().mount_failures = n;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().write_failure = fail;
    }

    pub fn open_attempts(&self) -> u32 {
        self.state.lock().open_attempts
    }

    pub fn mount_attempts(&self) -> u32 {
        self.state.lock().mount_attempts
    }

    /// Successful writes since creation.
    pub fn write_count(&self) -> u32 {
        self.state.lock().write_count
    }

    /// Raw stored bytes of record `id`.
    pub fn raw(&self, id: u16) -> Option<Vec<u8>> {
        self.state.lock().records.get(&id).cloned()
    }

    /// Store raw bytes, bypassing mount checks and write counting.
    pub fn put_raw(&self, id: u16, bytes: &[u8]) {
        self.state.lock().records.insert(id, bytes.to_vec());
    }

    /// Forget the mount, keep the data.
    pub fn power_cycle(&self) {
        self.state.lock().mounted = false;
    }
}

impl BackingStore for SimFlash {
    fn open(&mut self, partition: &str) -> Result<PartitionInfo, StorageError> {
        let mut s = self.state.lock();
        s.open_attempts += 1;
        if s.open_failures > 0 {
            s.open_failures -= 1;
            return Err(StorageError::Open(partition.to_string()));
        }
        Ok(PartitionInfo {
            name: partition.to_string(),
            sector_size: 128,
            sector_count: 8,
        })
    }

    fn mount(&mut self, _partition: &PartitionInfo) -> Result<(), StorageError> {
        let mut s = self.state.lock();
        s.mount_attempts += 1;
        if s.mount_failures > 0 {
            s.mount_failures -= 1;
            return Err(StorageError::Mount("simulated mount failure".into()));
        }
        s.mounted = true;
        Ok(())
    }

    fn read(&mut self, id: u16) -> Result<Option<Vec<u8>>, StorageError> {
        let s = self.state.lock();
        if !s.mounted {
            return Err(StorageError::NotMounted);
        }
        Ok(s.records.get(&id).cloned())
    }

    fn write(&mut self, id: u16, data: &[u8]) -> Result<(), StorageError> {
        let mut s = self.state.lock();
        if !s.mounted {
            return Err(StorageError::NotMounted);
        }
        if s.write_failure {
            return Err(StorageError::Io("simulated write failure".into()));
        }
        s.records.insert(id, data.to_vec());
        s.write_count += 1;
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), StorageError> {
        let mut s = self.state.lock();
        if !s.mounted {
            return Err(StorageError::NotMounted);
        }
        s.records.clear();
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Rebooter
// ────────────────────────────────────────────────────────────────────────────

/// [`Rebooter`] that records each request instead of resetting.
#[derive(Debug, Clone, Default)]
pub struct RecordingRebooter {
    reboots: Arc<Mutex<Vec<RebootMode>>>,
}

impl RecordingRebooter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reboots(&self) -> Vec<RebootMode> {
        self.reboots.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.reboots.lock().len()
    }
}

impl Rebooter for RecordingRebooter {
    fn reboot(&self, mode: RebootMode) {
        self.reboots.lock().push(mode);
    }
}
