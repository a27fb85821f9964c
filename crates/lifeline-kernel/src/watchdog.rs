//! Single-channel hardware watchdog wrapper.
//!
//! Owns the peripheral and its retune capability behind one mutex; the feed
//! gate and last applied timeout are atomics so status reads never block.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use lifeline_hal::{ChannelId, Retune, WatchdogPeripheral};
use lifeline_types::{FeedError, HalError, RetuneError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

struct Hardware {
    peripheral: Box<dyn WatchdogPeripheral>,
    retuner: Box<dyn Retune>,
    channel: Option<ChannelId>,
}

pub struct WatchdogTimer {
    hw: Mutex<Hardware>,
    feed_enabled: AtomicBool,
    timeout_ms: AtomicU32,
}

impl std::fmt::Debug for WatchdogTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchdogTimer")
            .field("installed", &self.is_installed())
            .field("feed_enabled", &self.is_enabled())
            .field("timeout_ms", &self.timeout_ms())
            .finish()
    }
}

impl WatchdogTimer {
    pub fn new(peripheral: Box<dyn WatchdogPeripheral>, retuner: Box<dyn Retune>) -> Self {
        Self {
            hw: Mutex::new(Hardware {
                peripheral,
                retuner,
                channel: None,
            }),
            feed_enabled: AtomicBool::new(true),
            timeout_ms: AtomicU32::new(0),
        }
    }

    /// Install the channel (first call only), start the watchdog and feed
    /// once.  Calling again re-runs setup and the feed without reinstalling;
    /// the reported timeout still follows the latest `boot_timeout_ms`.
    pub fn init(&self, boot_timeout_ms: u32) -> Result<(), HalError> {
        let mut hw = self.hw.lock();

        if !hw.peripheral.is_ready() {
            error!(evt = "WDT_NOT_READY", "watchdog device not ready");
            return Err(HalError::NotReady);
        }

        if hw.channel.is_none() {
            let channel = hw
                .peripheral
                .install_timeout(boot_timeout_ms)
                .inspect_err(|e| error!(evt = "WDT_INSTALL_FAIL", error = %e, "install failed"))?;
            hw.channel = Some(channel);
        }
        self.timeout_ms.store(boot_timeout_ms, Ordering::Release);

        hw.peripheral
            .setup()
            .inspect_err(|e| error!(evt = "WDT_SETUP_FAIL", error = %e, "setup failed"))?;

        info!(
            evt = "WDT_STARTED",
            timeout_ms = self.timeout_ms(),
            "watchdog running"
        );

        match self.feed_locked(&mut hw) {
            Ok(()) | Err(FeedError::Disabled) => Ok(()),
            Err(FeedError::NotInstalled) => Err(HalError::NotReady),
            Err(FeedError::Hardware(e)) => Err(e),
        }
    }

    /// Kick the watchdog.  [`FeedError::Disabled`] is the deliberate
    /// "let it bite" state, not a fault.
    pub fn feed(&self) -> Result<(), FeedError> {
        let mut hw = self.hw.lock();
        self.feed_locked(&mut hw)
    }

    fn feed_locked(&self, hw: &mut Hardware) -> Result<(), FeedError> {
        let channel = hw.channel.ok_or(FeedError::NotInstalled)?;
        if !self.is_enabled() {
            return Err(FeedError::Disabled);
        }
        hw.peripheral.feed(channel).map_err(FeedError::Hardware)
    }

    /// Open or close the feed gate.  Re-enabling feeds once straight away.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.feed_enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(evt = "WDT_FEED_GATE", enabled, "watchdog feed gate changed");
        }
        if enabled {
            match self.feed() {
                Ok(()) | Err(FeedError::NotInstalled) => {}
                Err(e) => warn!(evt = "WDT_FEED_FAIL", error = %e, "feed after re-enable failed"),
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.feed_enabled.load(Ordering::Acquire)
    }

    pub fn is_installed(&self) -> bool {
        self.hw.lock().channel.is_some()
    }

    /// Change the running window without stopping the watchdog.
    ///
    /// A request for the current value succeeds without touching hardware.
    pub fn retune(&self, timeout_ms: u32) -> Result<(), RetuneError> {
        let mut hw = self.hw.lock();
        if hw.channel.is_none() {
            return Err(RetuneError::NotInstalled);
        }
        if timeout_ms == 0 {
            return Err(RetuneError::InvalidTimeout(timeout_ms));
        }
        let current = self.timeout_ms();
        if timeout_ms == current {
            debug!(evt = "WDT_RETUNE_NOOP", timeout_ms, "timeout unchanged");
            return Ok(());
        }

        hw.retuner.retune(timeout_ms)?;
        self.timeout_ms.store(timeout_ms, Ordering::Release);
        info!(
            evt = "WDT_RETUNED",
            previous_ms = current,
            timeout_ms,
            "watchdog window changed"
        );
        Ok(())
    }

    /// Check `timeout_ms` against what the retuner can encode.
    pub fn check_timeout(&self, timeout_ms: u32) -> Result<(), RetuneError> {
        if timeout_ms == 0 {
            return Err(RetuneError::InvalidTimeout(timeout_ms));
        }
        self.hw.lock().retuner.validate(timeout_ms)
    }

    /// Last successfully applied timeout, `0` before install.
    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms.load(Ordering::Acquire)
    }
}
