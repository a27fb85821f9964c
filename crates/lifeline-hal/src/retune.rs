//! Live watchdog retune, one implementation per hardware family.
//!
//! Changing the window of a running watchdog is hardware specific: some
//! families expose prescaler/reload registers that can be rewritten while the
//! counter keeps running, others fix the window at install time.  The kernel
//! only ever sees the [`Retune`] capability.
//!
//! | Family | Type | Behaviour |
//! |---|---|---|
//! | independent watchdog (prescaler + 12-bit reload) | [`IwdgRetune`] | computes a setting, writes it, polls for the update to settle |
//! | fixed window | [`FixedWindow`] | always [`RetuneError::Unsupported`] |

use std::time::{Duration, Instant};

use lifeline_types::RetuneError;

/// Capability to change a running watchdog's expiry window in place.
pub trait Retune: Send {
    /// Apply `timeout_ms` without disabling protection.
    ///
    /// # Errors
    ///
    /// * [`RetuneError::Unsupported`] – permanent for this hardware.
    /// * [`RetuneError::Busy`] – the update did not settle; retry later.
    /// * [`RetuneError::InvalidTimeout`] – the value cannot be represented.
    fn retune(&mut self, timeout_ms: u32) -> Result<(), RetuneError>;

    /// Whether `timeout_ms` can be encoded, without touching hardware.
    /// Families that never retune accept everything; [`Retune::retune`]
    /// reports them unsupported.
    fn validate(&self, _timeout_ms: u32) -> Result<(), RetuneError> {
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Fixed window
// ────────────────────────────────────────────────────────────────────────────

/// Hardware whose prescaler is fixed once the watchdog starts.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedWindow;

impl Retune for FixedWindow {
    fn retune(&mut self, _timeout_ms: u32) -> Result<(), RetuneError> {
        Err(RetuneError::Unsupported)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Independent watchdog (prescaler + reload)
// ────────────────────────────────────────────────────────────────────────────

/// Nominal low-speed oscillator frequency clocking the watchdog.
pub const LSI_HZ: u32 = 32_000;
const RELOAD_MAX: u64 = 0x0FFF;
const PRESCALER_MIN: u64 = 4;
const PRESCALER_MAX: u64 = 256;

/// Register block of an independent watchdog.
pub trait IwdgRegisters: Send {
    /// Unlock the prescaler and reload registers.
    fn enable_write_access(&mut self);
    /// `code` selects divider `4 << code`.
    fn set_prescaler(&mut self, code: u32);
    fn set_reload(&mut self, reload: u32);
    /// `true` once the last prescaler/reload write has been taken over.
    fn is_ready(&self) -> bool;
    /// Restart the countdown from the reload value.
    fn reload_counter(&mut self);
}

/// Register values encoding one timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IwdgSetting {
    pub prescaler_code: u32,
    pub reload: u32,
}

impl IwdgSetting {
    /// Pick the smallest divider whose reload fits in 12 bits.
    pub fn for_timeout(timeout_ms: u32, lsi_hz: u32) -> Result<Self, RetuneError> {
        let ticks = u64::from(timeout_ms) * u64::from(lsi_hz) / 1_000;
        let mut shift = 0u32;
        let mut divider = PRESCALER_MIN;

        while ticks / divider > RELOAD_MAX {
            shift += 1;
            divider = PRESCALER_MIN << shift;
            if divider > PRESCALER_MAX {
                return Err(RetuneError::InvalidTimeout(timeout_ms));
            }
        }

        let value = ticks / divider;
        if value == 0 {
            return Err(RetuneError::InvalidTimeout(timeout_ms));
        }
        let reload = (value - 1).min(RELOAD_MAX);

        Ok(Self {
            prescaler_code: shift,
            reload: u32::try_from(reload).map_err(|_| RetuneError::InvalidTimeout(timeout_ms))?,
        })
    }

    /// Window in milliseconds encoded by this setting.
    pub fn window_ms(&self, lsi_hz: u32) -> u32 {
        let divider = PRESCALER_MIN << self.prescaler_code;
        let ticks = (u64::from(self.reload) + 1) * divider;
        u32::try_from(ticks * 1_000 / u64::from(lsi_hz.max(1))).unwrap_or(u32::MAX)
    }
}

/// [`Retune`] for independent watchdogs with a live-writable prescaler.
pub struct IwdgRetune<R: IwdgRegisters> {
    regs: R,
    lsi_hz: u32,
    poll_budget: Duration,
}

impl<R: IwdgRegisters> IwdgRetune<R> {
    /// Poll budget covers six LSI periods at the largest divider.
    pub fn new(regs: R) -> Self {
        let budget_ms = 6 * PRESCALER_MAX * 1_000 / u64::from(LSI_HZ);
        Self {
            regs,
            lsi_hz: LSI_HZ,
            poll_budget: Duration::from_millis(budget_ms),
        }
    }

    pub fn with_poll_budget(mut self, budget: Duration) -> Self {
        self.poll_budget = budget;
        self
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }
}

impl<R: IwdgRegisters> Retune for IwdgRetune<R> {
    fn validate(&self, timeout_ms: u32) -> Result<(), RetuneError> {
        IwdgSetting::for_timeout(timeout_ms, self.lsi_hz).map(|_| ())
    }

    fn retune(&mut self, timeout_ms: u32) -> Result<(), RetuneError> {
        let setting = IwdgSetting::for_timeout(timeout_ms, self.lsi_hz)?;

        self.regs.enable_write_access();
        self.regs.set_prescaler(setting.prescaler_code);
        self.regs.set_reload(setting.reload);

        let start = Instant::now();
        while !self.regs.is_ready() {
            if start.elapsed() > self.poll_budget {
                return Err(RetuneError::Busy);
            }
            std::hint::spin_loop();
        }

        self.regs.reload_counter();
        Ok(())
    }
}
