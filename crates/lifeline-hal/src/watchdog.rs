//! Generic `WatchdogPeripheral` trait for a single-channel hardware watchdog.

use lifeline_types::HalError;

/// Identifier returned by [`WatchdogPeripheral::install_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u8);

/// A hardware watchdog able to reset the SoC when not fed in time.
///
/// Drivers implement this trait; the kernel's `WatchdogTimer` owns exactly
/// one instance and serialises access to it.
pub trait WatchdogPeripheral: Send {
    /// `false` while the device driver has not finished initialising.
    fn is_ready(&self) -> bool;

    /// Install a reset-on-expiry timeout channel with a `[0, window_max_ms]`
    /// window. Hardware allows this once per boot.
    ///
    /// # Errors
    ///
    /// Returns [`HalError`] when the channel cannot be installed.
    fn install_timeout(&mut self, window_max_ms: u32) -> Result<ChannelId, HalError>;

    /// Start the watchdog with the installed channels.
    fn setup(&mut self) -> Result<(), HalError>;

    /// Restart the countdown on `channel`.
    fn feed(&mut self, channel: ChannelId) -> Result<(), HalError>;
}
