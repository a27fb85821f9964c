//! Platform reset control.

use lifeline_types::{RebootMode, ResetCause};

/// Resets the device.
///
/// On hardware `reboot` never returns.  Host doubles record the request and
/// return so the caller can observe it.
pub trait Rebooter: Send + Sync {
    fn reboot(&self, mode: RebootMode);
}

/// Reports (and clears) the cause of the most recent reset.
pub trait ResetCauseSource {
    fn take_reset_cause(&mut self) -> ResetCause;
}

impl ResetCauseSource for ResetCause {
    /// A fixed cause; reading it leaves [`ResetCause::Unknown`] behind.
    fn take_reset_cause(&mut self) -> ResetCause {
        std::mem::replace(self, ResetCause::Unknown)
    }
}
