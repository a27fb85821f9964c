//! Recovery coordinator.
//!
//! Reasons are posted over an unbounded channel; the coordinator drains
//! everything queued at wake-up, so repeated posts coalesce into one
//! [`RecoveryReasons`] flag set.  The safe-mode deadline is a single absolute instant kept
//! next to a [`Notify`] so cancellation wakes the loop at once instead of
//! waiting out a stale sleep.
//!
//! Every reboot is terminal.  On hardware [`Rebooter::reboot`] never returns;
//! host doubles return, and [`RecoveryCoordinator::run`] then reports what
//! triggered it.

use std::sync::Arc;
use std::time::Duration;

use lifeline_hal::Rebooter;
use lifeline_types::{RebootMode, RecoveryReason, RecoveryReasons};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Pause before a fault reboot so pending log output can drain.
    pub settle_delay: Duration,
    pub mode: RebootMode,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(200),
            mode: RebootMode::Warm,
        }
    }
}

/// Effect of a [`RecoveryHandle::schedule_safe_mode_reboot`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineChange {
    /// No deadline was pending; one is now armed.
    Armed,
    /// A pending deadline was replaced with a new one.
    Replaced,
    /// A pending deadline was cancelled.
    Cancelled,
    /// Cancel requested with nothing pending.
    NoChange,
}

/// What made the coordinator reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
    /// The safe-mode deadline expired.
    DeadlineExpired,
    /// A posted reason; the highest-priority one when several coalesced.
    Requested(RecoveryReason),
}

#[derive(Debug, Default)]
struct Deadline {
    at: Option<Instant>,
    delay_ms: u32,
}

#[derive(Debug, Default)]
struct Shared {
    deadline: Mutex<Deadline>,
    changed: Notify,
}

impl Shared {
    fn deadline(&self) -> Option<Instant> {
        self.deadline.lock().at
    }

    fn clear_deadline(&self) -> Option<u32> {
        let mut d = self.deadline.lock();
        d.at.take().map(|_| d.delay_ms)
    }
}

/// Cloneable handle used by the boot sequence, the supervisor and the
/// operator surface.  Safe to use from any thread.
#[derive(Debug, Clone)]
pub struct RecoveryHandle {
    tx: mpsc::UnboundedSender<RecoveryReason>,
    shared: Arc<Shared>,
}

impl RecoveryHandle {
    /// Post a reason.  Posted reasons cannot be withdrawn.
    pub fn request(&self, reason: RecoveryReason) {
        warn!(
            evt = "RECOVERY_REQUESTED",
            reason = %reason,
            "recovery requested"
        );
        if self.tx.send(reason).is_err() {
            error!(
                evt = "RECOVERY_UNDELIVERED",
                reason = %reason,
                "recovery coordinator is gone"
            );
        }
    }

    /// Arm, replace (`delay_ms > 0`) or cancel (`0`) the safe-mode deadline.
    pub fn schedule_safe_mode_reboot(&self, delay_ms: u32) -> DeadlineChange {
        let change = {
            let mut d = self.shared.deadline.lock();
            if delay_ms == 0 {
                d.delay_ms = 0;
                match d.at.take() {
                    Some(_) => DeadlineChange::Cancelled,
                    None => DeadlineChange::NoChange,
                }
            } else {
                let was_armed = d
                    .at
                    .replace(Instant::now() + Duration::from_millis(u64::from(delay_ms)))
                    .is_some();
                d.delay_ms = delay_ms;
                if was_armed {
                    DeadlineChange::Replaced
                } else {
                    DeadlineChange::Armed
                }
            }
        };

        match change {
            DeadlineChange::Cancelled => {
                info!(evt = "SAFE_MODE_REBOOT_CANCELLED", "safe-mode reboot cancelled");
            }
            DeadlineChange::Armed | DeadlineChange::Replaced => info!(
                evt = "SAFE_MODE_REBOOT_SCHEDULED",
                delay_ms,
                replaced = change == DeadlineChange::Replaced,
                "safe-mode reboot scheduled"
            ),
            DeadlineChange::NoChange => return change,
        }
        self.shared.changed.notify_one();
        change
    }

    /// Pending safe-mode deadline, if any.
    pub fn safe_mode_deadline(&self) -> Option<Instant> {
        self.shared.deadline()
    }
}

/// Waits for a reason or the safe-mode deadline, then reboots.
pub struct RecoveryCoordinator {
    rx: mpsc::UnboundedReceiver<RecoveryReason>,
    shared: Arc<Shared>,
    rebooter: Arc<dyn Rebooter>,
    config: RecoveryConfig,
}

impl RecoveryCoordinator {
    pub fn new(rebooter: Arc<dyn Rebooter>, config: RecoveryConfig) -> (Self, RecoveryHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let handle = RecoveryHandle {
            tx,
            shared: Arc::clone(&shared),
        };
        (
            Self {
                rx,
                shared,
                rebooter,
                config,
            },
            handle,
        )
    }

    /// Take every queued reason without blocking.
    pub fn drain_requests(&mut self) -> RecoveryReasons {
        let mut set = RecoveryReasons::empty();
        while let Ok(reason) = self.rx.try_recv() {
            set |= reason.flag();
        }
        set
    }

    /// Run until a reboot is issued.
    pub async fn run(mut self) -> RecoveryTrigger {
        info!(evt = "RECOVERY_STARTED", "recovery coordinator running");
        let shared = Arc::clone(&self.shared);

        loop {
            // Register for wake-ups before reading the deadline so a change
            // made in between is not missed.
            let changed = shared.changed.notified();
            let deadline = shared.deadline();

            if deadline.is_some_and(|at| at <= Instant::now()) {
                return self.expire_deadline();
            }

            tokio::select! {
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
                Some(first) = self.rx.recv() => {
                    let mut reasons = self.drain_requests();
                    reasons |= first.flag();
                    return self.handle(reasons).await;
                }
                _ = changed => {}
            }
        }
    }

    fn expire_deadline(&self) -> RecoveryTrigger {
        let delay_ms = self.shared.clear_deadline().unwrap_or_default();
        warn!(
            evt = "SAFE_MODE_TIMEOUT",
            delay_ms,
            "safe-mode deadline reached; rebooting"
        );
        self.reboot();
        RecoveryTrigger::DeadlineExpired
    }

    async fn handle(&self, reasons: RecoveryReasons) -> RecoveryTrigger {
        info!(evt = "RECOVERY_WAKE", reasons = reasons.bits(), "recovery reasons received");

        if reasons.contains(RecoveryReasons::HEALTH_FAULT) {
            error!(evt = "HEALTH_FAULT_REBOOT", "health fault; rebooting");
            return self.settle_and_reboot(RecoveryReason::HealthFault).await;
        }
        if reasons.contains(RecoveryReasons::MANUAL_TRIGGER) {
            warn!(evt = "MANUAL_REBOOT", "manual recovery; rebooting");
            return self.settle_and_reboot(RecoveryReason::ManualTrigger).await;
        }
        if reasons.contains(RecoveryReasons::SAFE_MODE_TIMEOUT) {
            let delay_ms = self.shared.clear_deadline();
            warn!(
                evt = "SAFE_MODE_TIMEOUT",
                delay_ms = delay_ms.unwrap_or_default(),
                "safe-mode timeout posted; rebooting"
            );
            self.reboot();
            return RecoveryTrigger::Requested(RecoveryReason::SafeModeTimeout);
        }
        error!(evt = "WATCHDOG_INIT_REBOOT", "watchdog init failed; rebooting");
        self.settle_and_reboot(RecoveryReason::WatchdogInitFailure).await
    }

    async fn settle_and_reboot(&self, reason: RecoveryReason) -> RecoveryTrigger {
        sleep(self.config.settle_delay).await;
        self.reboot();
        RecoveryTrigger::Requested(reason)
    }

    fn reboot(&self) {
        warn!(evt = "REBOOT", mode = ?self.config.mode, "rebooting");
        self.rebooter.reboot(self.config.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_hal::sim::RecordingRebooter;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    fn coordinator() -> (RecoveryCoordinator, RecoveryHandle, RecordingRebooter) {
        let rebooter = RecordingRebooter::new();
        let (coord, handle) =
            RecoveryCoordinator::new(Arc::new(rebooter.clone()), RecoveryConfig::default());
        (coord, handle, rebooter)
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_reboots_after_settle_delay() {
        let (coord, handle, rebooter) = coordinator();
        let start = Instant::now();
        handle.request(RecoveryReason::ManualTrigger);

        let trigger = coord.run().await;
        assert_eq!(trigger, RecoveryTrigger::Requested(RecoveryReason::ManualTrigger));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(rebooter.reboots(), vec![RebootMode::Warm]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_posts_coalesce_into_one_reboot() {
        let (coord, handle, rebooter) = coordinator();
        for _ in 0..3 {
            handle.request(RecoveryReason::WatchdogInitFailure);
        }
        handle.request(RecoveryReason::HealthFault);

        let trigger = coord.run().await;
        assert_eq!(trigger, RecoveryTrigger::Requested(RecoveryReason::HealthFault));
        assert_eq!(rebooter.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_outranks_timeout_and_init_failure() {
        let (coord, handle, rebooter) = coordinator();
        handle.request(RecoveryReason::WatchdogInitFailure);
        handle.request(RecoveryReason::SafeModeTimeout);
        handle.request(RecoveryReason::ManualTrigger);

        let trigger = coord.run().await;
        assert_eq!(trigger, RecoveryTrigger::Requested(RecoveryReason::ManualTrigger));
        assert_eq!(rebooter.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_reboots() {
        let (coord, handle, rebooter) = coordinator();
        assert_eq!(handle.schedule_safe_mode_reboot(5000), DeadlineChange::Armed);

        let mut task = tokio::spawn(coord.run());
        assert!(timeout(Duration::from_millis(4900), &mut task).await.is_err());
        assert_eq!(rebooter.count(), 0);

        let trigger = timeout(Duration::from_millis(200), task).await.unwrap().unwrap();
        assert_eq!(trigger, RecoveryTrigger::DeadlineExpired);
        assert_eq!(rebooter.count(), 1);
        assert_eq!(handle.safe_mode_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_deadline() {
        let (coord, handle, _rebooter) = coordinator();
        handle.schedule_safe_mode_reboot(60_000);
        let mut task = tokio::spawn(coord.run());
        assert!(timeout(Duration::from_millis(100), &mut task).await.is_err());

        assert_eq!(handle.schedule_safe_mode_reboot(1000), DeadlineChange::Replaced);
        let trigger = timeout(Duration::from_millis(1100), task).await.unwrap().unwrap();
        assert_eq!(trigger, RecoveryTrigger::DeadlineExpired);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn cancelled_deadline_never_reboots() {
        let (coord, handle, rebooter) = coordinator();
        handle.schedule_safe_mode_reboot(5000);
        let mut task = tokio::spawn(coord.run());
        assert!(timeout(Duration::from_millis(1000), &mut task).await.is_err());

        assert_eq!(handle.schedule_safe_mode_reboot(0), DeadlineChange::Cancelled);
        assert_eq!(handle.schedule_safe_mode_reboot(0), DeadlineChange::NoChange);
        assert!(timeout(Duration::from_millis(30_000), &mut task).await.is_err());
        assert_eq!(rebooter.count(), 0);

        logs_assert(|lines: &[&str]| {
            let cancelled = lines
                .iter()
                .filter(|l| l.contains("SAFE_MODE_REBOOT_CANCELLED"))
                .count();
            match cancelled {
                1 => Ok(()),
                n => Err(format!("expected one cancellation event, saw {n}")),
            }
        });
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn posted_safe_mode_timeout_clears_deadline() {
        let (coord, handle, rebooter) = coordinator();
        handle.schedule_safe_mode_reboot(300_000);
        handle.request(RecoveryReason::SafeModeTimeout);

        let trigger = coord.run().await;
        assert_eq!(trigger, RecoveryTrigger::Requested(RecoveryReason::SafeModeTimeout));
        assert_eq!(handle.safe_mode_deadline(), None);
        assert_eq!(rebooter.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reason_arriving_while_deadline_pending_wins() {
        let (coord, handle, _rebooter) = coordinator();
        handle.schedule_safe_mode_reboot(300_000);
        let mut task = tokio::spawn(coord.run());
        assert!(timeout(Duration::from_millis(10), &mut task).await.is_err());

        handle.request(RecoveryReason::ManualTrigger);
        let trigger = timeout(Duration::from_millis(500), task).await.unwrap().unwrap();
        assert_eq!(trigger, RecoveryTrigger::Requested(RecoveryReason::ManualTrigger));
    }

    #[test]
    fn drain_collects_queued_reasons() {
        let (mut coord, handle, _rebooter) = coordinator();
        handle.request(RecoveryReason::HealthFault);
        handle.request(RecoveryReason::HealthFault);
        handle.request(RecoveryReason::ManualTrigger);

        let set = coord.drain_requests();
        assert_eq!(set, RecoveryReasons::HEALTH_FAULT | RecoveryReasons::MANUAL_TRIGGER);
        assert!(set.contains(RecoveryReasons::HEALTH_FAULT));
        assert!(coord.drain_requests().is_empty());
    }

    #[test]
    fn cancel_without_deadline_is_noop() {
        let (_coord, handle, _rebooter) = coordinator();
        assert_eq!(handle.schedule_safe_mode_reboot(0), DeadlineChange::NoChange);
    }
}
