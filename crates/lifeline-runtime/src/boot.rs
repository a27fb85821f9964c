//! Boot sequence.
//!
//! Wires the core together in the order the device depends on:
//!
//! 1. load the fault store (failure is logged; boot continues degraded);
//! 2. read the reset cause and record the boot;
//! 3. derive safe mode from the consecutive watchdog run;
//! 4. arm or cancel the safe-mode reboot deadline;
//! 5. pick the steady-state watchdog target;
//! 6. install the watchdog with the boot timeout;
//! 7. start the supervisor;
//! 8. draw a session counter for the crypto collaborator.
//!
//! A watchdog that cannot be installed posts
//! [`RecoveryReason::WatchdogInitFailure`] and leaves the supervisor unstarted.

use std::sync::Arc;
use std::time::Duration;

use lifeline_hal::{
    BackingStore, Clock, RecordCipher, Rebooter, ResetCauseSource, Retune, WatchdogPeripheral,
};
use lifeline_kernel::{
    DeadlineChange, FaultStoreConfig, PersistentFaultStore, RecoveryConfig, RecoveryCoordinator,
    RecoveryHandle, Supervisor, SupervisorConfig, SupervisorDeps, SupervisorHandle,
    WatchdogTarget, WatchdogTimer,
};
use lifeline_types::{RebootMode, RecoveryReason, ResetCause};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

/// Boot-time tunables.  Every field has a default, so a partial TOML or JSON
/// document is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Watchdog window while the system comes up.
    pub boot_timeout_ms: u32,
    /// Default steady-state window when no override is persisted.
    pub steady_timeout_ms: u32,
    /// Delay before the supervisor retunes to the steady window.
    pub retune_delay_ms: u32,
    /// How long safe mode runs before a planned reboot.
    pub safe_mode_reboot_delay_ms: u32,
    /// Consecutive watchdog resets that trigger safe mode.
    pub reset_threshold: u32,
    pub period_ms: u64,
    pub boot_grace_ms: u64,
    pub max_failures: u32,
    pub heartbeat_stale_ms: u64,
    pub led_stale_ms: u64,
    pub monitor_led: bool,
    pub settle_delay_ms: u64,
    pub partition: String,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            boot_timeout_ms: 8000,
            steady_timeout_ms: 3000,
            retune_delay_ms: 10_000,
            safe_mode_reboot_delay_ms: 300_000,
            reset_threshold: 3,
            period_ms: 1000,
            boot_grace_ms: 3000,
            max_failures: 3,
            heartbeat_stale_ms: 3000,
            led_stale_ms: 3000,
            monitor_led: true,
            settle_delay_ms: 200,
            partition: "storage".into(),
        }
    }
}

impl BootConfig {
    pub fn store_config(&self) -> FaultStoreConfig {
        FaultStoreConfig {
            partition: self.partition.clone(),
            fallback_threshold: self.reset_threshold,
            ..FaultStoreConfig::default()
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            period: Duration::from_millis(self.period_ms),
            boot_grace: Duration::from_millis(self.boot_grace_ms),
            max_failures: self.max_failures,
            heartbeat_stale_ms: self.heartbeat_stale_ms,
            led_stale_ms: self.led_stale_ms,
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            mode: RebootMode::Warm,
        }
    }

    /// Steady target and retune delay for this boot.  Safe mode never
    /// shortens the window below the boot timeout and retunes at once.
    pub fn watchdog_plan(&self, override_ms: u32, safe_mode: bool) -> (u32, u32) {
        let steady = if override_ms == 0 {
            self.steady_timeout_ms
        } else {
            override_ms
        };
        if safe_mode {
            (steady.max(self.boot_timeout_ms), 0)
        } else {
            (steady, self.retune_delay_ms)
        }
    }
}

/// Device collaborators handed to [`boot`].
pub struct Platform {
    pub backend: Box<dyn BackingStore>,
    pub cipher: Arc<dyn RecordCipher>,
    pub peripheral: Box<dyn WatchdogPeripheral>,
    pub retuner: Box<dyn Retune>,
    pub rebooter: Arc<dyn Rebooter>,
    pub clock: Arc<dyn Clock>,
    pub reset_cause: Box<dyn ResetCauseSource + Send>,
}

/// What the boot sequence decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootReport {
    pub reset_cause: ResetCause,
    pub persistence_ok: bool,
    pub safe_mode: bool,
    pub consecutive_watchdog_resets: u32,
    pub total_watchdog_resets: u32,
    pub safe_mode_deadline: DeadlineChange,
    pub boot_timeout_ms: u32,
    pub steady_timeout_ms: u32,
    pub retune_delay_ms: u32,
    pub watchdog_ok: bool,
    pub session_counter: Option<u32>,
}

/// A booted core.  Drive [`Booted::coordinator`] on a tokio runtime.
pub struct Booted {
    pub report: BootReport,
    pub store: Arc<PersistentFaultStore>,
    pub watchdog: Arc<WatchdogTimer>,
    pub recovery: RecoveryHandle,
    pub coordinator: RecoveryCoordinator,
    pub supervisor: Option<Arc<Supervisor>>,
    pub supervisor_handle: Option<SupervisorHandle>,
}

impl Booted {
    /// Stop the supervisor thread, if one is running.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.supervisor_handle.take() {
            handle.stop();
        }
    }
}

#[instrument(name = "boot", skip_all)]
pub fn boot(config: &BootConfig, platform: Platform) -> Booted {
    let Platform {
        backend,
        cipher,
        peripheral,
        retuner,
        rebooter,
        clock,
        mut reset_cause,
    } = platform;

    info!(evt = "APP_START", "booting");

    let store = Arc::new(PersistentFaultStore::new(
        backend,
        cipher,
        config.store_config(),
    ));
    let persistence_ok = match store.init() {
        Ok(()) => true,
        Err(e) => {
            error!(evt = "PERSIST_INIT_FAIL", error = %e, "continuing without persistence");
            false
        }
    };

    let cause = reset_cause.take_reset_cause();
    info!(evt = "RESET_CAUSE", cause = ?cause, "reset cause read");
    if let Err(e) = store.record_boot(cause.is_watchdog()) {
        error!(evt = "BOOT_RECORD_FAIL", error = %e, "boot not recorded");
    }

    let consecutive = store.consecutive_watchdog_resets();
    let total = store.total_watchdog_resets();
    if consecutive != 0 {
        warn!(evt = "RESET_HISTORY", consecutive, total, "watchdog reset history");
    }

    let safe_mode = store.is_fallback_active();
    if safe_mode {
        error!(
            evt = "SAFE_MODE_ENTERED",
            consecutive,
            threshold = config.reset_threshold,
            "entering safe mode"
        );
        if let Err(e) = store.clear_watchdog_counter() {
            error!(evt = "COUNTER_CLEAR_FAIL", error = %e, "counter not cleared");
        }
    }

    let (coordinator, recovery) = RecoveryCoordinator::new(rebooter, config.recovery_config());
    let safe_mode_deadline = recovery.schedule_safe_mode_reboot(if safe_mode {
        config.safe_mode_reboot_delay_ms
    } else {
        0
    });

    let (steady_timeout_ms, retune_delay_ms) =
        config.watchdog_plan(store.watchdog_override_ms(), safe_mode);

    let watchdog = Arc::new(WatchdogTimer::new(peripheral, retuner));
    let mut report = BootReport {
        reset_cause: cause,
        persistence_ok,
        safe_mode,
        consecutive_watchdog_resets: consecutive,
        total_watchdog_resets: total,
        safe_mode_deadline,
        boot_timeout_ms: config.boot_timeout_ms,
        steady_timeout_ms,
        retune_delay_ms,
        watchdog_ok: false,
        session_counter: None,
    };

    if let Err(e) = watchdog.init(config.boot_timeout_ms) {
        error!(evt = "WATCHDOG_INIT_FAIL", error = %e, "watchdog unavailable");
        recovery.request(RecoveryReason::WatchdogInitFailure);
        return Booted {
            report,
            store,
            watchdog,
            recovery,
            coordinator,
            supervisor: None,
            supervisor_handle: None,
        };
    }
    report.watchdog_ok = true;

    info!(
        evt = "WATCHDOG_CONFIGURED",
        boot_ms = config.boot_timeout_ms,
        steady_ms = steady_timeout_ms,
        retune_delay_ms,
        "watchdog configured"
    );
    if safe_mode {
        warn!(evt = "RETUNE_DISABLED_SAFE_MODE", "steady window clamped to boot timeout");
    }

    let supervisor = Arc::new(Supervisor::new(
        config.supervisor_config(),
        SupervisorDeps {
            watchdog: Arc::clone(&watchdog),
            store: Arc::clone(&store),
            recovery: recovery.clone(),
            clock,
        },
        WatchdogTarget {
            steady_timeout_ms,
            retune_delay_ms,
            monitor_led: config.monitor_led,
        },
    ));
    let supervisor_handle = match supervisor.spawn() {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!(evt = "SUPERVISOR_SPAWN_FAIL", error = %e, "supervisor not started");
            recovery.request(RecoveryReason::HealthFault);
            None
        }
    };

    report.session_counter = match store.next_session_counter() {
        Ok(n) => Some(n),
        Err(e) => {
            warn!(evt = "SESSION_COUNTER_FAIL", error = %e, "no session counter this boot");
            None
        }
    };

    info!(evt = "APP_READY", safe_mode, "boot complete");
    Booted {
        report,
        store,
        watchdog,
        recovery,
        coordinator,
        supervisor: Some(supervisor),
        supervisor_handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_fills_defaults() {
        let cfg: BootConfig =
            serde_json::from_str(r#"{ "steady_timeout_ms": 5000, "monitor_led": false }"#)
                .unwrap();
        assert_eq!(cfg.steady_timeout_ms, 5000);
        assert!(!cfg.monitor_led);
        assert_eq!(cfg.boot_timeout_ms, 8000);
        assert_eq!(cfg.reset_threshold, 3);
    }

    #[test]
    fn override_replaces_default_steady_target() {
        let cfg = BootConfig::default();
        assert_eq!(cfg.watchdog_plan(0, false), (3000, 10_000));
        assert_eq!(cfg.watchdog_plan(4500, false), (4500, 10_000));
    }

    #[test]
    fn safe_mode_clamps_and_retunes_immediately() {
        let cfg = BootConfig::default();
        assert_eq!(cfg.watchdog_plan(0, true), (8000, 0));
        assert_eq!(cfg.watchdog_plan(20_000, true), (20_000, 0));
    }

    #[test]
    fn derived_configs_follow_fields() {
        let cfg = BootConfig {
            period_ms: 250,
            settle_delay_ms: 50,
            reset_threshold: 5,
            ..BootConfig::default()
        };
        assert_eq!(cfg.supervisor_config().period, Duration::from_millis(250));
        assert_eq!(cfg.recovery_config().settle_delay, Duration::from_millis(50));
        assert_eq!(cfg.store_config().fallback_threshold, 5);
    }
}
