//! Boot sequence and operator commands against the simulation doubles.

use std::sync::Arc;
use std::time::Duration;

use lifeline_hal::sim::{RecordingRebooter, SimFlash, SimWatchdog};
use lifeline_hal::{DisabledCipher, FixedWindow, IwdgRetune, ManualClock};
use lifeline_kernel::{
    DeadlineChange, FaultStoreConfig, PersistentFaultStore, RecoveryTrigger,
};
use lifeline_runtime::{BootConfig, Booted, CommandOutcome, CommandSurface, Platform, boot};
use lifeline_types::{LifelineError, RebootMode, RecoveryReasons, ResetCause, RetuneError};

fn config() -> BootConfig {
    BootConfig {
        // One tick, then the thread parks for the rest of the test.
        period_ms: 60_000,
        monitor_led: false,
        ..BootConfig::default()
    }
}

struct Device {
    flash: SimFlash,
    rebooter: RecordingRebooter,
}

impl Device {
    fn new() -> Self {
        Self {
            flash: SimFlash::new(),
            rebooter: RecordingRebooter::new(),
        }
    }

    fn platform(&self, wdt: SimWatchdog, cause: ResetCause) -> Platform {
        self.flash.power_cycle();
        Platform {
            backend: Box::new(self.flash.clone()),
            cipher: Arc::new(DisabledCipher),
            retuner: Box::new(IwdgRetune::new(wdt.registers())),
            peripheral: Box::new(wdt),
            rebooter: Arc::new(self.rebooter.clone()),
            clock: Arc::new(ManualClock::new(0)),
            reset_cause: Box::new(cause),
        }
    }

    fn boot(&self, cfg: &BootConfig, cause: ResetCause) -> Booted {
        boot(cfg, self.platform(SimWatchdog::new(), cause))
    }

    fn seed_override(&self, timeout_ms: u32) {
        self.flash.power_cycle();
        let store = PersistentFaultStore::new(
            Box::new(self.flash.clone()),
            Arc::new(DisabledCipher),
            FaultStoreConfig::default(),
        );
        store.set_watchdog_override_ms(timeout_ms).unwrap();
    }
}

fn surface(booted: &Booted, cfg: &BootConfig) -> CommandSurface {
    CommandSurface::new(
        Arc::clone(booted.supervisor.as_ref().unwrap()),
        cfg.boot_timeout_ms,
        cfg.steady_timeout_ms,
        booted.report.safe_mode,
    )
}

#[test]
fn clean_first_boot() {
    let dev = Device::new();
    let cfg = config();
    let mut booted = dev.boot(&cfg, ResetCause::PowerOn);
    let r = &booted.report;

    assert!(r.persistence_ok);
    assert!(r.watchdog_ok);
    assert!(!r.safe_mode);
    assert_eq!(r.safe_mode_deadline, DeadlineChange::NoChange);
    assert_eq!(r.steady_timeout_ms, 3000);
    assert_eq!(r.retune_delay_ms, 10_000);
    assert_eq!(r.session_counter, Some(1));
    assert!(booted.supervisor.is_some());
    assert!(booted.recovery.safe_mode_deadline().is_none());
    assert_eq!(booted.watchdog.timeout_ms(), 8000);
    booted.shutdown();
}

#[test]
fn repeated_watchdog_boots_enter_safe_mode_at_threshold() {
    let dev = Device::new();
    let cfg = config();

    for n in 1..=2 {
        let mut booted = dev.boot(&cfg, ResetCause::Watchdog);
        assert_eq!(booted.report.consecutive_watchdog_resets, n);
        assert!(!booted.report.safe_mode);
        booted.shutdown();
    }

    let mut booted = dev.boot(&cfg, ResetCause::Watchdog);
    let r = booted.report.clone();
    assert!(r.safe_mode);
    assert_eq!(r.consecutive_watchdog_resets, 3);
    assert_eq!(r.total_watchdog_resets, 3);
    assert_eq!(r.safe_mode_deadline, DeadlineChange::Armed);
    assert!(booted.recovery.safe_mode_deadline().is_some());

    // Retune deferral is forced off and the window never shrinks below boot.
    assert_eq!(r.retune_delay_ms, 0);
    assert_eq!(r.steady_timeout_ms, cfg.boot_timeout_ms);
    let sup = booted.supervisor.as_ref().unwrap();
    assert_eq!(sup.watchdog_target(), cfg.boot_timeout_ms);
    assert_eq!(sup.watchdog_config().retune_delay_ms, 0);

    // Entering safe mode clears the run so the next boot starts over.
    assert_eq!(booted.store.consecutive_watchdog_resets(), 0);
    assert_eq!(booted.store.total_watchdog_resets(), 3);
    booted.shutdown();

    let mut next = dev.boot(&cfg, ResetCause::Software);
    assert!(!next.report.safe_mode);
    assert_eq!(next.report.safe_mode_deadline, DeadlineChange::NoChange);
    next.shutdown();
}

#[test]
fn persisted_override_sets_steady_target() {
    let dev = Device::new();
    dev.seed_override(4500);
    let mut booted = dev.boot(&config(), ResetCause::PowerOn);
    assert_eq!(booted.report.steady_timeout_ms, 4500);
    booted.shutdown();
}

#[test]
fn safe_mode_keeps_override_longer_than_boot_timeout() {
    let dev = Device::new();
    dev.seed_override(20_000);
    let cfg = BootConfig {
        reset_threshold: 1,
        ..config()
    };
    let mut booted = dev.boot(&cfg, ResetCause::Watchdog);
    assert!(booted.report.safe_mode);
    assert_eq!(booted.report.steady_timeout_ms, 20_000);
    booted.shutdown();
}

#[test]
fn watchdog_init_failure_requests_recovery_without_supervisor() {
    let dev = Device::new();
    let mut booted = boot(
        &config(),
        dev.platform(SimWatchdog::not_ready(), ResetCause::PowerOn),
    );

    assert!(!booted.report.watchdog_ok);
    assert!(booted.supervisor.is_none());
    assert_eq!(booted.report.session_counter, None);
    let posted = booted.coordinator.drain_requests();
    assert!(posted.contains(RecoveryReasons::WATCHDOG_INIT_FAILURE));
}

#[test]
fn storage_failure_degrades_but_boots() {
    let dev = Device::new();
    dev.flash.fail_next_opens(u32::MAX);
    let mut booted = dev.boot(&config(), ResetCause::Watchdog);

    assert!(!booted.report.persistence_ok);
    assert!(!booted.report.safe_mode);
    assert!(booted.report.watchdog_ok);
    assert!(booted.supervisor.is_some());
    assert_eq!(booted.report.session_counter, None);
    booted.shutdown();
}

#[test]
fn operator_commands_drive_the_core() {
    let dev = Device::new();
    let cfg = config();
    let mut booted = dev.boot(&cfg, ResetCause::PowerOn);
    let cmds = surface(&booted, &cfg);

    assert_eq!(
        cmds.handle_line("wdg 5000"),
        Ok(Some(CommandOutcome::OverrideSet { timeout_ms: 5000 }))
    );
    assert_eq!(booted.store.watchdog_override_ms(), 5000);
    let sup = Arc::clone(booted.supervisor.as_ref().unwrap());
    assert_eq!(sup.watchdog_target(), 5000);

    assert!(matches!(
        cmds.handle_line("wdg 50"),
        Err(LifelineError::TimeoutOutOfRange { requested: 50, .. })
    ));
    assert!(matches!(cmds.handle_line("wdg five"), Err(LifelineError::Command(_))));
    assert_eq!(booted.store.watchdog_override_ms(), 5000);
    assert_eq!(sup.watchdog_target(), 5000);

    match cmds.handle_line("wdg ?") {
        Ok(Some(CommandOutcome::Status(s))) => {
            assert_eq!(s.boot_ms, 8000);
            assert_eq!(s.target_ms, 5000);
            assert_eq!(s.override_ms, 5000);
            assert!(!s.fallback);
        }
        other => panic!("unexpected status outcome: {other:?}"),
    }

    assert_eq!(
        cmds.handle_line("wdg clear"),
        Ok(Some(CommandOutcome::OverrideCleared { steady_ms: 3000 }))
    );
    assert_eq!(booted.store.watchdog_override_ms(), 0);
    assert_eq!(sup.watchdog_target(), 3000);

    assert_eq!(cmds.handle_line("   "), Ok(None));
    assert_eq!(
        cmds.handle_line("recover"),
        Ok(Some(CommandOutcome::RecoveryRequested))
    );
    assert!(booted.coordinator.drain_requests().contains(RecoveryReasons::MANUAL_TRIGGER));
    booted.shutdown();
}

#[test]
fn override_beyond_the_hardware_window_is_refused() {
    let dev = Device::new();
    let cfg = config();
    let mut booted = dev.boot(&cfg, ResetCause::PowerOn);
    let cmds = surface(&booted, &cfg);
    let sup = Arc::clone(booted.supervisor.as_ref().unwrap());

    assert!(matches!(
        cmds.handle_line("wdg 60000"),
        Err(LifelineError::Retune(RetuneError::InvalidTimeout(60000)))
    ));
    assert_eq!(booted.store.watchdog_override_ms(), 0);
    assert_eq!(sup.watchdog_target(), cfg.steady_timeout_ms);

    assert_eq!(
        cmds.handle_line("wdg 30000"),
        Ok(Some(CommandOutcome::OverrideSet { timeout_ms: 30000 }))
    );
    booted.shutdown();
}

#[test]
fn fixed_window_hardware_accepts_any_in_range_override() {
    let dev = Device::new();
    let cfg = config();
    let mut platform = dev.platform(SimWatchdog::new(), ResetCause::PowerOn);
    platform.retuner = Box::new(FixedWindow);
    let mut booted = boot(&cfg, platform);
    let cmds = surface(&booted, &cfg);

    assert_eq!(
        cmds.handle_line("wdg 60000"),
        Ok(Some(CommandOutcome::OverrideSet { timeout_ms: 60000 }))
    );
    assert_eq!(booted.store.watchdog_override_ms(), 60000);
    booted.shutdown();
}

#[tokio::test(start_paused = true)]
async fn safe_mode_deadline_reboots_the_device() {
    let dev = Device::new();
    let cfg = BootConfig {
        reset_threshold: 1,
        safe_mode_reboot_delay_ms: 5000,
        ..config()
    };
    let Booted {
        coordinator,
        supervisor_handle,
        ..
    } = dev.boot(&cfg, ResetCause::Watchdog);

    let trigger = tokio::time::timeout(Duration::from_secs(10), coordinator.run())
        .await
        .unwrap();
    assert_eq!(trigger, RecoveryTrigger::DeadlineExpired);
    assert_eq!(dev.rebooter.reboots(), vec![RebootMode::Warm]);
    drop(supervisor_handle);
}

#[test]
fn fixed_window_hardware_boots_normally() {
    let dev = Device::new();
    let wdt = SimWatchdog::new();
    let mut platform = dev.platform(wdt, ResetCause::PowerOn);
    platform.retuner = Box::new(FixedWindow);
    let mut booted = boot(&config(), platform);
    assert!(booted.report.watchdog_ok);
    booted.shutdown();
}
