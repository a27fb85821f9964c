//! Liveness supervisor.
//!
//! A dedicated thread ticks once per period:
//!
//! 1. snapshot [`WatchdogConfig`];
//! 2. apply a due retune;
//! 3. sample [`HealthStatus`] from the two liveness timestamps;
//! 4. clear the persisted reset counter once steady-state health is proven;
//! 5. feed, or withhold the feed and count toward escalation.
//!
//! Liveness notifications are single atomic stores, safe to call from any
//! thread at any rate.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use lifeline_hal::Clock;
use lifeline_types::{FeedError, LifelineError, RecoveryReason, RetuneError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::fault_store::PersistentFaultStore;
use crate::recovery::RecoveryHandle;
use crate::watchdog::WatchdogTimer;

/// Smallest operator-settable watchdog timeout.
pub const MIN_TIMEOUT_MS: u32 = 100;
/// Largest operator-settable watchdog timeout.
pub const MAX_TIMEOUT_MS: u32 = 60_000;

/// Timestamp of a channel that has never reported.
const NEVER: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub period: Duration,
    /// Liveness checks are suspended for this long after start.
    pub boot_grace: Duration,
    /// Consecutive failed ticks before escalating.
    pub max_failures: u32,
    pub heartbeat_stale_ms: u64,
    pub led_stale_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1000),
            boot_grace: Duration::from_millis(3000),
            max_failures: 3,
            heartbeat_stale_ms: 3000,
            led_stale_ms: 3000,
        }
    }
}

/// Steady-state target handed over by the boot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogTarget {
    pub steady_timeout_ms: u32,
    /// Delay before the first retune attempt; `0` retunes on the first tick.
    pub retune_delay_ms: u32,
    pub monitor_led: bool,
}

/// Retune bookkeeping.  Owned by the supervisor, copied out before use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub desired_timeout_ms: u32,
    pub retune_delay_ms: u32,
    pub retune_ready_at_ms: u64,
    pub monitor_led: bool,
    pub retune_pending: bool,
    pub retune_done_once: bool,
    pub retune_failed_logged: bool,
}

/// Per-tick liveness view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthStatus {
    pub led_ok: bool,
    pub hb_ok: bool,
    pub led_age_ms: u64,
    pub hb_age_ms: u64,
}

impl HealthStatus {
    /// Derive health from the last-seen timestamps.  A channel that never
    /// reported has maximal age; an unmonitored LED is always ok.
    pub fn sample(
        now_ms: u64,
        hb_last_ms: u64,
        led_last_ms: u64,
        monitor_led: bool,
        config: &SupervisorConfig,
    ) -> Self {
        let age = |last: u64| {
            if last == NEVER {
                u64::MAX
            } else {
                now_ms.saturating_sub(last)
            }
        };
        let hb_age_ms = age(hb_last_ms);
        let led_age_ms = age(led_last_ms);
        Self {
            hb_ok: hb_age_ms <= config.heartbeat_stale_ms,
            led_ok: !monitor_led || led_age_ms <= config.led_stale_ms,
            hb_age_ms,
            led_age_ms,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.led_ok && self.hb_ok
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub health: HealthStatus,
    pub in_grace: bool,
    pub fed: bool,
    pub fail_count: u32,
    pub escalated: bool,
}

/// Shared collaborators.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub watchdog: Arc<WatchdogTimer>,
    pub store: Arc<PersistentFaultStore>,
    pub recovery: RecoveryHandle,
    pub clock: Arc<dyn Clock>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    deps: SupervisorDeps,
    wd_cfg: Mutex<WatchdogConfig>,
    led_last_seen: AtomicU64,
    sys_last_seen: AtomicU64,
    counter_cleared: AtomicBool,
    fail_count: AtomicU32,
    boot_ms: u64,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("watchdog_config", &self.watchdog_config())
            .field("fail_count", &self.fail_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Supervisor {
    /// Prepare the supervisor.  The boot-grace window and the heartbeat
    /// clock start now; the LED clock starts now only when it is not
    /// monitored.
    pub fn new(config: SupervisorConfig, deps: SupervisorDeps, target: WatchdogTarget) -> Self {
        let now = deps.clock.now_ms();
        let sup = Self {
            config,
            wd_cfg: Mutex::new(WatchdogConfig {
                desired_timeout_ms: target.steady_timeout_ms,
                retune_delay_ms: target.retune_delay_ms,
                monitor_led: target.monitor_led,
                ..WatchdogConfig::default()
            }),
            led_last_seen: AtomicU64::new(if target.monitor_led { NEVER } else { now }),
            sys_last_seen: AtomicU64::new(now),
            counter_cleared: AtomicBool::new(false),
            fail_count: AtomicU32::new(0),
            boot_ms: now,
            deps,
        };
        {
            let mut cfg = sup.wd_cfg.lock();
            sup.schedule_retune(&mut cfg, false, now);
        }
        info!(
            evt = "SUPERVISOR_READY",
            steady_timeout_ms = target.steady_timeout_ms,
            retune_delay_ms = target.retune_delay_ms,
            monitor_led = target.monitor_led,
            period_ms = sup.config.period.as_millis() as u64,
            "supervisor configured"
        );
        sup
    }

    /// Start the periodic loop on its own thread.
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<SupervisorHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let sup = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("supervisor".into())
            .spawn(move || sup.run(&flag))?;
        Ok(SupervisorHandle {
            stop,
            join: Some(join),
        })
    }

    fn run(&self, stop: &AtomicBool) {
        info!(evt = "SUPERVISOR_STARTED", "supervisor loop running");
        while !stop.load(Ordering::Acquire) {
            self.tick();
            park_until(Instant::now() + self.config.period, stop);
        }
        info!(evt = "SUPERVISOR_STOPPED", "supervisor loop stopped");
    }

    /// One supervision pass.
    pub fn tick(&self) -> TickReport {
        let now = self.deps.clock.now_ms();
        let cfg = self.watchdog_config();

        self.attempt_retune(&cfg, now);

        let health = self.sample(cfg.monitor_led, now);
        let in_grace = now.saturating_sub(self.boot_ms) < self.config.boot_grace.as_millis() as u64;

        if !self.counter_cleared.load(Ordering::Acquire)
            && cfg.retune_done_once
            && !in_grace
            && health.is_ok()
        {
            self.clear_counter("steady_health");
        }

        let mut fed = false;
        let mut escalated = false;
        let mut fails = self.fail_count.load(Ordering::Relaxed);

        if in_grace {
            if self.deps.watchdog.is_enabled() {
                fed = self.feed("boot_grace", &mut fails);
            }
            fails = 0;
        } else if health.is_ok() {
            if self.deps.watchdog.is_enabled() {
                fed = self.feed("steady", &mut fails);
                if fed {
                    fails = 0;
                } else if fails >= self.config.max_failures {
                    error!(
                        evt = "FEED_FAILURE_ESCALATION",
                        failures = fails,
                        "repeated feed failures; requesting recovery"
                    );
                    self.deps.recovery.request(RecoveryReason::HealthFault);
                    escalated = true;
                    fails = 0;
                }
            } else {
                fails = 0;
            }
        } else {
            fails += 1;
            warn!(
                evt = "HEALTH_DEGRADED",
                led_ok = health.led_ok,
                hb_ok = health.hb_ok,
                led_age_ms = health.led_age_ms,
                hb_age_ms = health.hb_age_ms,
                failures = fails,
                "liveness degraded; withholding feed"
            );
            if fails >= self.config.max_failures {
                error!(
                    evt = "HEALTH_ESCALATION",
                    failures = fails,
                    "sustained degraded health; requesting recovery"
                );
                self.deps.recovery.request(RecoveryReason::HealthFault);
                escalated = true;
                fails = 0;
            }
        }

        self.fail_count.store(fails, Ordering::Relaxed);
        TickReport {
            health,
            in_grace,
            fed,
            fail_count: fails,
            escalated,
        }
    }

    /// Feed once.  Hardware failures count toward escalation; the policy
    /// states (disabled, not installed) do not.
    fn feed(&self, phase: &'static str, fails: &mut u32) -> bool {
        match self.deps.watchdog.feed() {
            Ok(()) => true,
            Err(FeedError::Hardware(e)) => {
                *fails += 1;
                warn!(
                    evt = "FEED_FAIL",
                    phase,
                    failures = *fails,
                    error = %e,
                    "watchdog feed failed"
                );
                false
            }
            Err(e) => {
                debug!(evt = "FEED_SKIPPED", phase, reason = %e, "watchdog not fed");
                false
            }
        }
    }

    fn attempt_retune(&self, cfg: &WatchdogConfig, now: u64) {
        if !cfg.retune_pending || now < cfg.retune_ready_at_ms {
            return;
        }

        match self.deps.watchdog.retune(cfg.desired_timeout_ms) {
            Ok(()) => {
                info!(
                    evt = "RETUNED",
                    timeout_ms = cfg.desired_timeout_ms,
                    "steady-state watchdog timeout applied"
                );
                {
                    let mut live = self.wd_cfg.lock();
                    // A newer target may have arrived while the hardware was busy.
                    if live.desired_timeout_ms == cfg.desired_timeout_ms {
                        live.retune_pending = false;
                        live.retune_done_once = true;
                        live.retune_failed_logged = false;
                    }
                }
                // Clears even when a newer target superseded this retune.
                // The pending check above and this clear must be changed
                // together, or the counter is trusted with the new target
                // still unapplied.
                self.clear_counter("retune");
            }
            Err(e @ (RetuneError::Unsupported | RetuneError::InvalidTimeout(_))) => {
                if !cfg.retune_failed_logged {
                    warn!(
                        evt = "RETUNE_UNAVAILABLE",
                        timeout_ms = cfg.desired_timeout_ms,
                        current_ms = self.deps.watchdog.timeout_ms(),
                        error = %e,
                        "keeping current watchdog timeout"
                    );
                }
                let mut live = self.wd_cfg.lock();
                if live.desired_timeout_ms == cfg.desired_timeout_ms {
                    live.retune_pending = false;
                    live.retune_done_once = true;
                    live.retune_failed_logged = true;
                }
            }
            Err(e) => {
                let retry_at = now + self.config.period.as_millis() as u64;
                warn!(
                    evt = "RETUNE_DEFERRED",
                    timeout_ms = cfg.desired_timeout_ms,
                    retry_at_ms = retry_at,
                    error = %e,
                    "retune failed; will retry"
                );
                self.wd_cfg.lock().retune_ready_at_ms = retry_at;
            }
        }
    }

    fn clear_counter(&self, path: &'static str) {
        match self.deps.store.clear_watchdog_counter() {
            Ok(true) => info!(evt = "RESET_COUNTER_CLEARED", path, "watchdog reset counter cleared"),
            Ok(false) => debug!(evt = "RESET_COUNTER_ALREADY_CLEAR", path, "counter already zero"),
            Err(e) => warn!(
                evt = "RESET_COUNTER_CLEAR_FAIL",
                path,
                error = %e,
                "could not clear watchdog reset counter"
            ),
        }
        self.counter_cleared.store(true, Ordering::Release);
    }

    fn schedule_retune(&self, cfg: &mut WatchdogConfig, apply_immediately: bool, now: u64) {
        let delay = if apply_immediately {
            0
        } else {
            u64::from(cfg.retune_delay_ms)
        };
        cfg.retune_ready_at_ms = now + delay;
        cfg.retune_pending = cfg.desired_timeout_ms != self.deps.watchdog.timeout_ms();
        if !cfg.retune_pending {
            cfg.retune_done_once = true;
        }
        cfg.retune_failed_logged = false;
    }

    fn sample(&self, monitor_led: bool, now: u64) -> HealthStatus {
        HealthStatus::sample(
            now,
            self.sys_last_seen.load(Ordering::Acquire),
            self.led_last_seen.load(Ordering::Acquire),
            monitor_led,
            &self.config,
        )
    }

    // ── public surface ─────────────────────────────────────────────────────

    pub fn notify_led_alive(&self) {
        self.led_last_seen
            .store(self.deps.clock.now_ms(), Ordering::Release);
    }

    pub fn notify_system_alive(&self) {
        self.sys_last_seen
            .store(self.deps.clock.now_ms(), Ordering::Release);
    }

    /// Current liveness as the next tick would see it.
    pub fn health(&self) -> HealthStatus {
        let monitor_led = self.wd_cfg.lock().monitor_led;
        self.sample(monitor_led, self.deps.clock.now_ms())
    }

    /// Set a new steady-state target.  The counter is trusted again only
    /// after the new target has been applied (or found unsupported) and
    /// health has been seen ok.
    pub fn request_watchdog_target(
        &self,
        timeout_ms: u32,
        apply_immediately: bool,
    ) -> Result<(), LifelineError> {
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&timeout_ms) {
            return Err(LifelineError::TimeoutOutOfRange {
                requested: timeout_ms,
                min: MIN_TIMEOUT_MS,
                max: MAX_TIMEOUT_MS,
            });
        }

        let now = self.deps.clock.now_ms();
        let mut cfg = self.wd_cfg.lock();
        cfg.desired_timeout_ms = timeout_ms;
        cfg.retune_done_once = false;
        self.counter_cleared.store(false, Ordering::Release);
        self.schedule_retune(&mut cfg, apply_immediately, now);
        info!(
            evt = "WATCHDOG_TARGET",
            timeout_ms,
            apply_immediately,
            pending = cfg.retune_pending,
            "watchdog target requested"
        );
        Ok(())
    }

    /// Desired steady-state timeout.
    pub fn watchdog_target(&self) -> u32 {
        self.wd_cfg.lock().desired_timeout_ms
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        *self.wd_cfg.lock()
    }

    pub fn request_manual_recovery(&self) {
        self.deps.recovery.request(RecoveryReason::ManualTrigger);
    }

    pub fn watchdog(&self) -> &Arc<WatchdogTimer> {
        &self.deps.watchdog
    }

    pub fn store(&self) -> &Arc<PersistentFaultStore> {
        &self.deps.store
    }
}

/// Park the current thread until `deadline`.  Spurious and stray unparks
/// park again; only `stop` ends the wait early.
fn park_until(deadline: Instant, stop: &AtomicBool) {
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::park_timeout(deadline - now);
    }
}

/// Owner of a running supervisor thread.
#[derive(Debug)]
pub struct SupervisorHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    /// Stop the loop and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            join.thread().unpark();
            if join.join().is_err() {
                error!(evt = "SUPERVISOR_PANICKED", "supervisor thread panicked");
            }
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
