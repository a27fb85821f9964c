//! Host device simulator.
//!
//! Boots the recovery core against a directory standing in for flash and a
//! simulated watchdog, then keeps rebooting in process: a recovery reboot
//! comes back as [`ResetCause::Software`], an unfed watchdog as
//! [`ResetCause::Watchdog`].  The record directory survives every reboot, so
//! repeated hangs walk the device into safe mode exactly as on hardware.
//!
//! Console lines go to the operator command surface, plus a few simulator
//! controls:
//!
//! | Line | Effect |
//! |---|---|
//! | `hang` / `led stall` | stop posting the heartbeat / LED toggles |
//! | `resume` | post both again |
//! | `feed off` / `feed on` | close or open the watchdog feed gate |
//! | `help` | list commands |
//! | `quit` | power off |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use colored::Colorize;
use lifeline_hal::sim::{RecordingRebooter, SimWatchdog};
use lifeline_hal::{FileStore, MonotonicClock, RecordCipher};
use lifeline_kernel::{RecoveryTrigger, Supervisor};
use lifeline_runtime::{BootReport, Booted, CommandSurface, Platform, boot};
use lifeline_types::{RebootMode, ResetCause};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How one simulated power cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Rebooted {
        trigger: RecoveryTrigger,
        mode: RebootMode,
    },
    WatchdogExpired,
    Shutdown,
}

impl SessionEnd {
    fn next_cause(self) -> Option<ResetCause> {
        match self {
            SessionEnd::Rebooted { .. } => Some(ResetCause::Software),
            SessionEnd::WatchdogExpired => Some(ResetCause::Watchdog),
            SessionEnd::Shutdown => None,
        }
    }
}

/// Console input.  Once stdin closes the console stays silent instead of
/// ending the session.
pub struct Console {
    rx: mpsc::UnboundedReceiver<String>,
    open: bool,
}

impl Console {
    pub fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx, open: true }
    }

    /// Forward stdin lines from a dedicated reader thread.
    pub fn stdin() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("console".into())
            .spawn(move || {
                for line in std::io::stdin().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self::new(rx))
    }

    async fn next_line(&mut self) -> String {
        if self.open {
            match self.rx.recv().await {
                Some(line) => return line,
                None => self.open = false,
            }
        }
        std::future::pending().await
    }
}

/// Liveness sources the operator can stall.
#[derive(Default)]
struct Liveness {
    heartbeat_stalled: AtomicBool,
    led_stalled: AtomicBool,
}

pub struct Simulator {
    config: Config,
    cipher: Arc<dyn RecordCipher>,
    shutdown: Arc<AtomicBool>,
}

impl Simulator {
    pub fn new(config: Config, shutdown: Arc<AtomicBool>) -> Result<Self, String> {
        let cipher = config.cipher()?;
        Ok(Self {
            config,
            cipher,
            shutdown,
        })
    }

    /// Power on and keep rebooting until shutdown.  Returns the number of
    /// boots.
    pub async fn run(&self, console: &mut Console) -> u32 {
        let mut cause = ResetCause::PowerOn;
        let mut boots = 0;
        loop {
            boots += 1;
            let end = self.session(cause, console).await;
            match end {
                SessionEnd::Rebooted { trigger, mode } => {
                    info!(evt = "SIM_REBOOT", ?trigger, ?mode, "device rebooting");
                    println!("{} {:?} ({:?})", "↻ reboot:".yellow().bold(), trigger, mode);
                }
                SessionEnd::WatchdogExpired => {
                    warn!(evt = "SIM_WATCHDOG_RESET", "watchdog expired; hardware reset");
                    println!("{}", "⚡ watchdog reset".red().bold());
                }
                SessionEnd::Shutdown => {}
            }
            match end.next_cause() {
                Some(next) => cause = next,
                None => return boots,
            }
        }
    }

    /// One power cycle: boot, run until something resets the device, tear
    /// down.
    pub async fn session(&self, cause: ResetCause, console: &mut Console) -> SessionEnd {
        let wdt = SimWatchdog::new();
        let rebooter = RecordingRebooter::new();
        let platform = Platform {
            backend: Box::new(FileStore::new(&self.config.data_dir)),
            cipher: Arc::clone(&self.cipher),
            retuner: self.config.hardware.retuner(&wdt),
            peripheral: Box::new(wdt.clone()),
            rebooter: Arc::new(rebooter.clone()),
            clock: Arc::new(MonotonicClock::new()),
            reset_cause: Box::new(cause),
        };
        let Booted {
            report,
            coordinator,
            supervisor,
            supervisor_handle,
            ..
        } = boot(&self.config.boot, platform);
        print_report(&report);

        let liveness = Arc::new(Liveness::default());
        let mut workers = JoinSet::new();
        let surface = supervisor.as_ref().map(|sup| {
            workers.spawn(post_heartbeats(
                Arc::clone(sup),
                Arc::clone(&liveness),
                interval(self.config.heartbeat_interval_ms),
            ));
            workers.spawn(toggle_led(
                Arc::clone(sup),
                Arc::clone(&liveness),
                interval(self.config.led_interval_ms),
            ));
            CommandSurface::new(
                Arc::clone(sup),
                report.boot_timeout_ms,
                self.config.boot.steady_timeout_ms,
                report.safe_mode,
            )
        });

        let recovery = coordinator.run();
        tokio::pin!(recovery);
        let mut poll = tokio::time::interval(POLL_INTERVAL);

        let end = loop {
            tokio::select! {
                trigger = &mut recovery => {
                    let mode = rebooter.reboots().last().copied().unwrap_or(RebootMode::Warm);
                    break SessionEnd::Rebooted { trigger, mode };
                }
                _ = poll.tick() => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break SessionEnd::Shutdown;
                    }
                    if wdt.expired() {
                        break SessionEnd::WatchdogExpired;
                    }
                }
                line = console.next_line() => {
                    if let Some(end) = self.handle_line(&line, surface.as_ref(), &liveness) {
                        break end;
                    }
                }
            }
        };

        workers.shutdown().await;
        if let Some(handle) = supervisor_handle {
            if let Err(e) = tokio::task::spawn_blocking(move || handle.stop()).await {
                error!(evt = "SIM_SUPERVISOR_STOP_FAIL", error = %e, "supervisor stop panicked");
            }
        }
        end
    }

    fn handle_line(
        &self,
        line: &str,
        surface: Option<&CommandSurface>,
        liveness: &Liveness,
    ) -> Option<SessionEnd> {
        match line.trim() {
            "quit" | "exit" => {
                self.shutdown.store(true, Ordering::SeqCst);
                return Some(SessionEnd::Shutdown);
            }
            "help" => print_help(),
            "hang" => {
                liveness.heartbeat_stalled.store(true, Ordering::Relaxed);
                println!("{}", "heartbeat stalled".yellow());
            }
            "led stall" => {
                liveness.led_stalled.store(true, Ordering::Relaxed);
                println!("{}", "LED stalled".yellow());
            }
            "resume" => {
                liveness.heartbeat_stalled.store(false, Ordering::Relaxed);
                liveness.led_stalled.store(false, Ordering::Relaxed);
                println!("{}", "liveness resumed".green());
            }
            other => match surface {
                None => println!("{}", "supervisor not running; device awaiting reboot".red()),
                Some(cmds) => match other {
                    "feed off" | "feed on" => {
                        let enabled = other == "feed on";
                        cmds.supervisor().watchdog().set_enabled(enabled);
                        println!("watchdog feed {}", if enabled { "enabled" } else { "disabled" });
                    }
                    _ => match cmds.handle_line(other) {
                        Ok(Some(outcome)) => println!("{} {}", "✓".green().bold(), outcome),
                        Ok(None) => {}
                        Err(e) => println!("{} {}", "✗".red().bold(), e),
                    },
                },
            },
        }
        None
    }
}

fn interval(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

async fn post_heartbeats(sup: Arc<Supervisor>, liveness: Arc<Liveness>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    loop {
        tick.tick().await;
        if !liveness.heartbeat_stalled.load(Ordering::Relaxed) {
            sup.notify_system_alive();
        }
    }
}

async fn toggle_led(sup: Arc<Supervisor>, liveness: Arc<Liveness>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    loop {
        tick.tick().await;
        if !liveness.led_stalled.load(Ordering::Relaxed) {
            sup.notify_led_alive();
        }
    }
}

fn print_report(r: &BootReport) {
    println!();
    println!(
        "  {} cause={:?} resets={} total={}",
        "boot".bold().cyan(),
        r.reset_cause,
        r.consecutive_watchdog_resets,
        r.total_watchdog_resets
    );
    println!(
        "  watchdog boot={}ms steady={}ms retune_delay={}ms",
        r.boot_timeout_ms, r.steady_timeout_ms, r.retune_delay_ms
    );
    if !r.persistence_ok {
        println!("  {}", "persistence unavailable".red());
    }
    if !r.watchdog_ok {
        println!("  {}", "watchdog init failed".red().bold());
    }
    if r.safe_mode {
        println!("  {} reboot armed: {:?}", "SAFE MODE".red().bold(), r.safe_mode_deadline);
    }
    if let Some(n) = r.session_counter {
        println!("  session={}", n);
    }
    println!();
}

fn print_help() {
    println!();
    println!("{}", "Commands".bold().underline());
    println!("  {}          watchdog status", "wdg ?".cyan());
    println!("  {}       persist an override and retune", "wdg <ms>".cyan());
    println!("  {}      drop the override", "wdg clear".cyan());
    println!("  {}        request a recovery reboot", "recover".cyan());
    println!("  {}  close/open the feed gate", "feed off|on".cyan());
    println!("  {}  stall heartbeat / LED", "hang|led stall".cyan());
    println!("  {}         post liveness again", "resume".cyan());
    println!("  {}           power off", "quit".cyan());
    println!();
}
