//! Operator command surface.
//!
//! Line-oriented commands, each mapping onto one core operation:
//!
//! | Line | Effect |
//! |---|---|
//! | `wdg ?` | report watchdog status |
//! | `wdg clear` | drop the persisted override, retarget the default |
//! | `wdg <ms>` | persist an override (100..=60000, within the hardware window) and retarget now |
//! | `recover` | request a manual recovery reboot |
//!
//! Anything else is rejected without touching state.
//!
//! ```rust
//! use lifeline_runtime::commands::Command;
//!
//! assert_eq!("wdg 5000".parse::<Command>().unwrap(), Command::SetTimeout(5000));
//! assert_eq!("  wdg   ? ".parse::<Command>().unwrap(), Command::Status);
//! assert!("wdg 5000ms".parse::<Command>().is_err());
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use lifeline_kernel::{MAX_TIMEOUT_MS, MIN_TIMEOUT_MS, Supervisor};
use lifeline_types::LifelineError;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    ClearOverride,
    SetTimeout(u32),
    Recover,
}

impl FromStr for Command {
    type Err = LifelineError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let cmd = match (words.next(), words.next()) {
            (Some("recover"), None) => Command::Recover,
            (Some("wdg"), Some("?")) => Command::Status,
            (Some("wdg"), Some("clear")) => Command::ClearOverride,
            (Some("wdg"), Some(arg)) => arg
                .parse::<u32>()
                .map(Command::SetTimeout)
                .map_err(|_| LifelineError::Command(format!("invalid timeout `{arg}`")))?,
            (Some("wdg"), None) => {
                return Err(LifelineError::Command("usage: wdg ? | clear | <ms>".into()));
            }
            _ => return Err(LifelineError::Command(format!("unknown command `{}`", line.trim()))),
        };
        if let Some(extra) = words.next() {
            return Err(LifelineError::Command(format!("unexpected argument `{extra}`")));
        }
        Ok(cmd)
    }
}

/// Snapshot printed by `wdg ?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogStatus {
    pub boot_ms: u32,
    pub current_ms: u32,
    pub target_ms: u32,
    pub override_ms: u32,
    pub fallback: bool,
    pub consecutive_resets: u32,
}

impl fmt::Display for WatchdogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "boot_ms={} current_ms={} target_ms={} override_ms={} fallback={}",
            self.boot_ms,
            self.current_ms,
            self.target_ms,
            self.override_ms,
            if self.fallback { "yes" } else { "no" }
        )?;
        if self.consecutive_resets != 0 {
            write!(f, " resets={}", self.consecutive_resets)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Status(WatchdogStatus),
    OverrideSet { timeout_ms: u32 },
    OverrideCleared { steady_ms: u32 },
    RecoveryRequested,
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Status(s) => write!(f, "{s}"),
            CommandOutcome::OverrideSet { timeout_ms } => {
                write!(f, "override set: {timeout_ms} ms")
            }
            CommandOutcome::OverrideCleared { steady_ms } => {
                write!(f, "override cleared: steady {steady_ms} ms")
            }
            CommandOutcome::RecoveryRequested => write!(f, "recovery requested"),
        }
    }
}

/// Executes parsed commands against a running supervisor.
pub struct CommandSurface {
    supervisor: Arc<Supervisor>,
    boot_timeout_ms: u32,
    default_steady_ms: u32,
    safe_mode: bool,
}

impl CommandSurface {
    pub fn new(
        supervisor: Arc<Supervisor>,
        boot_timeout_ms: u32,
        default_steady_ms: u32,
        safe_mode: bool,
    ) -> Self {
        info!(evt = "CMD_READY", fallback = safe_mode, "command surface ready");
        Self {
            supervisor,
            boot_timeout_ms,
            default_steady_ms,
            safe_mode,
        }
    }

    /// Parse and run one line.  Blank lines are ignored.
    pub fn handle_line(&self, line: &str) -> Result<Option<CommandOutcome>, LifelineError> {
        if line.trim().is_empty() {
            return Ok(None);
        }
        let cmd = line.parse::<Command>().inspect_err(|e| {
            warn!(evt = "CMD_REJECTED", line = line.trim(), error = %e, "command rejected")
        })?;
        self.execute(cmd).map(Some)
    }

    pub fn execute(&self, cmd: Command) -> Result<CommandOutcome, LifelineError> {
        match cmd {
            Command::Status => Ok(CommandOutcome::Status(self.status())),
            Command::SetTimeout(timeout_ms) => self.apply_timeout(timeout_ms),
            Command::ClearOverride => self.clear_override(),
            Command::Recover => {
                self.supervisor.request_manual_recovery();
                Ok(CommandOutcome::RecoveryRequested)
            }
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn status(&self) -> WatchdogStatus {
        let store = self.supervisor.store();
        let status = WatchdogStatus {
            boot_ms: self.boot_timeout_ms,
            current_ms: self.supervisor.watchdog().timeout_ms(),
            target_ms: self.supervisor.watchdog_target(),
            override_ms: store.watchdog_override_ms(),
            fallback: self.safe_mode,
            consecutive_resets: store.consecutive_watchdog_resets(),
        };
        info!(
            evt = "WATCHDOG_STATUS",
            boot_ms = status.boot_ms,
            current_ms = status.current_ms,
            target_ms = status.target_ms,
            override_ms = status.override_ms,
            fallback = status.fallback,
            resets = status.consecutive_resets,
            "watchdog status"
        );
        status
    }

    fn apply_timeout(&self, timeout_ms: u32) -> Result<CommandOutcome, LifelineError> {
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&timeout_ms) {
            warn!(evt = "CMD_OUT_OF_RANGE", timeout_ms, "timeout out of range");
            return Err(LifelineError::TimeoutOutOfRange {
                requested: timeout_ms,
                min: MIN_TIMEOUT_MS,
                max: MAX_TIMEOUT_MS,
            });
        }
        if let Err(e) = self.supervisor.watchdog().check_timeout(timeout_ms) {
            warn!(evt = "CMD_UNREACHABLE_TIMEOUT", timeout_ms, error = %e, "watchdog cannot hold timeout");
            return Err(e.into());
        }
        self.supervisor.store().set_watchdog_override_ms(timeout_ms)?;
        self.supervisor.request_watchdog_target(timeout_ms, true)?;
        Ok(CommandOutcome::OverrideSet { timeout_ms })
    }

    fn clear_override(&self) -> Result<CommandOutcome, LifelineError> {
        self.supervisor.store().set_watchdog_override_ms(0)?;
        self.supervisor
            .request_watchdog_target(self.default_steady_ms, true)?;
        info!(
            evt = "OVERRIDE_CLEARED",
            steady_ms = self.default_steady_ms,
            "watchdog override cleared"
        );
        Ok(CommandOutcome::OverrideCleared {
            steady_ms: self.default_steady_ms,
        })
    }
}
