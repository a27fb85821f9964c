//! `lifeline-runtime` – Boot Sequence & Operator Surface
//!
//! Glue between the platform and the recovery core.
//!
//! # Modules
//!
//! - [`boot`] – [`boot()`][boot::boot]: loads crash history, derives safe
//!   mode, arms the safe-mode deadline, installs the watchdog and starts the
//!   supervisor.  Tunables live in [`BootConfig`][boot::BootConfig].
//! - [`commands`] – [`CommandSurface`][commands::CommandSurface]: the
//!   `wdg ?` / `wdg clear` / `wdg <ms>` / `recover` operator commands.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP span export.

pub mod boot;
pub mod commands;
pub mod telemetry;

pub use boot::{BootConfig, BootReport, Booted, Platform, boot};
pub use commands::{Command, CommandOutcome, CommandSurface, WatchdogStatus};
pub use telemetry::{LogFormat, TelemetryGuard, init_tracing};
