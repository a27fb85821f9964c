//! `lifeline` – host simulator for the watchdog recovery core.
//!
//! Boots the core against `~/.lifeline/flash` and a simulated watchdog, then
//! reads operator commands from stdin.  Ctrl-C powers the device off.

mod config;
mod device;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use device::{Console, Simulator};

fn main() {
    let _telemetry = lifeline_runtime::init_tracing("lifeline");

    print_banner();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        }) {
            warn!("Could not install Ctrl-C handler: {}", e);
        }
    }

    let cfg = match config::load() {
        Ok(Some(cfg)) => cfg,
        Ok(None) => first_run_config(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Falling back to defaults.\n");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    info!(
        evt = "SIM_CONFIG",
        data_dir = %cfg.data_dir.display(),
        hardware = %cfg.hardware,
        encrypted = !cfg.record_key_hex.is_empty(),
        "simulator configured"
    );

    let sim = match Simulator::new(cfg, Arc::clone(&shutdown)) {
        Ok(sim) => sim,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    };
    let mut console = match Console::stdin() {
        Ok(console) => console,
        Err(e) => {
            eprintln!("{}: {}", "Could not start console".red().bold(), e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Could not start runtime".red().bold(), e);
            std::process::exit(1);
        }
    };

    println!("  Type {} for a list of commands.\n", "help".bold().cyan());
    let boots = runtime.block_on(sim.run(&mut console));
    println!("{} after {} boot(s).", "Powered off".green(), boots);
}

/// No config on disk: persist the defaults so the operator has a file to
/// edit, then apply environment overrides on top.
fn first_run_config() -> config::Config {
    let mut cfg = config::Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Default config written to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    config::apply_env_overrides(&mut cfg);
    cfg
}

fn print_banner() {
    println!();
    println!("  {} {}",
        "lifeline".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Watchdog recovery simulator");
    println!();
}
