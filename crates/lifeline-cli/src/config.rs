//! Configuration vault – reads/writes `~/.lifeline/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lifeline_hal::{DisabledCipher, FixedWindow, IwdgRetune, KeystreamCipher, RecordCipher, Retune};
use lifeline_hal::sim::SimWatchdog;
use lifeline_runtime::BootConfig;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Watchdog hardware family the simulator emulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WatchdogFamily {
    /// Live-retunable independent watchdog (prescaler/reload registers).
    #[default]
    Iwdg,
    /// Window fixed at install; retune reports unsupported.
    Fixed,
}

impl WatchdogFamily {
    pub fn retuner(self, wdt: &SimWatchdog) -> Box<dyn Retune> {
        match self {
            WatchdogFamily::Iwdg => Box::new(IwdgRetune::new(wdt.registers())),
            WatchdogFamily::Fixed => Box::new(FixedWindow),
        }
    }
}

impl std::str::FromStr for WatchdogFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "iwdg" => Ok(WatchdogFamily::Iwdg),
            "fixed" => Ok(WatchdogFamily::Fixed),
            other => Err(format!("unknown watchdog family `{other}`")),
        }
    }
}

impl std::fmt::Display for WatchdogFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchdogFamily::Iwdg => write!(f, "iwdg"),
            WatchdogFamily::Fixed => write!(f, "fixed"),
        }
    }
}

/// Persisted simulator configuration stored in `~/.lifeline/config.toml`.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Config {
    /// Directory standing in for the device's flash partition.
    #[serde(default = "default_data_dir")]
    #[zeroize(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    #[zeroize(skip)]
    pub hardware: WatchdogFamily,

    /// How often the simulated application posts its heartbeat.
    #[serde(default = "default_beat_interval_ms")]
    #[zeroize(skip)]
    pub heartbeat_interval_ms: u64,

    /// How often the simulated status LED toggles.
    #[serde(default = "default_beat_interval_ms")]
    #[zeroize(skip)]
    pub led_interval_ms: u64,

    /// Hex record key; empty keeps the record in plaintext.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub record_key_hex: String,

    /// Optional 16-byte hex IV seed mixed into every record IV.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub iv_seed_hex: String,

    #[serde(default)]
    #[zeroize(skip)]
    pub boot: BootConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("hardware", &self.hardware)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("led_interval_ms", &self.led_interval_ms)
            .field(
                "record_key_hex",
                if self.record_key_hex.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field(
                "iv_seed_hex",
                if self.iv_seed_hex.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("boot", &self.boot)
            .finish()
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(home_dir()).join(".lifeline").join("flash")
}
fn default_beat_interval_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            hardware: WatchdogFamily::default(),
            heartbeat_interval_ms: default_beat_interval_ms(),
            led_interval_ms: default_beat_interval_ms(),
            record_key_hex: String::new(),
            iv_seed_hex: String::new(),
            boot: BootConfig::default(),
        }
    }
}

impl Config {
    /// Record cipher for the configured key, or [`DisabledCipher`] when no
    /// key is set.
    pub fn cipher(&self) -> Result<Arc<dyn RecordCipher>, String> {
        if self.record_key_hex.is_empty() {
            return Ok(Arc::new(DisabledCipher));
        }
        let seed = (!self.iv_seed_hex.is_empty()).then_some(self.iv_seed_hex.as_str());
        KeystreamCipher::from_hex(&self.record_key_hex, seed)
            .map(|c| Arc::new(c) as Arc<dyn RecordCipher>)
            .map_err(|e| format!("Invalid record key: {}", e))
    }
}

/// Return the path to `~/.lifeline/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".lifeline").join("config.toml")
}

/// Load the config from disk with `LIFELINE_*` overrides applied.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Apply `LIFELINE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `LIFELINE_DATA_DIR` | `data_dir` |
/// | `LIFELINE_HARDWARE` | `hardware` |
/// | `LIFELINE_RECORD_KEY` | `record_key_hex` |
/// | `LIFELINE_BOOT_TIMEOUT_MS` | `boot.boot_timeout_ms` |
/// | `LIFELINE_STEADY_TIMEOUT_MS` | `boot.steady_timeout_ms` |
/// | `LIFELINE_RESET_THRESHOLD` | `boot.reset_threshold` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("LIFELINE_DATA_DIR") {
        cfg.data_dir = PathBuf::from(v);
    }
    if let Some(family) = env_parse("LIFELINE_HARDWARE") {
        cfg.hardware = family;
    }
    if let Ok(v) = std::env::var("LIFELINE_RECORD_KEY") {
        cfg.record_key_hex.zeroize();
        cfg.record_key_hex = v;
    }
    if let Some(ms) = env_parse("LIFELINE_BOOT_TIMEOUT_MS") {
        cfg.boot.boot_timeout_ms = ms;
    }
    if let Some(ms) = env_parse("LIFELINE_STEADY_TIMEOUT_MS") {
        cfg.boot.steady_timeout_ms = ms;
    }
    if let Some(n) = env_parse("LIFELINE_RESET_THRESHOLD") {
        cfg.boot.reset_threshold = n;
    }
}

/// Save the config to disk, creating `~/.lifeline/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // The record key lives in this file: owner read/write only.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn debug_redacts_record_key() {
        let mut cfg = Config::default();
        cfg.record_key_hex = KEY.to_string();
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains(KEY), "record key must not appear in debug output");
        assert!(debug_str.contains("<redacted>"));
        assert!(debug_str.contains("<not set>"), "empty iv seed shows <not set>");
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("meta")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_keeps_boot_tunables() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.hardware = WatchdogFamily::Fixed;
        cfg.boot.steady_timeout_ms = 4500;
        cfg.boot.monitor_led = false;
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.hardware, WatchdogFamily::Fixed);
        assert_eq!(loaded.boot.steady_timeout_ms, 4500);
        assert!(!loaded.boot.monitor_led);
        assert_eq!(loaded.boot.boot_timeout_ms, 8000);
        assert!(loaded.record_key_hex.is_empty());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "hardware = \"fixed\"\n\n[boot]\nreset_threshold = 5\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.hardware, WatchdogFamily::Fixed);
        assert_eq!(loaded.boot.reset_threshold, 5);
        assert_eq!(loaded.boot.steady_timeout_ms, 3000);
        assert_eq!(loaded.heartbeat_interval_ms, 500);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "boot = 12").unwrap();
        assert!(load_from(&path).unwrap_err().contains("parse"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn config_path_points_to_lifeline_dir() {
        let p = config_path_for_home("/home/testuser");
        assert_eq!(p, PathBuf::from("/home/testuser/.lifeline/config.toml"));
    }

    #[test]
    fn cipher_follows_key() {
        let mut cfg = Config::default();
        assert!(!cfg.cipher().unwrap().is_enabled());

        cfg.record_key_hex = KEY.to_string();
        assert!(cfg.cipher().unwrap().is_enabled());

        cfg.record_key_hex = "abc".to_string();
        assert!(cfg.cipher().is_err());

        cfg.record_key_hex = KEY.to_string();
        cfg.iv_seed_hex = "00".to_string();
        assert!(cfg.cipher().is_err(), "short iv seed");
    }

    #[test]
    fn hardware_family_parses() {
        assert_eq!(" IWDG ".parse::<WatchdogFamily>(), Ok(WatchdogFamily::Iwdg));
        assert_eq!("fixed".parse::<WatchdogFamily>(), Ok(WatchdogFamily::Fixed));
        assert!("wwdg".parse::<WatchdogFamily>().is_err());
    }

    #[test]
    fn apply_env_overrides_changes_steady_timeout() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("LIFELINE_STEADY_TIMEOUT_MS", "4200") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.boot.steady_timeout_ms, 4200);
        unsafe { std::env::remove_var("LIFELINE_STEADY_TIMEOUT_MS") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_threshold() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("LIFELINE_RESET_THRESHOLD", "many") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.boot.reset_threshold, 3);
        unsafe { std::env::remove_var("LIFELINE_RESET_THRESHOLD") };
    }

    #[test]
    fn apply_env_overrides_changes_hardware_and_dir() {
        // SAFETY: no other test reads these variables.
        unsafe {
            std::env::set_var("LIFELINE_HARDWARE", "fixed");
            std::env::set_var("LIFELINE_DATA_DIR", "/tmp/lifeline-flash");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.hardware, WatchdogFamily::Fixed);
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/lifeline-flash"));
        unsafe {
            std::env::remove_var("LIFELINE_HARDWARE");
            std::env::remove_var("LIFELINE_DATA_DIR");
        }
    }
}
