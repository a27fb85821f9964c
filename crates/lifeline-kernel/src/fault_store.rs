//! Persistent fault store.
//!
//! One fixed-size [`FaultRecord`] kept under record id [`RECORD_ID`] on a
//! [`BackingStore`].  Every operation runs under a single mutex that also
//! covers the backing-store handle, so I/O is serialized with cache updates.
//! Calls are low-frequency (boot, operator commands, one clear per boot).
//!
//! Absent or corrupt data is never fatal: it is replaced with a fresh record.
//! Open/mount failures are retried a fixed number of times, then surfaced so
//! the caller can continue with persistence degraded.

use std::sync::Arc;
use std::time::Duration;

use lifeline_hal::{BackingStore, RecordCipher};
use lifeline_types::{
    ENCRYPTED_RECORD_LEN, EncryptedRecord, FaultRecord, RECORD_LEN, StorageError,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::retry::retry;

/// Record id of the fault record inside the partition.
pub const RECORD_ID: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultStoreConfig {
    /// Partition label handed to [`BackingStore::open`].
    pub partition: String,
    /// Attempts for open and for mount, each.
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// Consecutive watchdog resets at which safe mode engages.
    pub fallback_threshold: u32,
}

impl Default for FaultStoreConfig {
    fn default() -> Self {
        Self {
            partition: "storage".into(),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(10),
            fallback_threshold: 3,
        }
    }
}

struct StoreInner {
    backend: Box<dyn BackingStore>,
    cipher: Arc<dyn RecordCipher>,
    record: FaultRecord,
    loaded: bool,
}

/// Durable boot/crash history and watchdog override.
pub struct PersistentFaultStore {
    config: FaultStoreConfig,
    inner: Mutex<StoreInner>,
}

impl std::fmt::Debug for PersistentFaultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PersistentFaultStore")
            .field("config", &self.config)
            .field("record", &inner.record)
            .field("loaded", &inner.loaded)
            .field("encrypted", &inner.cipher.is_enabled())
            .finish()
    }
}

impl PersistentFaultStore {
    /// Build a store. No I/O happens until [`init`][Self::init].
    pub fn new(
        backend: Box<dyn BackingStore>,
        cipher: Arc<dyn RecordCipher>,
        config: FaultStoreConfig,
    ) -> Self {
        Self {
            config,
            inner: Mutex::new(StoreInner {
                backend,
                cipher,
                record: FaultRecord::default(),
                loaded: false,
            }),
        }
    }

    pub fn config(&self) -> &FaultStoreConfig {
        &self.config
    }

    /// Open, mount and load the record. Idempotent once it has succeeded.
    pub fn init(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner)
    }

    /// Account for one boot.  A watchdog reset extends the consecutive run
    /// and the lifetime total; a clean boot ends the run.
    pub fn record_boot(&self, was_watchdog_reset: bool) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner)?;

        if was_watchdog_reset {
            inner.record.consecutive_watchdog_resets =
                inner.record.consecutive_watchdog_resets.saturating_add(1);
            inner.record.total_watchdog_resets =
                inner.record.total_watchdog_resets.saturating_add(1);
        } else {
            inner.record.consecutive_watchdog_resets = 0;
        }
        info!(
            evt = "BOOT_RECORDED",
            watchdog_reset = was_watchdog_reset,
            consecutive = inner.record.consecutive_watchdog_resets,
            total = inner.record.total_watchdog_resets,
            "boot recorded"
        );
        Self::commit(&mut inner)
    }

    /// `true` once the consecutive watchdog run reaches the threshold.
    pub fn is_fallback_active(&self) -> bool {
        self.inner.lock().record.consecutive_watchdog_resets >= self.config.fallback_threshold
    }

    pub fn consecutive_watchdog_resets(&self) -> u32 {
        self.inner.lock().record.consecutive_watchdog_resets
    }

    pub fn total_watchdog_resets(&self) -> u32 {
        self.inner.lock().record.total_watchdog_resets
    }

    /// Persisted steady-state override, `0` when unset.
    pub fn watchdog_override_ms(&self) -> u32 {
        self.inner.lock().record.watchdog_override_ms
    }

    /// Persist a new override.  Writes only when the value changes.
    pub fn set_watchdog_override_ms(&self, timeout_ms: u32) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner)?;

        if inner.record.watchdog_override_ms == timeout_ms {
            return Ok(());
        }
        let previous = inner.record.watchdog_override_ms;
        inner.record.watchdog_override_ms = timeout_ms;
        info!(
            evt = "OVERRIDE_SET",
            previous_ms = previous,
            timeout_ms,
            "watchdog override updated"
        );
        Self::commit(&mut inner)
    }

    /// Zero the consecutive counter.  Returns `Ok(true)` when a write was
    /// made and `Ok(false)` when the counter was already zero.
    pub fn clear_watchdog_counter(&self) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner)?;

        if inner.record.consecutive_watchdog_resets == 0 {
            return Ok(false);
        }
        let previous = inner.record.consecutive_watchdog_resets;
        inner.record.consecutive_watchdog_resets = 0;
        info!(evt = "COUNTER_CLEARED", previous, "consecutive watchdog counter cleared");
        Self::commit(&mut inner).map(|()| true)
    }

    /// Advance and persist the session counter, returning the new value.
    /// The cipher diversifies its IVs with it from this commit on.
    ///
    /// A failed commit is logged and the advanced value is still returned;
    /// the cached counter keeps increasing for the rest of this boot.
    pub fn next_session_counter(&self) -> Result<u32, StorageError> {
        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner)?;

        let next = inner
            .record
            .session_counter
            .checked_add(1)
            .ok_or_else(|| StorageError::Io("session counter exhausted".into()))?;
        inner.record.session_counter = next;
        inner.cipher.set_session(next);
        debug!(evt = "SESSION_COUNTER", value = next, "session counter advanced");
        if let Err(e) = Self::commit(&mut inner) {
            warn!(
                evt = "SESSION_COUNTER_NOT_PERSISTED",
                value = next,
                error = %e,
                "session counter advanced in memory only"
            );
        }
        Ok(next)
    }

    /// Copy of the cached record.
    pub fn snapshot(&self) -> FaultRecord {
        self.inner.lock().record
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.lock().loaded
    }

    /// Wipe the partition and forget the cache.  Test harnesses only.
    pub fn erase_all(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner)?;
        inner.backend.erase_all()?;
        inner.record = FaultRecord::default();
        inner.loaded = false;
        warn!(evt = "ERASED", partition = %self.config.partition, "fault store erased");
        Ok(())
    }

    /// Drop the cache, remount and load again, as after a reboot.
    pub fn reload(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.record = FaultRecord::default();
        inner.loaded = false;
        self.ensure_loaded(&mut inner)
    }

    // ── internals ──────────────────────────────────────────────────────────

    fn ensure_loaded(&self, inner: &mut StoreInner) -> Result<(), StorageError> {
        if inner.loaded {
            return Ok(());
        }

        let cfg = &self.config;
        let backend = &mut inner.backend;
        let partition = retry("flash_open", cfg.retry_attempts, cfg.retry_delay, |_| {
            backend.open(&cfg.partition)
        })
        .inspect_err(|e| {
            error!(evt = "FLASH_OPEN_FAIL", partition = %cfg.partition, error = %e, "storage open failed")
        })?;
        retry("fs_mount", cfg.retry_attempts, cfg.retry_delay, |_| {
            backend.mount(&partition)
        })
        .inspect_err(|e| error!(evt = "MOUNT_FAIL", error = %e, "storage mount failed"))?;

        let (record, needs_write) = match Self::load(inner) {
            Ok(Some(record)) if record.is_valid() => (record, false),
            Ok(Some(_)) => {
                warn!(evt = "RECORD_CORRUPT", "record magic mismatch; reinitialising");
                (FaultRecord::fresh(), true)
            }
            Ok(None) => {
                info!(evt = "RECORD_ABSENT", "no record stored; first boot");
                (FaultRecord::fresh(), true)
            }
            Err(e) => {
                warn!(evt = "RECORD_UNREADABLE", error = %e, "record unreadable; reinitialising");
                (FaultRecord::fresh(), true)
            }
        };
        inner.record = record;
        inner.loaded = true;
        if needs_write {
            // The fresh record stays cached even if this write fails.
            let _ = Self::commit(inner);
        }

        info!(
            evt = "STORE_LOADED",
            partition = %partition.name,
            encrypted = inner.cipher.is_enabled(),
            consecutive = inner.record.consecutive_watchdog_resets,
            total = inner.record.total_watchdog_resets,
            override_ms = inner.record.watchdog_override_ms,
            "fault store ready"
        );
        Ok(())
    }

    /// Read and decode the stored record without touching the cache.
    ///
    /// The encrypted shape is tried first (when the cipher is enabled), then
    /// the legacy plain shape, distinguished by stored length.
    fn load(inner: &mut StoreInner) -> Result<Option<FaultRecord>, StorageError> {
        let Some(bytes) = inner.backend.read(RECORD_ID)? else {
            return Ok(None);
        };

        if inner.cipher.is_enabled() && bytes.len() == ENCRYPTED_RECORD_LEN {
            let stored = EncryptedRecord::from_bytes(&bytes).ok_or(StorageError::LengthMismatch {
                expected: ENCRYPTED_RECORD_LEN,
                actual: bytes.len(),
            })?;
            let plain = inner.cipher.decrypt(&stored.data, &stored.iv)?;
            return FaultRecord::from_bytes(&plain)
                .map(Some)
                .ok_or(StorageError::LengthMismatch {
                    expected: RECORD_LEN,
                    actual: plain.len(),
                });
        }

        if bytes.len() == RECORD_LEN {
            if inner.cipher.is_enabled() {
                debug!(evt = "LEGACY_PLAIN_RECORD", "plain record found; will re-encrypt");
            }
            return Ok(FaultRecord::from_bytes(&bytes));
        }

        Err(StorageError::LengthMismatch {
            expected: if inner.cipher.is_enabled() {
                ENCRYPTED_RECORD_LEN
            } else {
                RECORD_LEN
            },
            actual: bytes.len(),
        })
    }

    /// Encode the cached record (encrypting when enabled) and write it.
    fn commit(inner: &mut StoreInner) -> Result<(), StorageError> {
        let plain = inner.record.to_bytes();
        let result = if inner.cipher.is_enabled() {
            Self::encrypt(inner.cipher.as_ref(), &plain)
                .and_then(|stored| inner.backend.write(RECORD_ID, &stored.to_bytes()))
        } else {
            inner.backend.write(RECORD_ID, &plain)
        };
        if let Err(e) = &result {
            error!(evt = "WRITE_FAIL", error = %e, "fault record write failed");
        }
        result
    }

    fn encrypt(
        cipher: &dyn RecordCipher,
        plain: &[u8; RECORD_LEN],
    ) -> Result<EncryptedRecord, StorageError> {
        let (data, iv) = cipher.encrypt(plain)?;
        let data: [u8; RECORD_LEN] =
            data.as_slice()
                .try_into()
                .map_err(|_| StorageError::LengthMismatch {
                    expected: RECORD_LEN,
                    actual: data.len(),
                })?;
        Ok(EncryptedRecord { iv, data })
    }
}
