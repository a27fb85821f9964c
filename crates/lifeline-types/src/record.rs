//! [`FaultRecord`] – the single fixed-size record persisted across reboots.
//!
//! Two on-disk shapes exist:
//!
//! | Shape | Length | Layout |
//! |---|---|---|
//! | plain | [`RECORD_LEN`] | `magic, consecutive, total, override_ms, session_counter` (`u32` each) |
//! | encrypted | [`ENCRYPTED_RECORD_LEN`] | `iv[IV_LEN]` followed by the ciphertext of the plain shape |
//!
//! The read path tells them apart purely by stored length.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Marker identifying an initialised record (`'LEDS'`).
pub const RECORD_MAGIC: u32 = 0x4C45_4453;

/// Size of the plain record in bytes.
pub const RECORD_LEN: usize = std::mem::size_of::<FaultRecord>();

/// Length of the IV prefixed to an encrypted record.
pub const IV_LEN: usize = 12;

/// Size of the encrypted record in bytes.
pub const ENCRYPTED_RECORD_LEN: usize = std::mem::size_of::<EncryptedRecord>();

/// Boot and crash counters plus the runtime watchdog override.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize,
)]
pub struct FaultRecord {
    pub magic: u32,
    /// Unbroken run of watchdog-triggered boots since the last clean boot.
    pub consecutive_watchdog_resets: u32,
    /// Every watchdog-triggered boot ever observed.
    pub total_watchdog_resets: u32,
    /// Persisted steady-state timeout override; `0` means "use the default".
    pub watchdog_override_ms: u32,
    /// Non-secret session diversifier handed to the crypto collaborator.
    pub session_counter: u32,
}

impl FaultRecord {
    /// A zeroed record carrying the valid magic, as written on first boot.
    pub fn fresh() -> Self {
        Self {
            magic: RECORD_MAGIC,
            ..Self::default()
        }
    }

    /// `false` when the magic does not match (absent or corrupt data).
    pub fn is_valid(&self) -> bool {
        self.magic == RECORD_MAGIC
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out.copy_from_slice(bytemuck::bytes_of(self));
        out
    }

    /// Decode the plain shape. Returns `None` unless `bytes` is exactly
    /// [`RECORD_LEN`] long. The magic is not checked here.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytes).ok()
    }
}

/// Encrypted on-disk shape: IV followed by same-length ciphertext.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct EncryptedRecord {
    pub iv: [u8; IV_LEN],
    pub data: [u8; RECORD_LEN],
}

impl EncryptedRecord {
    pub fn to_bytes(&self) -> [u8; ENCRYPTED_RECORD_LEN] {
        let mut out = [0u8; ENCRYPTED_RECORD_LEN];
        out.copy_from_slice(bytemuck::bytes_of(self));
        out
    }

    /// Decode the encrypted shape. Returns `None` unless `bytes` is exactly
    /// [`ENCRYPTED_RECORD_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_have_distinct_fixed_lengths() {
        assert_eq!(RECORD_LEN, 20);
        assert_eq!(ENCRYPTED_RECORD_LEN, IV_LEN + RECORD_LEN);
    }

    #[test]
    fn fresh_record_is_valid_and_zeroed() {
        let rec = FaultRecord::fresh();
        assert!(rec.is_valid());
        assert_eq!(rec.consecutive_watchdog_resets, 0);
        assert_eq!(rec.total_watchdog_resets, 0);
        assert_eq!(rec.watchdog_override_ms, 0);
        assert_eq!(rec.session_counter, 0);
    }

    #[test]
    fn default_record_fails_magic_check() {
        assert!(!FaultRecord::default().is_valid());
    }

    #[test]
    fn plain_decode_rejects_wrong_length() {
        let bytes = FaultRecord::fresh().to_bytes();
        assert!(FaultRecord::from_bytes(&bytes[..RECORD_LEN - 1]).is_none());
        assert!(FaultRecord::from_bytes(&[0u8; ENCRYPTED_RECORD_LEN]).is_none());
    }

    #[test]
    fn plain_bytes_decode_to_same_record() {
        let rec = FaultRecord {
            magic: RECORD_MAGIC,
            consecutive_watchdog_resets: 2,
            total_watchdog_resets: 9,
            watchdog_override_ms: 1500,
            session_counter: 41,
        };
        assert_eq!(FaultRecord::from_bytes(&rec.to_bytes()), Some(rec));
    }

    #[test]
    fn encrypted_decode_splits_iv_and_payload() {
        let mut bytes = [0u8; ENCRYPTED_RECORD_LEN];
        bytes[0] = 0xAA;
        bytes[IV_LEN] = 0x55;
        let enc = EncryptedRecord::from_bytes(&bytes).unwrap();
        assert_eq!(enc.iv[0], 0xAA);
        assert_eq!(enc.data[0], 0x55);
        assert!(EncryptedRecord::from_bytes(&bytes[..RECORD_LEN]).is_none());
    }
}
