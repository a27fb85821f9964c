//! Record cipher collaborator.
//!
//! The fault store encrypts its record through a [`RecordCipher`] when one is
//! enabled.  The contract is narrow: same-length ciphertext, a fresh
//! [`IV_LEN`]-byte IV per encryption, and explicit failure (never partial
//! output) while disabled.  The persisted boot session counter is handed
//! over through [`RecordCipher::set_session`] so IVs never repeat across
//! reboots.

use std::sync::atomic::{AtomicU32, Ordering};

use lifeline_types::{CipherError, IV_LEN};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Optional encryption at rest.
pub trait RecordCipher: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Encrypt `plain`, returning same-length ciphertext and the IV used.
    fn encrypt(&self, plain: &[u8]) -> Result<(Vec<u8>, [u8; IV_LEN]), CipherError>;

    /// Inverse of [`encrypt`][RecordCipher::encrypt].
    fn decrypt(&self, cipher: &[u8], iv: &[u8; IV_LEN]) -> Result<Vec<u8>, CipherError>;

    /// Non-secret diversifier for every IV drawn from now on.
    fn set_session(&self, _session: u32) {}
}

/// Cipher used when no key is provisioned.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCipher;

impl RecordCipher for DisabledCipher {
    fn is_enabled(&self) -> bool {
        false
    }

    fn encrypt(&self, _plain: &[u8]) -> Result<(Vec<u8>, [u8; IV_LEN]), CipherError> {
        Err(CipherError::Disabled)
    }

    fn decrypt(&self, _cipher: &[u8], _iv: &[u8; IV_LEN]) -> Result<Vec<u8>, CipherError> {
        Err(CipherError::Disabled)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// KeystreamCipher
// ────────────────────────────────────────────────────────────────────────────

const BLOCK_LEN: usize = 32;

/// Counter-mode stream cipher over SHA-256.
///
/// Keystream block `n` is `SHA-256(key || iv || n_be32)`.  Each IV is the
/// provisioned seed XOR `session_be32 || random_32 || counter_be32`: the
/// session separates boots, the counter separates encryptions within one.
pub struct KeystreamCipher {
    key: Zeroizing<Vec<u8>>,
    iv_seed: [u8; IV_LEN],
    session: AtomicU32,
    iv_counter: AtomicU32,
}

impl std::fmt::Debug for KeystreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystreamCipher")
            .field("key", &"<redacted>")
            .field("key_len", &self.key.len())
            .finish()
    }
}

impl KeystreamCipher {
    /// Build a cipher from a 16, 24 or 32 byte key.
    pub fn new(key: &[u8], iv_seed: [u8; IV_LEN]) -> Result<Self, CipherError> {
        if !matches!(key.len(), 16 | 24 | 32) {
            return Err(CipherError::InvalidKey(key.len()));
        }
        Ok(Self {
            key: Zeroizing::new(key.to_vec()),
            iv_seed,
            session: AtomicU32::new(0),
            iv_counter: AtomicU32::new(0),
        })
    }

    /// Build a cipher from hex strings. A missing seed means all zeroes.
    pub fn from_hex(key_hex: &str, iv_seed_hex: Option<&str>) -> Result<Self, CipherError> {
        let key = Zeroizing::new(
            hex::decode(key_hex.trim()).map_err(|e| CipherError::KeyEncoding(e.to_string()))?,
        );
        let mut seed = [0u8; IV_LEN];
        if let Some(seed_hex) = iv_seed_hex {
            let raw =
                hex::decode(seed_hex.trim()).map_err(|e| CipherError::KeyEncoding(e.to_string()))?;
            if raw.len() != IV_LEN {
                return Err(CipherError::KeyEncoding(format!(
                    "iv seed must be {IV_LEN} bytes, got {}",
                    raw.len()
                )));
            }
            seed.copy_from_slice(&raw);
        }
        Self::new(&key, seed)
    }

    fn next_iv(&self) -> [u8; IV_LEN] {
        let mut fields = [0u8; IV_LEN];
        fields[..4].copy_from_slice(&self.session.load(Ordering::Acquire).to_be_bytes());
        fields[4..8].copy_from_slice(&rand::random::<[u8; 4]>());
        fields[8..].copy_from_slice(
            &self.iv_counter.fetch_add(1, Ordering::Relaxed).to_be_bytes(),
        );

        let mut iv = self.iv_seed;
        for (b, f) in iv.iter_mut().zip(fields.iter()) {
            *b ^= f;
        }
        iv
    }

    fn apply_keystream(&self, iv: &[u8; IV_LEN], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for (n, chunk) in data.chunks(BLOCK_LEN).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(self.key.as_slice());
            hasher.update(iv);
            hasher.update((n as u32).to_be_bytes());
            let block = hasher.finalize();
            out.extend(chunk.iter().zip(block.iter()).map(|(d, k)| d ^ k));
        }
        out
    }
}

impl RecordCipher for KeystreamCipher {
    fn is_enabled(&self) -> bool {
        true
    }

    fn encrypt(&self, plain: &[u8]) -> Result<(Vec<u8>, [u8; IV_LEN]), CipherError> {
        let iv = self.next_iv();
        let cipher = self.apply_keystream(&iv, plain);
        if cipher.len() != plain.len() {
            return Err(CipherError::LengthMismatch {
                expected: plain.len(),
                actual: cipher.len(),
            });
        }
        Ok((cipher, iv))
    }

    fn decrypt(&self, cipher: &[u8], iv: &[u8; IV_LEN]) -> Result<Vec<u8>, CipherError> {
        Ok(self.apply_keystream(iv, cipher))
    }

    fn set_session(&self, session: u32) {
        self.session.store(session, Ordering::Release);
    }
}
