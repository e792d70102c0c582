//! Sensitive byte values held in memory
//!
//! Entry passwords, the master password and key file contents are stored as
//! [`SecretBytes`]. With a [`Mask`] attached the bytes sit XORed with a
//! ChaCha20 keystream under a per-database ephemeral key and are unmasked on
//! every read. This keeps plaintext out of casual memory dumps and nothing
//! more. Every buffer is wiped when dropped.

use std::fmt;
use std::sync::Arc;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

/// Ephemeral key used to obfuscate the secrets of one database instance
pub struct Mask {
    key: Zeroizing<[u8; 32]>,
}

impl Mask {
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Arc<Mask> {
        let mut key = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(key.as_mut());
        Arc::new(Mask { key })
    }

    fn apply(&self, nonce: &[u8; 12], buf: &mut [u8]) {
        let mut cipher = ChaCha20::new(Key::from_slice(self.key.as_ref()), Nonce::from_slice(nonce));
        cipher.apply_keystream(buf);
    }
}

impl fmt::Debug for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mask(***)")
    }
}

#[derive(Clone)]
pub struct SecretBytes {
    stored: Zeroizing<Vec<u8>>,
    nonce: [u8; 12],
    mask: Option<Arc<Mask>>,
}

impl SecretBytes {
    /// Stores `plain`, masked when `mask` is given.
    pub fn new(plain: &[u8], mask: Option<&Arc<Mask>>) -> Self {
        let mut secret = SecretBytes {
            stored: Zeroizing::new(plain.to_vec()),
            nonce: [0; 12],
            mask: mask.cloned(),
        };
        if let Some(mask) = &secret.mask {
            rand::thread_rng().fill_bytes(&mut secret.nonce);
            mask.apply(&secret.nonce, &mut secret.stored);
        }
        secret
    }

    /// The plaintext, wiped again when the returned buffer is dropped.
    pub fn expose(&self) -> Zeroizing<Vec<u8>> {
        let mut plain = Zeroizing::new(self.stored.to_vec());
        if let Some(mask) = &self.mask {
            mask.apply(&self.nonce, &mut plain);
        }
        plain
    }

    pub fn len(&self) -> usize {
        self.stored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stored.is_empty()
    }

    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Raw storage, only meaningful for checking that masking happened.
    #[cfg(test)]
    pub(crate) fn stored(&self) -> &[u8] {
        &self.stored
    }
}

impl PartialEq for SecretBytes {
    fn eq(&self, other: &Self) -> bool {
        *self.expose() == *other.expose()
    }
}

impl Eq for SecretBytes {}

impl Zeroize for SecretBytes {
    fn zeroize(&mut self) {
        self.stored.zeroize();
        self.nonce.zeroize();
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes(***)")
    }
}
