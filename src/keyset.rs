//! Per-stage key wrapping under a caller-held master secret.
//!
//! Each stage key is sealed independently: the wrap key is derived from the
//! master secret with HKDF-SHA256 and the key material is encrypted with
//! XChaCha20-Poly1305 under a fresh random nonce. The wrapped form is
//! `nonce || ciphertext || tag`, opaque to the rest of the codec.

use crate::error::{LaminaError, Result};
use crate::spec::AlgorithmSpec;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

const WRAP_KEY_LEN: usize = 32;
const WRAP_NONCE_LEN: usize = 24;
const WRAP_TAG_LEN: usize = 16;
const WRAP_INFO: &[u8] = b"lamina_key_wrap_v1";

/// Holds the master secret and wraps/unwraps per-stage keys under it.
pub struct KeySet {
    wrap_key: Zeroizing<[u8; WRAP_KEY_LEN]>,
}

impl KeySet {
    pub fn new(master_secret: &[u8]) -> Self {
        let hk = Hkdf::<Sha256>::new(None, master_secret);
        let mut wrap_key = Zeroizing::new([0u8; WRAP_KEY_LEN]);
        hk.expand(WRAP_INFO, wrap_key.as_mut())
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        Self { wrap_key }
    }

    /// Seal stage key material. Every call produces a different wrapping
    /// because the nonce is drawn fresh from the system CSPRNG.
    pub fn wrap_key(&self, key_material: &[u8]) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(self.wrap_key.as_ref().into());
        let mut nonce = [0u8; WRAP_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(XNonce::from_slice(&nonce), key_material)
            .map_err(|_| LaminaError::KeyWrap("seal failed".into()))?;

        let mut wrapped = Vec::with_capacity(WRAP_NONCE_LEN + sealed.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&sealed);
        Ok(wrapped)
    }

    /// Open a wrapped key and check its length against the target spec.
    /// Any tampering with the wrapped bytes fails authentication here.
    pub fn unwrap_key(&self, wrapped: &[u8], spec: AlgorithmSpec) -> Result<Zeroizing<Vec<u8>>> {
        if wrapped.len() < WRAP_NONCE_LEN + WRAP_TAG_LEN {
            return Err(LaminaError::KeyWrap("wrapped key too short".into()));
        }
        let (nonce, sealed) = wrapped.split_at(WRAP_NONCE_LEN);

        let cipher = XChaCha20Poly1305::new(self.wrap_key.as_ref().into());
        let mut key = cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| LaminaError::KeyWrap("unwrap failed".into()))?;

        let expected = match spec {
            AlgorithmSpec::Mac(s) => s.key_len(),
            AlgorithmSpec::Block(s) => s.key_len(),
            AlgorithmSpec::Stream(s) => s.key_len(),
            AlgorithmSpec::Digest(_) => {
                key.zeroize();
                return Err(LaminaError::KeyWrap("digest stages carry no key".into()));
            }
        };
        if key.len() != expected {
            key.zeroize();
            return Err(LaminaError::KeyWrap(format!(
                "unwrapped key length {} does not match spec",
                key.len()
            )));
        }
        Ok(Zeroizing::new(key))
    }
}

/// Generate fresh stage key material of the requested length.
pub fn generate_key(len: usize) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; len]);
    OsRng.fill_bytes(key.as_mut());
    key
}

/// Generate a fresh init vector of the requested length.
pub fn generate_iv(len: usize) -> Vec<u8> {
    let mut iv = vec![0u8; len];
    OsRng.fill_bytes(&mut iv);
    iv
}
