//! Algorithm spec selection and the compact integer encoding of specs.
//!
//! The obfuscator table is part of the persisted format: ids are fixed,
//! non-sequential and unique across every spec family, so a stored id can be
//! decoded without knowing its family in advance.

use crate::error::{LaminaError, Result};
use crate::spec::{AlgorithmSpec, BlockCipherSpec, DigestSpec, MacSpec, StreamCipherSpec};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;

/// Reversible spec ↔ small-integer mapping
#[derive(Debug, Clone, Copy, Default)]
pub struct IdObfuscator;

const ID_TABLE: [(u32, AlgorithmSpec); 11] = [
    (0x3, AlgorithmSpec::Digest(DigestSpec::Sha256)),
    (0x5, AlgorithmSpec::Digest(DigestSpec::Sha3_256)),
    (0x9, AlgorithmSpec::Digest(DigestSpec::Blake3)),
    (0x2, AlgorithmSpec::Mac(MacSpec::HmacSha256)),
    (0x4, AlgorithmSpec::Mac(MacSpec::HmacSha3_256)),
    (0x7, AlgorithmSpec::Mac(MacSpec::Blake3Keyed)),
    (0x1, AlgorithmSpec::Block(BlockCipherSpec::Aes128)),
    (0x6, AlgorithmSpec::Block(BlockCipherSpec::Aes256)),
    (0x8, AlgorithmSpec::Block(BlockCipherSpec::Twofish)),
    (0xA, AlgorithmSpec::Stream(StreamCipherSpec::ChaCha20)),
    (0xC, AlgorithmSpec::Stream(StreamCipherSpec::XChaCha20)),
];

impl IdObfuscator {
    pub fn spec_to_id(&self, spec: AlgorithmSpec) -> u32 {
        ID_TABLE
            .iter()
            .find(|(_, s)| *s == spec)
            .map(|(id, _)| *id)
            .expect("every spec variant has a table entry")
    }

    pub fn id_to_spec(&self, id: u32) -> Result<AlgorithmSpec> {
        ID_TABLE
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, s)| *s)
            .ok_or_else(|| LaminaError::UnsupportedAlgorithm(format!("algorithm id {}", id)))
    }
}

/// Random algorithm selection under a key-length policy.
/// Draws from the system CSPRNG; never constructs primitives itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdManager;

impl IdManager {
    pub fn random_digest_spec(&self) -> DigestSpec {
        *DigestSpec::ALL
            .choose(&mut OsRng)
            .expect("digest spec table is non-empty")
    }

    pub fn random_mac_spec(&self, key_len: usize) -> Result<MacSpec> {
        let eligible: Vec<MacSpec> = MacSpec::ALL
            .into_iter()
            .filter(|s| s.key_len() == key_len)
            .collect();
        eligible
            .choose(&mut OsRng)
            .copied()
            .ok_or_else(|| {
                LaminaError::UnsupportedAlgorithm(format!("no MAC with {}-byte key", key_len))
            })
    }

    /// Pick `count` independent block-cipher specs for the cascade.
    /// Repeats are allowed; every entry gets its own key anyway.
    pub fn random_block_specs(&self, key_len: usize, count: usize) -> Result<Vec<BlockCipherSpec>> {
        let eligible: Vec<BlockCipherSpec> = BlockCipherSpec::ALL
            .into_iter()
            .filter(|s| s.key_len() == key_len)
            .collect();
        if eligible.is_empty() {
            return Err(LaminaError::UnsupportedAlgorithm(format!(
                "no block cipher with {}-byte key",
                key_len
            )));
        }
        Ok((0..count)
            .map(|_| {
                *eligible
                    .choose(&mut OsRng)
                    .expect("eligible set checked above")
            })
            .collect())
    }

    pub fn random_stream_spec(&self, key_len: usize) -> Result<StreamCipherSpec> {
        let eligible: Vec<StreamCipherSpec> = StreamCipherSpec::ALL
            .into_iter()
            .filter(|s| s.key_len() == key_len)
            .collect();
        eligible
            .choose(&mut OsRng)
            .copied()
            .ok_or_else(|| {
                LaminaError::UnsupportedAlgorithm(format!(
                    "no stream cipher with {}-byte key",
                    key_len
                ))
            })
    }
}
