//! Construction of digest, MAC and cipher engines from algorithm specs.
//!
//! The codec never touches a primitive crate directly; every stage works
//! against the engine traits below and gets its instance from this factory.

use crate::error::{LaminaError, Result};
use crate::spec::{BlockCipherSpec, DigestSpec, MacSpec, StreamCipherSpec};
use aes::{Aes128, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit};
use ctr::Ctr128BE;
use digest::FixedOutputReset;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use twofish::Twofish;

type HmacSha256 = Hmac<Sha256>;
type HmacSha3_256 = Hmac<Sha3_256>;

/// Incremental unkeyed digest
pub trait DigestEngine: Send {
    fn update(&mut self, data: &[u8]);
    /// Single-shot: produces the finished tag and resets internal state.
    fn finish(&mut self) -> Vec<u8>;
    fn tag_len(&self) -> usize;
}

/// Incremental keyed MAC. The init vector is absorbed at construction,
/// before any stream data.
pub trait MacEngine: Send {
    fn update(&mut self, data: &[u8]);
    fn finish(&mut self) -> Vec<u8>;
    fn tag_len(&self) -> usize;
}

/// One-block-at-a-time block cipher
pub trait BlockEngine: Send {
    fn block_len(&self) -> usize;
    fn encrypt_block(&mut self, block: &mut [u8]);
    fn decrypt_block(&mut self, block: &mut [u8]);
}

/// Keystream cipher; output length always equals input length
pub trait StreamEngine: Send {
    fn apply_keystream(&mut self, buf: &mut [u8]);
}

// --- digest ---

struct Sha2Digest(Sha256);
struct Sha3Digest(Sha3_256);
struct Blake3Digest(blake3::Hasher);

impl DigestEngine for Sha2Digest {
    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }
    fn finish(&mut self) -> Vec<u8> {
        self.0.finalize_reset().to_vec()
    }
    fn tag_len(&self) -> usize {
        32
    }
}

impl DigestEngine for Sha3Digest {
    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }
    fn finish(&mut self) -> Vec<u8> {
        self.0.finalize_reset().to_vec()
    }
    fn tag_len(&self) -> usize {
        32
    }
}

impl DigestEngine for Blake3Digest {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }
    fn finish(&mut self) -> Vec<u8> {
        let tag = self.0.finalize().as_bytes().to_vec();
        self.0.reset();
        tag
    }
    fn tag_len(&self) -> usize {
        32
    }
}

pub fn create_digest(spec: DigestSpec) -> Box<dyn DigestEngine> {
    match spec {
        DigestSpec::Sha256 => Box::new(Sha2Digest(Sha256::new())),
        DigestSpec::Sha3_256 => Box::new(Sha3Digest(Sha3_256::new())),
        DigestSpec::Blake3 => Box::new(Blake3Digest(blake3::Hasher::new())),
    }
}

// --- MAC ---

struct HmacMac<M: Mac + FixedOutputReset + Send>(M);
struct Blake3Mac(blake3::Hasher);

impl<M: Mac + FixedOutputReset + Send> MacEngine for HmacMac<M> {
    fn update(&mut self, data: &[u8]) {
        Mac::update(&mut self.0, data);
    }
    fn finish(&mut self) -> Vec<u8> {
        self.0.finalize_reset().into_bytes().to_vec()
    }
    fn tag_len(&self) -> usize {
        32
    }
}

impl MacEngine for Blake3Mac {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }
    fn finish(&mut self) -> Vec<u8> {
        let tag = self.0.finalize().as_bytes().to_vec();
        self.0.reset();
        tag
    }
    fn tag_len(&self) -> usize {
        32
    }
}

pub fn create_mac(spec: MacSpec, key: &[u8], iv: &[u8]) -> Result<Box<dyn MacEngine>> {
    if key.len() != spec.key_len() {
        return Err(LaminaError::Protocol(format!(
            "MAC key length {} does not match spec",
            key.len()
        )));
    }
    if iv.len() != spec.iv_len() {
        return Err(LaminaError::Protocol(format!(
            "MAC init vector length {} does not match spec",
            iv.len()
        )));
    }
    let mut mac: Box<dyn MacEngine> = match spec {
        MacSpec::HmacSha256 => Box::new(HmacMac(
            <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size"),
        )),
        MacSpec::HmacSha3_256 => Box::new(HmacMac(
            <HmacSha3_256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size"),
        )),
        MacSpec::Blake3Keyed => {
            let mut fixed = [0u8; 32];
            fixed.copy_from_slice(key);
            Box::new(Blake3Mac(blake3::Hasher::new_keyed(&fixed)))
        }
    };
    mac.update(iv);
    Ok(mac)
}

// --- block ciphers ---

struct BlockEngineImpl<C: BlockEncrypt + BlockDecrypt + Send>(C);

impl<C: BlockEncrypt + BlockDecrypt + Send> BlockEngine for BlockEngineImpl<C> {
    fn block_len(&self) -> usize {
        C::block_size()
    }
    fn encrypt_block(&mut self, block: &mut [u8]) {
        self.0.encrypt_block(GenericArray::from_mut_slice(block));
    }
    fn decrypt_block(&mut self, block: &mut [u8]) {
        self.0.decrypt_block(GenericArray::from_mut_slice(block));
    }
}

pub fn create_block_cipher(spec: BlockCipherSpec, key: &[u8]) -> Result<Box<dyn BlockEngine>> {
    if key.len() != spec.key_len() {
        return Err(LaminaError::Protocol(format!(
            "block cipher key length {} does not match spec",
            key.len()
        )));
    }
    Ok(match spec {
        BlockCipherSpec::Aes128 => Box::new(BlockEngineImpl(
            Aes128::new_from_slice(key).expect("length checked above"),
        )),
        BlockCipherSpec::Aes256 => Box::new(BlockEngineImpl(
            Aes256::new_from_slice(key).expect("length checked above"),
        )),
        BlockCipherSpec::Twofish => Box::new(BlockEngineImpl(
            Twofish::new_from_slice(key).expect("length checked above"),
        )),
    })
}

// --- keystream ciphers (CTR over the cascade entry, or a stream spec) ---

struct StreamEngineImpl<C: cipher::StreamCipher + Send>(C);

impl<C: cipher::StreamCipher + Send> StreamEngine for StreamEngineImpl<C> {
    fn apply_keystream(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf);
    }
}

/// Big-endian 128-bit counter mode over a cascade block cipher
pub fn create_ctr(spec: BlockCipherSpec, key: &[u8], iv: &[u8]) -> Result<Box<dyn StreamEngine>> {
    let bad = |what: &str, len: usize| {
        LaminaError::Protocol(format!("CTR {} length {} does not match spec", what, len))
    };
    if key.len() != spec.key_len() {
        return Err(bad("key", key.len()));
    }
    if iv.len() != spec.iv_len() {
        return Err(bad("init vector", iv.len()));
    }
    Ok(match spec {
        BlockCipherSpec::Aes128 => Box::new(StreamEngineImpl(
            Ctr128BE::<Aes128>::new_from_slices(key, iv).expect("lengths checked above"),
        )),
        BlockCipherSpec::Aes256 => Box::new(StreamEngineImpl(
            Ctr128BE::<Aes256>::new_from_slices(key, iv).expect("lengths checked above"),
        )),
        BlockCipherSpec::Twofish => Box::new(StreamEngineImpl(
            Ctr128BE::<Twofish>::new_from_slices(key, iv).expect("lengths checked above"),
        )),
    })
}

pub fn create_stream_cipher(
    spec: StreamCipherSpec,
    key: &[u8],
    iv: &[u8],
) -> Result<Box<dyn StreamEngine>> {
    let bad = |what: &str, len: usize| {
        LaminaError::Protocol(format!(
            "stream cipher {} length {} does not match spec",
            what, len
        ))
    };
    if key.len() != spec.key_len() {
        return Err(bad("key", key.len()));
    }
    if iv.len() != spec.iv_len() {
        return Err(bad("init vector", iv.len()));
    }
    Ok(match spec {
        StreamCipherSpec::ChaCha20 => Box::new(StreamEngineImpl(
            chacha20::ChaCha20::new_from_slices(key, iv).expect("lengths checked above"),
        )),
        StreamCipherSpec::XChaCha20 => Box::new(StreamEngineImpl(
            chacha20::XChaCha20::new_from_slices(key, iv).expect("lengths checked above"),
        )),
    })
}
