//! Write-direction stages.
//!
//! An encode pipeline is a chain of stages ending in the caller's sink.
//! Bytes written to the outermost stage are transformed and forwarded
//! immediately; `close` cascades inward, letting each stage emit its final
//! chunk (cipher padding, the compressed stream) before the next inner
//! stage finalizes. The digest tag rides the close cascade inward so the
//! MAC absorbs it after the last ciphertext byte, which is the ordering the
//! decode side reproduces.
//!
//! Digest and MAC stages observe the bytes without changing them; cipher
//! and compress stages transform before forwarding.

use crate::buffer::StageBuf;
use crate::error::{LaminaError, Result};
use crate::factory::{
    create_block_cipher, create_ctr, create_digest, create_mac, create_stream_cipher, BlockEngine,
    DigestEngine, MacEngine, StreamEngine,
};
use crate::spec::{BlockCipherSpec, DigestSpec, MacSpec, StreamCipherSpec};
use std::io::{self, Write};
use zeroize::Zeroizing;

/// The closed set of write-direction stages. The `Sink` variant is the
/// boundary: introspection walks the chain and stops there.
pub enum EncodeStage {
    Digest(DigestWriteStage),
    Mac(MacWriteStage),
    Cipher(CipherWriteStage),
    Compress(CompressWriteStage),
    Sink(SinkStage),
}

pub struct DigestWriteStage {
    pub(crate) spec: DigestSpec,
    pub(crate) engine: Box<dyn DigestEngine>,
    pub(crate) tag: Option<Vec<u8>>,
    pub(crate) data_len: u64,
    pub(crate) closed: bool,
    pub(crate) inner: Box<EncodeStage>,
}

pub struct MacWriteStage {
    pub(crate) spec: MacSpec,
    pub(crate) engine: Box<dyn MacEngine>,
    pub(crate) key: Zeroizing<Vec<u8>>,
    pub(crate) iv: Vec<u8>,
    pub(crate) tag: Option<Vec<u8>>,
    pub(crate) data_len: u64,
    pub(crate) closed: bool,
    pub(crate) inner: Box<EncodeStage>,
}

pub(crate) enum CipherMode {
    Stream {
        spec: StreamCipherSpec,
        engine: Box<dyn StreamEngine>,
    },
    Ctr {
        spec: BlockCipherSpec,
        engine: Box<dyn StreamEngine>,
    },
    Ecb {
        spec: BlockCipherSpec,
        engine: Box<dyn BlockEngine>,
        padded: bool,
    },
}

pub struct CipherWriteStage {
    pub(crate) mode: CipherMode,
    pub(crate) key: Zeroizing<Vec<u8>>,
    pub(crate) iv: Option<Vec<u8>>,
    /// Partial block awaiting alignment (ECB modes only)
    pending: Zeroizing<Vec<u8>>,
    scratch: StageBuf,
    pub(crate) closed: bool,
    pub(crate) inner: Box<EncodeStage>,
}

pub struct CompressWriteStage {
    buffered: Zeroizing<Vec<u8>>,
    pub(crate) closed: bool,
    pub(crate) inner: Box<EncodeStage>,
}

pub struct SinkStage {
    sink: Box<dyn Write + Send>,
    closed: bool,
}

impl EncodeStage {
    pub fn sink(sink: Box<dyn Write + Send>) -> Self {
        EncodeStage::Sink(SinkStage {
            sink,
            closed: false,
        })
    }

    pub fn digest(spec: DigestSpec, inner: EncodeStage) -> Self {
        EncodeStage::Digest(DigestWriteStage {
            spec,
            engine: create_digest(spec),
            tag: None,
            data_len: 0,
            closed: false,
            inner: Box::new(inner),
        })
    }

    pub fn mac(
        spec: MacSpec,
        key: Zeroizing<Vec<u8>>,
        iv: Vec<u8>,
        inner: EncodeStage,
    ) -> Result<Self> {
        let engine = create_mac(spec, &key, &iv)?;
        Ok(EncodeStage::Mac(MacWriteStage {
            spec,
            engine,
            key,
            iv,
            tag: None,
            data_len: 0,
            closed: false,
            inner: Box::new(inner),
        }))
    }

    pub fn cipher_stream(
        spec: StreamCipherSpec,
        key: Zeroizing<Vec<u8>>,
        iv: Vec<u8>,
        inner: EncodeStage,
    ) -> Result<Self> {
        let engine = create_stream_cipher(spec, &key, &iv)?;
        Ok(EncodeStage::Cipher(CipherWriteStage {
            mode: CipherMode::Stream { spec, engine },
            key,
            iv: Some(iv),
            pending: Zeroizing::new(Vec::new()),
            scratch: StageBuf::new(),
            closed: false,
            inner: Box::new(inner),
        }))
    }

    pub fn cipher_ctr(
        spec: BlockCipherSpec,
        key: Zeroizing<Vec<u8>>,
        iv: Vec<u8>,
        inner: EncodeStage,
    ) -> Result<Self> {
        let engine = create_ctr(spec, &key, &iv)?;
        Ok(EncodeStage::Cipher(CipherWriteStage {
            mode: CipherMode::Ctr { spec, engine },
            key,
            iv: Some(iv),
            pending: Zeroizing::new(Vec::new()),
            scratch: StageBuf::new(),
            closed: false,
            inner: Box::new(inner),
        }))
    }

    pub fn cipher_ecb(
        spec: BlockCipherSpec,
        key: Zeroizing<Vec<u8>>,
        padded: bool,
        inner: EncodeStage,
    ) -> Result<Self> {
        let engine = create_block_cipher(spec, &key)?;
        Ok(EncodeStage::Cipher(CipherWriteStage {
            mode: CipherMode::Ecb {
                spec,
                engine,
                padded,
            },
            key,
            iv: None,
            pending: Zeroizing::new(Vec::new()),
            scratch: StageBuf::new(),
            closed: false,
            inner: Box::new(inner),
        }))
    }

    pub fn compress(inner: EncodeStage) -> Self {
        EncodeStage::Compress(CompressWriteStage {
            buffered: Zeroizing::new(Vec::new()),
            closed: false,
            inner: Box::new(inner),
        })
    }

    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            EncodeStage::Digest(s) => {
                if s.closed {
                    return Err(write_after_close());
                }
                s.engine.update(buf);
                s.data_len += buf.len() as u64;
                s.inner.write_bytes(buf)
            }
            EncodeStage::Mac(s) => {
                if s.closed {
                    return Err(write_after_close());
                }
                s.engine.update(buf);
                s.data_len += buf.len() as u64;
                s.inner.write_bytes(buf)
            }
            EncodeStage::Cipher(s) => s.write_bytes(buf),
            EncodeStage::Compress(s) => {
                if s.closed {
                    return Err(write_after_close());
                }
                s.buffered.extend_from_slice(buf);
                Ok(())
            }
            EncodeStage::Sink(s) => {
                if s.closed {
                    return Err(write_after_close());
                }
                s.sink.write_all(buf)?;
                Ok(())
            }
        }
    }

    pub fn flush_all(&mut self) -> Result<()> {
        match self {
            EncodeStage::Digest(s) => s.inner.flush_all(),
            EncodeStage::Mac(s) => s.inner.flush_all(),
            EncodeStage::Cipher(s) => s.inner.flush_all(),
            EncodeStage::Compress(s) => s.inner.flush_all(),
            EncodeStage::Sink(s) => {
                s.sink.flush()?;
                Ok(())
            }
        }
    }

    /// Finalize this stage and everything inward. Idempotent: a second
    /// close is a no-op. The caller's sink is flushed, not dropped.
    pub fn close(&mut self) -> Result<()> {
        self.close_with(None)
    }

    fn close_with(&mut self, digest_tag: Option<&[u8]>) -> Result<()> {
        match self {
            EncodeStage::Digest(s) => {
                if s.closed {
                    return Ok(());
                }
                s.closed = true;
                s.inner.flush_all()?;
                let tag = s.engine.finish();
                s.tag = Some(tag.clone());
                s.inner.close_with(Some(&tag))
            }
            EncodeStage::Mac(s) => {
                if s.closed {
                    return Ok(());
                }
                s.closed = true;
                s.inner.flush_all()?;
                if let Some(tag) = digest_tag {
                    // The MAC binds the digest tag after the final
                    // ciphertext byte; decode replays the same order.
                    s.engine.update(tag);
                }
                s.tag = Some(s.engine.finish());
                s.inner.close_with(None)
            }
            EncodeStage::Cipher(s) => s.close_with(digest_tag),
            EncodeStage::Compress(s) => {
                if s.closed {
                    return Ok(());
                }
                s.closed = true;
                // Compressed bytes are still plaintext-derived; wipe them
                // once they are handed inward.
                let mut compressed = Zeroizing::new(Vec::new());
                lzma_rs::lzma_compress(&mut &s.buffered[..], &mut *compressed)
                    .map_err(|e| LaminaError::Compression(e.to_string()))?;
                s.inner.write_bytes(&compressed)?;
                s.inner.close_with(digest_tag)
            }
            EncodeStage::Sink(s) => {
                if s.closed {
                    return Ok(());
                }
                s.closed = true;
                s.sink.flush()?;
                Ok(())
            }
        }
    }

    /// The next inner stage, if this is not the sink boundary.
    pub(crate) fn inner(&self) -> Option<&EncodeStage> {
        match self {
            EncodeStage::Digest(s) => Some(&s.inner),
            EncodeStage::Mac(s) => Some(&s.inner),
            EncodeStage::Cipher(s) => Some(&s.inner),
            EncodeStage::Compress(s) => Some(&s.inner),
            EncodeStage::Sink(_) => None,
        }
    }
}

impl CipherWriteStage {
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(write_after_close());
        }
        match &mut self.mode {
            CipherMode::Stream { engine, .. } | CipherMode::Ctr { engine, .. } => {
                self.scratch.ensure(buf.len());
                let out = &mut self.scratch.as_mut_slice()[..buf.len()];
                out.copy_from_slice(buf);
                engine.apply_keystream(out);
                self.inner.write_bytes(out)
            }
            CipherMode::Ecb { engine, .. } => {
                self.pending.extend_from_slice(buf);
                let bs = engine.block_len();
                let full = (self.pending.len() / bs) * bs;
                if full == 0 {
                    return Ok(());
                }
                self.scratch.ensure(full);
                let out = &mut self.scratch.as_mut_slice()[..full];
                out.copy_from_slice(&self.pending[..full]);
                for block in out.chunks_mut(bs) {
                    engine.encrypt_block(block);
                }
                self.pending.drain(..full);
                self.inner.write_bytes(out)
            }
        }
    }

    fn close_with(&mut self, digest_tag: Option<&[u8]>) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match &mut self.mode {
            CipherMode::Stream { .. } | CipherMode::Ctr { .. } => {}
            CipherMode::Ecb {
                engine,
                padded: true,
                ..
            } => {
                // PKCS#7: the final block always exists, even for aligned
                // input, so the unpadder can rely on it.
                let bs = engine.block_len();
                let rem = self.pending.len();
                let pad = (bs - rem) as u8;
                self.scratch.ensure(bs);
                let out = &mut self.scratch.as_mut_slice()[..bs];
                out[..rem].copy_from_slice(&self.pending);
                out[rem..].fill(pad);
                engine.encrypt_block(out);
                self.pending.clear();
                self.inner.write_bytes(out)?;
            }
            CipherMode::Ecb {
                engine,
                padded: false,
                ..
            } => {
                let bs = engine.block_len();
                if !self.pending.is_empty() {
                    return Err(LaminaError::Protocol(format!(
                        "unpadded cipher stage closed {} bytes short of a {}-byte block",
                        bs - self.pending.len(),
                        bs
                    )));
                }
            }
        }
        self.inner.close_with(digest_tag)
    }
}

impl Write for EncodeStage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_all()?;
        Ok(())
    }
}

fn write_after_close() -> LaminaError {
    LaminaError::Protocol("write to a closed stage".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyset::{generate_iv, generate_key};

    fn sink_to(buf: &std::sync::Arc<std::sync::Mutex<Vec<u8>>>) -> EncodeStage {
        struct Shared(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        EncodeStage::sink(Box::new(Shared(buf.clone())))
    }

    fn captured(buf: &std::sync::Arc<std::sync::Mutex<Vec<u8>>>) -> Vec<u8> {
        buf.lock().unwrap().clone()
    }

    fn shared_buf() -> std::sync::Arc<std::sync::Mutex<Vec<u8>>> {
        std::sync::Arc::new(std::sync::Mutex::new(Vec::new()))
    }

    #[test]
    fn test_digest_stage_forwards_unmodified() {
        let buf = shared_buf();
        let mut stage = EncodeStage::digest(DigestSpec::Sha3_256, sink_to(&buf));
        stage.write_bytes(b"observed, not transformed").unwrap();
        stage.close().unwrap();
        assert_eq!(captured(&buf), b"observed, not transformed");
        match stage {
            EncodeStage::Digest(s) => {
                assert_eq!(s.tag.unwrap().len(), 32);
                assert_eq!(s.data_len, 25);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_mac_tag_not_written_to_stream() {
        let buf = shared_buf();
        let key = generate_key(32);
        let iv = generate_iv(16);
        let mut stage =
            EncodeStage::mac(MacSpec::HmacSha256, key, iv, sink_to(&buf)).unwrap();
        stage.write_bytes(b"payload").unwrap();
        stage.close().unwrap();
        // Tag is captured for the descriptor, never appended to the bytes
        assert_eq!(captured(&buf), b"payload");
        match stage {
            EncodeStage::Mac(s) => assert_eq!(s.tag.unwrap().len(), 32),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_ecb_padded_output_is_block_multiple() {
        for input_len in [0usize, 1, 15, 16, 17, 100] {
            let buf = shared_buf();
            let key = generate_key(32);
            let mut stage =
                EncodeStage::cipher_ecb(BlockCipherSpec::Aes256, key, true, sink_to(&buf))
                    .unwrap();
            stage.write_bytes(&vec![0x61; input_len]).unwrap();
            stage.close().unwrap();
            let out = captured(&buf);
            assert_eq!(out.len() % 16, 0);
            // PKCS#7 always emits at least one extra padding byte
            assert!(out.len() > input_len);
        }
    }

    #[test]
    fn test_ecb_unpadded_rejects_misaligned_close() {
        let buf = shared_buf();
        let key = generate_key(32);
        let mut stage =
            EncodeStage::cipher_ecb(BlockCipherSpec::Aes256, key, false, sink_to(&buf)).unwrap();
        stage.write_bytes(b"seven by").unwrap();
        assert!(stage.close().unwrap_err().is_protocol());
    }

    #[test]
    fn test_ctr_preserves_length() {
        let buf = shared_buf();
        let key = generate_key(32);
        let iv = generate_iv(16);
        let mut stage =
            EncodeStage::cipher_ctr(BlockCipherSpec::Aes256, key, iv, sink_to(&buf)).unwrap();
        stage.write_bytes(b"odd sized message!").unwrap();
        stage.close().unwrap();
        assert_eq!(captured(&buf).len(), 18);
        assert_ne!(captured(&buf), b"odd sized message!");
    }

    #[test]
    fn test_close_is_idempotent() {
        let buf = shared_buf();
        let key = generate_key(16);
        let mut stage =
            EncodeStage::cipher_ecb(BlockCipherSpec::Aes128, key, true, sink_to(&buf)).unwrap();
        stage.write_bytes(b"data").unwrap();
        stage.close().unwrap();
        let after_first = captured(&buf);
        stage.close().unwrap();
        assert_eq!(captured(&buf), after_first);
    }

    #[test]
    fn test_compress_stage_emits_lzma_stream() {
        let buf = shared_buf();
        let mut stage = EncodeStage::compress(sink_to(&buf));
        let plaintext = vec![0x42u8; 4096];
        stage.write_bytes(&plaintext).unwrap();
        assert!(captured(&buf).is_empty(), "whole-stream codec emits at close");
        stage.close().unwrap();
        let out = captured(&buf);
        assert!(!out.is_empty());
        assert!(out.len() < plaintext.len());

        let mut restored = Vec::new();
        lzma_rs::lzma_decompress(&mut &out[..], &mut restored).unwrap();
        assert_eq!(restored, plaintext);
    }
}
