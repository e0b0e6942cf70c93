//! Read-direction stages.
//!
//! A decode pipeline is a chain of readers around the raw byte source. Each
//! stage pulls fixed-size chunks from upstream, runs them through its
//! transform, and serves the result out of a processed buffer. Upstream EOF
//! is translated into exactly one `finish` call on the transform; reads
//! after that keep returning EOF without re-finalizing.
//!
//! MAC verification is deferred: the MAC stage sits closest to the source
//! and exhausts before the digest stage has recomputed its tag, so the MAC
//! parks its engine in a shared `MacCheck` cell and the digest stage
//! completes the comparison when it finalizes. The cell is wired once at
//! build time and written once; no other state is shared between stages.

use crate::buffer::ProcessedBuffer;
use crate::error::{LaminaError, Result};
use crate::factory::{BlockEngine, DigestEngine, MacEngine, StreamEngine};
use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use zeroize::{Zeroize, Zeroizing};

/// Upstream pull size
const READ_CHUNK: usize = 8192;

/// Common surface of every read stage: plain `Read` plus the non-blocking
/// buffered-byte count and a skip that reports how far it actually got.
/// Pipelines are single-pass; there is no rewind.
pub trait StageRead: Read + Send {
    /// Bytes servable without touching the upstream source. Never blocks.
    fn available(&self) -> usize;

    /// Drain up to `n` bytes. Returns the actual count, which is smaller
    /// than `n` when upstream EOF is reached mid-skip.
    fn skip_bytes(&mut self, n: u64) -> io::Result<u64> {
        let mut skipped = 0u64;
        let mut scratch = [0u8; READ_CHUNK];
        while skipped < n {
            let want = ((n - skipped) as usize).min(scratch.len());
            let got = self.read(&mut scratch[..want])?;
            if got == 0 {
                break;
            }
            skipped += got as u64;
        }
        Ok(skipped)
    }
}

/// Adapter putting the caller's raw source behind the stage interface.
pub struct SourceReader {
    inner: Box<dyn Read + Send>,
}

impl SourceReader {
    pub fn new(inner: Box<dyn Read + Send>) -> Self {
        Self { inner }
    }
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl StageRead for SourceReader {
    fn available(&self) -> usize {
        0
    }
}

/// One stage's transformation of an upstream chunk stream.
pub trait ReadTransform: Send {
    /// Upper bound on the output produced for `input_len` more input bytes.
    /// The driver pre-sizes the processed buffer with this before every
    /// `process` call, and with `output_len(0)` before `finish`.
    fn output_len(&self, input_len: usize) -> usize;

    /// Transform one upstream chunk into the processed buffer.
    fn process(&mut self, input: &[u8], out: &mut ProcessedBuffer) -> Result<()>;

    /// Upstream is exhausted; emit any final output and run verification.
    /// Called exactly once.
    fn finish(&mut self, out: &mut ProcessedBuffer) -> Result<()>;
}

/// Generic pull-based stage driver around a `ReadTransform`.
pub struct TransformReader<T: ReadTransform> {
    transform: T,
    inner: Box<dyn StageRead>,
    chunk: Box<[u8; READ_CHUNK]>,
    buf: ProcessedBuffer,
    eof: bool,
}

impl<T: ReadTransform> TransformReader<T> {
    pub fn new(transform: T, inner: Box<dyn StageRead>) -> Self {
        Self {
            transform,
            inner,
            chunk: Box::new([0u8; READ_CHUNK]),
            buf: ProcessedBuffer::new(),
            eof: false,
        }
    }
}

impl<T: ReadTransform> Read for TransformReader<T> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.buf.has_data() {
                return Ok(self.buf.take(out));
            }
            if self.eof {
                return Ok(0);
            }
            let got = self.inner.read(&mut self.chunk[..])?;
            if got == 0 {
                // Single-shot finalize; afterwards only the buffered
                // remainder is served.
                self.eof = true;
                self.buf.reserve(self.transform.output_len(0));
                self.transform.finish(&mut self.buf)?;
            } else {
                self.buf.reserve(self.transform.output_len(got));
                self.transform.process(&self.chunk[..got], &mut self.buf)?;
            }
        }
    }
}

impl<T: ReadTransform> StageRead for TransformReader<T> {
    fn available(&self) -> usize {
        self.buf.buffered() + self.inner.available()
    }
}

impl<T: ReadTransform> Drop for TransformReader<T> {
    fn drop(&mut self) {
        // The chunk held upstream bytes; for the outermost stage that is
        // recovered plaintext.
        self.chunk.zeroize();
    }
}

/// Constant-time tag comparison to keep verification timing flat.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Deferred MAC verification cell, shared between the MAC stage and the
/// digest stage of one decode pipeline.
#[derive(Default)]
pub struct MacCheck {
    parked: Option<(Box<dyn MacEngine>, Vec<u8>)>,
    digest_linked: bool,
}

impl MacCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire the digest stage in; the MAC will then wait for the digest tag
    /// instead of verifying at its own finalize.
    pub fn link_digest(&mut self) {
        self.digest_linked = true;
    }

    fn settle(&mut self, mut engine: Box<dyn MacEngine>, expected: Vec<u8>) -> Result<()> {
        if self.digest_linked {
            self.parked = Some((engine, expected));
            return Ok(());
        }
        let tag = engine.finish();
        if !ct_eq(&tag, &expected) {
            return Err(LaminaError::Verification("MAC tag mismatch".into()));
        }
        Ok(())
    }

    fn complete(&mut self, digest_tag: &[u8]) -> Result<()> {
        if let Some((mut engine, expected)) = self.parked.take() {
            engine.update(digest_tag);
            let tag = engine.finish();
            if !ct_eq(&tag, &expected) {
                return Err(LaminaError::Verification("MAC tag mismatch".into()));
            }
        }
        Ok(())
    }
}

/// MAC stage, read direction: observes the raw bytes unchanged while
/// recomputing the keyed tag.
pub struct MacObserve {
    engine: Option<Box<dyn MacEngine>>,
    expected: Vec<u8>,
    data_length: Option<u64>,
    seen: u64,
    check: Arc<Mutex<MacCheck>>,
}

impl MacObserve {
    pub fn new(
        engine: Box<dyn MacEngine>,
        expected: Vec<u8>,
        data_length: Option<u64>,
        check: Arc<Mutex<MacCheck>>,
    ) -> Self {
        Self {
            engine: Some(engine),
            expected,
            data_length,
            seen: 0,
            check,
        }
    }
}

impl ReadTransform for MacObserve {
    fn output_len(&self, input_len: usize) -> usize {
        input_len
    }

    fn process(&mut self, input: &[u8], out: &mut ProcessedBuffer) -> Result<()> {
        let engine = self.engine.as_mut().expect("finish not yet called");
        engine.update(input);
        self.seen += input.len() as u64;
        let dst = out.refill(input.len());
        dst.copy_from_slice(input);
        out.commit(input.len());
        Ok(())
    }

    fn finish(&mut self, _out: &mut ProcessedBuffer) -> Result<()> {
        if let Some(expected_len) = self.data_length {
            if self.seen != expected_len {
                return Err(LaminaError::Verification(format!(
                    "MAC stage saw {} bytes, descriptor recorded {}",
                    self.seen, expected_len
                )));
            }
        }
        let engine = self.engine.take().expect("finish called once");
        let expected = std::mem::take(&mut self.expected);
        self.check.lock().expect("cell lock").settle(engine, expected)
    }
}

/// CTR or stream-cipher decryption: length-preserving keystream XOR.
pub struct Keystream {
    engine: Box<dyn StreamEngine>,
}

impl Keystream {
    pub fn new(engine: Box<dyn StreamEngine>) -> Self {
        Self { engine }
    }
}

impl ReadTransform for Keystream {
    fn output_len(&self, input_len: usize) -> usize {
        input_len
    }

    fn process(&mut self, input: &[u8], out: &mut ProcessedBuffer) -> Result<()> {
        let dst = out.refill(input.len());
        dst.copy_from_slice(input);
        self.engine.apply_keystream(dst);
        out.commit(input.len());
        Ok(())
    }

    fn finish(&mut self, _out: &mut ProcessedBuffer) -> Result<()> {
        Ok(())
    }
}

/// ECB decryption. A padded stage holds the trailing ciphertext block back
/// until EOF so the padding can be stripped; an unpadded stage requires the
/// stream to end on a block boundary.
pub struct EcbDecrypt {
    engine: Box<dyn BlockEngine>,
    padded: bool,
    pending: Zeroizing<Vec<u8>>,
}

impl EcbDecrypt {
    pub fn new(engine: Box<dyn BlockEngine>, padded: bool) -> Self {
        Self {
            engine,
            padded,
            pending: Zeroizing::new(Vec::new()),
        }
    }
}

impl ReadTransform for EcbDecrypt {
    fn output_len(&self, input_len: usize) -> usize {
        self.pending.len() + input_len
    }

    fn process(&mut self, input: &[u8], out: &mut ProcessedBuffer) -> Result<()> {
        self.pending.extend_from_slice(input);
        let bs = self.engine.block_len();
        let mut emit = (self.pending.len() / bs) * bs;
        // Keep the final block for finish when padding must be stripped
        if self.padded && emit > 0 && emit == self.pending.len() {
            emit -= bs;
        }
        if emit == 0 {
            out.refill(0);
            out.commit(0);
            return Ok(());
        }
        let dst = out.refill(emit);
        dst.copy_from_slice(&self.pending[..emit]);
        for block in dst.chunks_mut(bs) {
            self.engine.decrypt_block(block);
        }
        out.commit(emit);
        self.pending.drain(..emit);
        Ok(())
    }

    fn finish(&mut self, out: &mut ProcessedBuffer) -> Result<()> {
        let bs = self.engine.block_len();
        if !self.padded {
            if !self.pending.is_empty() {
                return Err(LaminaError::Protocol(
                    "ciphertext does not end on a block boundary".into(),
                ));
            }
            return Ok(());
        }
        if self.pending.len() != bs {
            return Err(LaminaError::Protocol(
                "padded ciphertext is missing its final block".into(),
            ));
        }
        let dst = out.refill(bs);
        dst.copy_from_slice(&self.pending);
        self.engine.decrypt_block(dst);
        let pad = dst[bs - 1] as usize;
        if pad == 0 || pad > bs || dst[bs - pad..].iter().any(|&b| b as usize != pad) {
            return Err(LaminaError::Protocol("invalid block padding".into()));
        }
        out.commit(bs - pad);
        self.pending.clear();
        Ok(())
    }
}

/// Digest stage, read direction: observes recovered plaintext, then checks
/// the recomputed tag against the stored one and completes any deferred
/// MAC verification.
pub struct DigestVerify {
    engine: Box<dyn DigestEngine>,
    expected: Vec<u8>,
    data_length: Option<u64>,
    seen: u64,
    mac_check: Option<Arc<Mutex<MacCheck>>>,
}

impl DigestVerify {
    pub fn new(
        engine: Box<dyn DigestEngine>,
        expected: Vec<u8>,
        data_length: Option<u64>,
        mac_check: Option<Arc<Mutex<MacCheck>>>,
    ) -> Self {
        Self {
            engine,
            expected,
            data_length,
            seen: 0,
            mac_check,
        }
    }
}

impl ReadTransform for DigestVerify {
    fn output_len(&self, input_len: usize) -> usize {
        input_len
    }

    fn process(&mut self, input: &[u8], out: &mut ProcessedBuffer) -> Result<()> {
        self.engine.update(input);
        self.seen += input.len() as u64;
        let dst = out.refill(input.len());
        dst.copy_from_slice(input);
        out.commit(input.len());
        Ok(())
    }

    fn finish(&mut self, _out: &mut ProcessedBuffer) -> Result<()> {
        if let Some(expected_len) = self.data_length {
            if self.seen != expected_len {
                return Err(LaminaError::Verification(format!(
                    "digest stage saw {} bytes, descriptor recorded {}",
                    self.seen, expected_len
                )));
            }
        }
        let tag = self.engine.finish();
        if !ct_eq(&tag, &self.expected) {
            return Err(LaminaError::Verification("digest tag mismatch".into()));
        }
        if let Some(check) = &self.mac_check {
            check.lock().expect("cell lock").complete(&tag)?;
        }
        Ok(())
    }
}
