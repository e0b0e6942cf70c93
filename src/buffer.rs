//! Per-stage scratch buffers.
//!
//! A stage buffer is sized to whatever output length the active primitive
//! reports for the current input and only ever grows; retired allocations
//! may have held plaintext or key-derived material, so they are zeroed in
//! place before being released.

use std::mem;
use zeroize::Zeroize;

/// Grow-only scratch buffer
#[derive(Debug, Default)]
pub struct StageBuf {
    data: Vec<u8>,
}

impl StageBuf {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Make the buffer at least `needed` bytes long. Shrinking never
    /// happens; a too-small buffer is replaced and the old allocation is
    /// zeroed before it is dropped.
    pub fn ensure(&mut self, needed: usize) {
        if self.data.len() < needed {
            let mut retired = mem::replace(&mut self.data, vec![0u8; needed]);
            retired.zeroize();
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for StageBuf {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

/// Buffered output of one `process`/`finish` call on the read side.
/// `read_off <= data_len` always holds; the buffer is logically empty once
/// they are equal and must be refilled before further reads.
#[derive(Debug, Default)]
pub struct ProcessedBuffer {
    store: StageBuf,
    data_len: usize,
    read_off: usize,
}

impl ProcessedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_data(&self) -> bool {
        self.read_off < self.data_len
    }

    pub fn buffered(&self) -> usize {
        self.data_len - self.read_off
    }

    /// Pre-grow the backing store so upcoming refills up to `needed` bytes
    /// will not reallocate.
    pub fn reserve(&mut self, needed: usize) {
        self.store.ensure(needed);
    }

    /// Start a refill: grows the store to `needed` and hands out the
    /// writable region. Only valid when the buffer is drained.
    pub fn refill(&mut self, needed: usize) -> &mut [u8] {
        debug_assert!(!self.has_data(), "refill of a non-empty buffer");
        self.store.ensure(needed);
        self.data_len = 0;
        self.read_off = 0;
        &mut self.store.as_mut_slice()[..needed]
    }

    /// Mark `written` bytes of the last refill region as readable.
    pub fn commit(&mut self, written: usize) {
        debug_assert!(written <= self.store.len());
        self.data_len = written;
        self.read_off = 0;
    }

    /// Copy out up to `out.len()` buffered bytes.
    pub fn take(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buffered());
        out[..n].copy_from_slice(&self.store.as_slice()[self.read_off..self.read_off + n]);
        self.read_off += n;
        n
    }

    /// Discard up to `n` buffered bytes, returning how many were dropped.
    pub fn discard(&mut self, n: usize) -> usize {
        let dropped = n.min(self.buffered());
        self.read_off += dropped;
        dropped
    }

    pub fn store_len(&self) -> usize {
        self.store.len()
    }
}
