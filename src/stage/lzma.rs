//! Thread bridge for the blocking LZMA decoder.
//!
//! The decoder only offers a whole-stream `decode(source, sink)` call, so
//! the read-direction compress stage runs it on a worker thread writing
//! into an in-process byte pipe (a bounded channel). The foreground reader
//! drains the pipe; decode errors travel in-band and are re-raised on the
//! next read instead of being folded into EOF. Dropping the reader closes
//! the pipe, which unblocks and terminates a stuck worker, then joins it.
//!
//! From the outside this is an ordinary read stage; nothing else in the
//! pipeline knows it is concurrent internally.

use crate::stage::read::StageRead;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::{self, BufReader, Read, Write};
use std::thread::{self, JoinHandle};
use zeroize::Zeroize;

/// LZMA stream header: 1 properties byte, 4-byte dictionary size,
/// 8-byte unpacked size.
const LZMA_HEADER_LEN: usize = 13;

/// Largest valid value of the properties byte (lc/lp/pb packing)
const LZMA_PROPS_MAX: u8 = 224;

/// Chunks in flight between worker and reader
const PIPE_DEPTH: usize = 16;

pub struct LzmaReader {
    rx: Option<Receiver<io::Result<Vec<u8>>>>,
    worker: Option<JoinHandle<()>>,
    pending: Vec<u8>,
    pos: usize,
    /// Sticky decode failure, re-raised on every subsequent read
    failed: Option<(io::ErrorKind, String)>,
    eof: bool,
}

impl LzmaReader {
    pub fn new(inner: Box<dyn StageRead>) -> Self {
        let (tx, rx) = bounded(PIPE_DEPTH);
        let worker = thread::spawn(move || decode_worker(inner, tx));
        Self {
            rx: Some(rx),
            worker: Some(worker),
            pending: Vec::new(),
            pos: 0,
            failed: None,
            eof: false,
        }
    }

    fn record_failure(&mut self, err: &io::Error) {
        self.failed = Some((err.kind(), err.to_string()));
    }

    fn raise(&self) -> io::Error {
        let (kind, msg) = self.failed.as_ref().expect("failure recorded");
        io::Error::new(*kind, msg.clone())
    }

    fn join_worker(&mut self) -> io::Result<()> {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                let err = io::Error::other("LZMA worker thread panicked");
                self.record_failure(&err);
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Read for LzmaReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.failed.is_some() {
            return Err(self.raise());
        }
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.pending.len() {
                let n = out.len().min(self.pending.len() - self.pos);
                out[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            let rx = self.rx.as_ref().expect("pipe open until eof");
            match rx.recv() {
                Ok(Ok(chunk)) => {
                    self.pending.zeroize();
                    self.pending = chunk;
                    self.pos = 0;
                }
                Ok(Err(err)) => {
                    self.record_failure(&err);
                    self.rx = None;
                    let _ = self.join_worker();
                    return Err(err);
                }
                // Sender dropped: the worker finished cleanly
                Err(_) => {
                    self.eof = true;
                    self.rx = None;
                    self.join_worker()?;
                }
            }
        }
    }
}

impl StageRead for LzmaReader {
    fn available(&self) -> usize {
        self.pending.len() - self.pos
    }
}

impl Drop for LzmaReader {
    fn drop(&mut self) {
        // Closing the receive side makes the worker's next write fail,
        // so the join cannot hang on a still-decoding worker.
        self.rx = None;
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.pending.zeroize();
    }
}

fn decode_worker(mut inner: Box<dyn StageRead>, tx: Sender<io::Result<Vec<u8>>>) {
    if let Err(err) = run_decode(&mut inner, &tx) {
        // Receiver may already be gone; nothing more to surface then.
        let _ = tx.send(Err(err));
    }
}

fn run_decode(
    inner: &mut Box<dyn StageRead>,
    tx: &Sender<io::Result<Vec<u8>>>,
) -> io::Result<()> {
    let mut header = [0u8; LZMA_HEADER_LEN];
    inner.read_exact(&mut header).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "short read on LZMA properties header",
            )
        } else {
            err
        }
    })?;
    if header[0] > LZMA_PROPS_MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid LZMA properties byte 0x{:02x}", header[0]),
        ));
    }

    let mut source = BufReader::new(io::Cursor::new(header).chain(inner));
    let mut sink = PipeWriter { tx };
    lzma_rs::lzma_decompress(&mut source, &mut sink).map_err(|err| match err {
        lzma_rs::error::Error::IoError(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, format!("lzma: {:?}", other)),
    })?;
    Ok(())
}

struct PipeWriter<'a> {
    tx: &'a Sender<io::Result<Vec<u8>>>,
}

impl Write for PipeWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.tx.send(Ok(buf.to_vec())).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "decompressed-side reader closed",
            ));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::read::SourceReader;

    fn compressed(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut &data[..], &mut out).unwrap();
        out
    }

    fn bridge(bytes: Vec<u8>) -> LzmaReader {
        LzmaReader::new(Box::new(SourceReader::new(Box::new(io::Cursor::new(
            bytes,
        )))))
    }

    #[test]
    fn test_roundtrip_through_bridge() {
        let plain: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = bridge(compressed(&plain));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn test_empty_stream() {
        let mut reader = bridge(compressed(b""));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_short_header_is_decode_failure() {
        let mut reader = bridge(vec![0x5d, 0x00, 0x00]);
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_corrupt_stream_error_is_sticky() {
        let mut bytes = compressed(b"some payload worth corrupting");
        let last = bytes.len() - 1;
        bytes.truncate(last);
        let mut reader = bridge(bytes);
        assert!(reader.read_to_end(&mut Vec::new()).is_err());
        // Error is re-raised, not downgraded to EOF
        let mut buf = [0u8; 4];
        assert!(reader.read(&mut buf).is_err());
    }

    #[test]
    fn test_invalid_props_byte_rejected() {
        let mut bytes = compressed(b"data");
        bytes[0] = 0xFF;
        let err = reader_err(bytes);
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    fn reader_err(bytes: Vec<u8>) -> io::Error {
        bridge(bytes).read_to_end(&mut Vec::new()).unwrap_err()
    }

    #[test]
    fn test_drop_mid_stream_joins_worker() {
        let plain = vec![7u8; 1_000_000];
        let reader = bridge(compressed(&plain));
        // Dropping without draining must not hang
        drop(reader);
    }
}
