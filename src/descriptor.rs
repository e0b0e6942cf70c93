//! Persisted stage descriptors and their binary encoding.
//!
//! A pipeline is stored as an ordered descriptor list, innermost stage
//! first. The encoding is little-endian with length-prefixed byte fields
//! and must round-trip exactly:
//!
//! ```text
//! list:       [count: u16][descriptor...]
//! descriptor: [packed_id: u32]
//!             [wrapped_key: u16 len + bytes]
//!             [init_vector: u16 len + bytes]
//!             [stored_value: u16 len + bytes]
//!             [has_data_length: u8][data_length: u64, if flagged]
//! ```
//!
//! `packed_id` is `(algorithm_id << NIBBLE_WIDTH) | kind`, reversible and
//! never zero because stage kind ids start at 1.

use crate::error::{LaminaError, Result};
use crate::spec::StageKind;

/// Bits the stage kind occupies in the packed external id
pub const NIBBLE_WIDTH: u32 = 4;

/// Everything needed to rebuild one decode stage. Immutable once built,
/// either by `pipeline::analyze` or by parsing persisted bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub kind: StageKind,
    /// Obfuscated algorithm id; zero for Compress
    pub algorithm_id: u32,
    /// Key material sealed by the key set; Mac and Cipher kinds only
    pub wrapped_key: Option<Vec<u8>>,
    /// Nonce/salt for nonce-based primitives
    pub init_vector: Option<Vec<u8>>,
    /// Finished Digest/Mac tag captured at encode time
    pub stored_value: Option<Vec<u8>>,
    /// Plaintext byte count a Digest/Mac stage processed
    pub data_length: Option<u64>,
}

impl StageDescriptor {
    pub fn packed_id(&self) -> u32 {
        (self.algorithm_id << NIBBLE_WIDTH) | self.kind.id()
    }

    pub fn unpack_id(packed: u32) -> Result<(StageKind, u32)> {
        let kind = StageKind::from_id(packed & ((1 << NIBBLE_WIDTH) - 1))?;
        Ok((kind, packed >> NIBBLE_WIDTH))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.packed_id().to_le_bytes());
        encode_field(out, self.wrapped_key.as_deref());
        encode_field(out, self.init_vector.as_deref());
        encode_field(out, self.stored_value.as_deref());
        match self.data_length {
            Some(len) => {
                out.push(1);
                out.extend_from_slice(&len.to_le_bytes());
            }
            None => out.push(0),
        }
    }

    pub fn decode(input: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(input);
        let packed = u32::from_le_bytes(cursor.read_array()?);
        let (kind, algorithm_id) = Self::unpack_id(packed)?;
        let wrapped_key = decode_field(&mut cursor)?;
        let init_vector = decode_field(&mut cursor)?;
        let stored_value = decode_field(&mut cursor)?;
        let data_length = match cursor.read_array::<1>()?[0] {
            0 => None,
            1 => Some(u64::from_le_bytes(cursor.read_array()?)),
            flag => {
                return Err(LaminaError::Protocol(format!(
                    "invalid data-length flag {}",
                    flag
                )))
            }
        };
        Ok((
            Self {
                kind,
                algorithm_id,
                wrapped_key,
                init_vector,
                stored_value,
                data_length,
            },
            cursor.consumed(),
        ))
    }
}

/// Serialize a full descriptor list in stored order.
pub fn encode_descriptors(descriptors: &[StageDescriptor]) -> Result<Vec<u8>> {
    if descriptors.len() > u16::MAX as usize {
        return Err(LaminaError::Protocol("too many descriptors".into()));
    }
    let mut out = Vec::new();
    out.extend_from_slice(&(descriptors.len() as u16).to_le_bytes());
    for descriptor in descriptors {
        descriptor.encode(&mut out);
    }
    Ok(out)
}

/// Parse a full descriptor list; truncated or trailing bytes are protocol
/// errors, never silently tolerated.
pub fn decode_descriptors(input: &[u8]) -> Result<Vec<StageDescriptor>> {
    let mut cursor = Cursor::new(input);
    let count = u16::from_le_bytes(cursor.read_array()?) as usize;
    let mut descriptors = Vec::with_capacity(count);
    for _ in 0..count {
        let (descriptor, used) = StageDescriptor::decode(cursor.rest())?;
        cursor.skip(used);
        descriptors.push(descriptor);
    }
    if !cursor.rest().is_empty() {
        return Err(LaminaError::Protocol(
            "trailing bytes after descriptor list".into(),
        ));
    }
    Ok(descriptors)
}

fn encode_field(out: &mut Vec<u8>, field: Option<&[u8]>) {
    let bytes = field.unwrap_or(&[]);
    debug_assert!(bytes.len() <= u16::MAX as usize);
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn decode_field(cursor: &mut Cursor<'_>) -> Result<Option<Vec<u8>>> {
    let len = u16::from_le_bytes(cursor.read_array()?) as usize;
    if len == 0 {
        return Ok(None);
    }
    Ok(Some(cursor.read_bytes(len)?.to_vec()))
}

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.input.len() - self.pos < n {
            return Err(LaminaError::Protocol("truncated descriptor".into()));
        }
        let bytes = &self.input[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn rest(&self) -> &'a [u8] {
        &self.input[self.pos..]
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn consumed(&self) -> usize {
        self.pos
    }
}
