use crate::error::{LaminaError, Result};

/// Block length every cascade entry is measured against when deciding
/// whether an ECB stage needs padding (see `pipeline`).
pub const REFERENCE_BLOCK_LEN: usize = 16;

/// Digest algorithm options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestSpec {
    #[default]
    Sha3_256,
    Sha256,
    Blake3,
}

impl DigestSpec {
    /// Finished tag length in bytes
    pub fn tag_len(&self) -> usize {
        32
    }

    pub const ALL: [DigestSpec; 3] = [DigestSpec::Sha3_256, DigestSpec::Sha256, DigestSpec::Blake3];
}

/// Keyed MAC algorithm options. All are nonce-based: a fresh init vector is
/// absorbed before any stream data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MacSpec {
    #[default]
    HmacSha3_256,
    HmacSha256,
    Blake3Keyed,
}

impl MacSpec {
    pub fn tag_len(&self) -> usize {
        32
    }

    pub fn key_len(&self) -> usize {
        32
    }

    /// Init vector (salt) length in bytes
    pub fn iv_len(&self) -> usize {
        16
    }

    pub const ALL: [MacSpec; 3] = [
        MacSpec::HmacSha3_256,
        MacSpec::HmacSha256,
        MacSpec::Blake3Keyed,
    ];
}

/// Block cipher options for the cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockCipherSpec {
    #[default]
    Aes256,
    Aes128,
    Twofish,
}

impl BlockCipherSpec {
    pub fn key_len(&self) -> usize {
        match self {
            BlockCipherSpec::Aes256 => 32,
            BlockCipherSpec::Aes128 => 16,
            BlockCipherSpec::Twofish => 32,
        }
    }

    pub fn block_len(&self) -> usize {
        16
    }

    /// Counter-mode IV length (one cipher block)
    pub fn iv_len(&self) -> usize {
        self.block_len()
    }

    pub const ALL: [BlockCipherSpec; 3] = [
        BlockCipherSpec::Aes256,
        BlockCipherSpec::Aes128,
        BlockCipherSpec::Twofish,
    ];
}

/// Stream cipher options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamCipherSpec {
    #[default]
    XChaCha20,
    ChaCha20,
}

impl StreamCipherSpec {
    pub fn key_len(&self) -> usize {
        32
    }

    pub fn iv_len(&self) -> usize {
        match self {
            StreamCipherSpec::XChaCha20 => 24,
            StreamCipherSpec::ChaCha20 => 12,
        }
    }

    pub const ALL: [StreamCipherSpec; 2] = [StreamCipherSpec::XChaCha20, StreamCipherSpec::ChaCha20];
}

/// Any algorithm spec a stage descriptor can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmSpec {
    Digest(DigestSpec),
    Mac(MacSpec),
    Block(BlockCipherSpec),
    Stream(StreamCipherSpec),
}

/// The closed set of stage kinds. Wire ids are fixed, nonzero and fit a
/// nibble so the packed external id is never ambiguous with zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Digest,
    Mac,
    CipherBlock,
    CipherStream,
    Compress,
}

impl StageKind {
    pub fn id(&self) -> u32 {
        match self {
            StageKind::Digest => 1,
            StageKind::Mac => 2,
            StageKind::CipherBlock => 3,
            StageKind::CipherStream => 4,
            StageKind::Compress => 5,
        }
    }

    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            1 => Ok(StageKind::Digest),
            2 => Ok(StageKind::Mac),
            3 => Ok(StageKind::CipherBlock),
            4 => Ok(StageKind::CipherStream),
            5 => Ok(StageKind::Compress),
            other => Err(LaminaError::Protocol(format!(
                "unknown stage kind id {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ids_are_nonzero_nibbles() {
        for kind in [
            StageKind::Digest,
            StageKind::Mac,
            StageKind::CipherBlock,
            StageKind::CipherStream,
            StageKind::Compress,
        ] {
            let id = kind.id();
            assert!(id >= 1 && id <= 5);
            assert_eq!(StageKind::from_id(id).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind_is_protocol_error() {
        for id in [0u32, 6, 15, 255] {
            assert!(StageKind::from_id(id).unwrap_err().is_protocol());
        }
    }

    #[test]
    fn test_key_lengths() {
        assert_eq!(BlockCipherSpec::Aes128.key_len(), 16);
        assert_eq!(BlockCipherSpec::Aes256.key_len(), 32);
        assert_eq!(BlockCipherSpec::Twofish.key_len(), 32);
        for spec in StreamCipherSpec::ALL {
            assert_eq!(spec.key_len(), 32);
        }
    }
}
