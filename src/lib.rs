//! lamina: a composable, self-describing stream codec.
//!
//! Data written into an encode pipeline flows through a fixed stack of
//! stages before reaching the caller's sink:
//!
//! ```text
//!             caller
//!               │
//!           ┌───▼────┐   content digest over the plaintext
//!           │ Digest │
//!           └───┬────┘
//!           ┌───▼────┐   optional LZMA compression
//!           │Compress│
//!           └───┬────┘
//!           ┌───▼────┐   stream cipher (ChaCha20 family)
//!           │ Stream │
//!           └───┬────┘
//!           ┌───▼────┐   block-cipher cascade: one CTR entry,
//!           │Cascade │   the rest ECB with positional padding
//!           └───┬────┘
//!           ┌───▼────┐   keyed MAC over the final ciphertext
//!           │  MAC   │   and the digest tag
//!           └───┬────┘
//!               ▼
//!              sink
//! ```
//!
//! Algorithms and keys are drawn fresh for every pipeline. After `close`,
//! [`pipeline::analyze`] captures the chain as a list of
//! [`StageDescriptor`]s with every key sealed by a [`KeySet`]; the list
//! round-trips through [`encode_descriptors`]/[`decode_descriptors`] and
//! [`pipeline::build_decode_pipeline`] rebuilds the mirrored reader chain
//! from it. Decoding verifies the MAC tag, the digest tag and the recorded
//! plaintext length; any mismatch surfaces as a [`LaminaError`].

pub mod buffer;
pub mod descriptor;
pub mod error;
pub mod factory;
pub mod ids;
pub mod keyset;
pub mod pipeline;
pub mod spec;
pub mod stage;

pub use descriptor::{decode_descriptors, encode_descriptors, StageDescriptor};
pub use error::{LaminaError, Result};
pub use ids::{IdManager, IdObfuscator};
pub use keyset::KeySet;
pub use pipeline::{analyze, build_decode_pipeline, build_encode_pipeline, EncodeOptions};
pub use spec::StageKind;
pub use stage::{EncodeStage, StageRead};
