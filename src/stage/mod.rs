pub mod lzma;
pub mod read;
pub mod write;

pub use lzma::LzmaReader;
pub use read::{
    DigestVerify, EcbDecrypt, Keystream, MacCheck, MacObserve, ReadTransform, SourceReader,
    StageRead, TransformReader,
};
pub use write::EncodeStage;
