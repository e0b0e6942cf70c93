//! Pipeline construction, introspection and rebuild.
//!
//! Encode chains are built in a fixed order, sink to caller:
//!
//! ```text
//! sink ← AuthMAC ← CTR ← [ECB cascade...] ← StreamCipher ← [Compress] ← Digest ← caller
//! ```
//!
//! Algorithm and key choices are delegated to the id manager and the key
//! material generators; this module only decides position and count. After
//! a pipeline is closed, `analyze` walks it into a descriptor list
//! (innermost stage first) and `build_decode_pipeline` later rebuilds the
//! mirrored reader chain from that list plus a key set.

use crate::descriptor::StageDescriptor;
use crate::error::{LaminaError, Result};
use crate::factory::{create_block_cipher, create_ctr, create_digest, create_mac,
    create_stream_cipher};
use crate::ids::{IdManager, IdObfuscator};
use crate::keyset::{generate_iv, generate_key, KeySet};
use crate::spec::{AlgorithmSpec, StageKind, REFERENCE_BLOCK_LEN};
use crate::stage::write::CipherMode;
use crate::stage::{
    DigestVerify, EcbDecrypt, EncodeStage, Keystream, LzmaReader, MacCheck, MacObserve,
    SourceReader, StageRead, TransformReader,
};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

/// Knobs for one encode session. The cascade length is the number of
/// block-cipher stages between the MAC and the stream cipher.
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub compress: bool,
    pub cascade_len: usize,
    pub key_len: usize,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            compress: false,
            cascade_len: 3,
            key_len: 32,
        }
    }
}

/// Build the write chain around `sink` and return the outermost stage.
/// Every stage draws a fresh key; nothing is wrapped until `analyze`.
pub fn build_encode_pipeline(
    sink: Box<dyn Write + Send>,
    options: &EncodeOptions,
    ids: &IdManager,
) -> Result<EncodeStage> {
    let mac_spec = ids.random_mac_spec(options.key_len)?;
    let mut stage = EncodeStage::mac(
        mac_spec,
        generate_key(mac_spec.key_len()),
        generate_iv(mac_spec.iv_len()),
        EncodeStage::sink(sink),
    )?;

    let cascade = ids.random_block_specs(options.key_len, options.cascade_len)?;
    for (index, spec) in cascade.iter().enumerate() {
        let key = generate_key(spec.key_len());
        stage = if index == 0 {
            EncodeStage::cipher_ctr(*spec, key, generate_iv(spec.iv_len()), stage)?
        } else {
            // Padding is suppressed for interior reference-width entries;
            // the outermost padded entry block-aligns the whole cascade.
            let padded = index == cascade.len() - 1 || spec.block_len() != REFERENCE_BLOCK_LEN;
            EncodeStage::cipher_ecb(*spec, key, padded, stage)?
        };
    }

    let stream_spec = ids.random_stream_spec(options.key_len)?;
    stage = EncodeStage::cipher_stream(
        stream_spec,
        generate_key(stream_spec.key_len()),
        generate_iv(stream_spec.iv_len()),
        stage,
    )?;

    if options.compress {
        stage = EncodeStage::compress(stage);
    }

    Ok(EncodeStage::digest(ids.random_digest_spec(), stage))
}

/// Walk a finalized encode chain into its descriptor list. The walk runs
/// outermost to innermost and prepends, so the stored order is innermost
/// first — the order `build_decode_pipeline` consumes. The sink is the
/// boundary, not an error.
pub fn analyze(
    pipeline: &EncodeStage,
    key_set: &KeySet,
    obfuscator: &IdObfuscator,
) -> Result<Vec<StageDescriptor>> {
    let mut descriptors = Vec::new();
    let mut current = pipeline;
    loop {
        match current {
            EncodeStage::Digest(s) => {
                descriptors.insert(
                    0,
                    StageDescriptor {
                        kind: StageKind::Digest,
                        algorithm_id: obfuscator.spec_to_id(AlgorithmSpec::Digest(s.spec)),
                        wrapped_key: None,
                        init_vector: None,
                        stored_value: Some(captured_tag(&s.tag)?),
                        data_length: Some(s.data_len),
                    },
                );
            }
            EncodeStage::Mac(s) => {
                descriptors.insert(
                    0,
                    StageDescriptor {
                        kind: StageKind::Mac,
                        algorithm_id: obfuscator.spec_to_id(AlgorithmSpec::Mac(s.spec)),
                        wrapped_key: Some(key_set.wrap_key(&s.key)?),
                        init_vector: Some(s.iv.clone()),
                        stored_value: Some(captured_tag(&s.tag)?),
                        data_length: Some(s.data_len),
                    },
                );
            }
            EncodeStage::Cipher(s) => {
                let (kind, spec) = match &s.mode {
                    CipherMode::Stream { spec, .. } => {
                        (StageKind::CipherStream, AlgorithmSpec::Stream(*spec))
                    }
                    CipherMode::Ctr { spec, .. } | CipherMode::Ecb { spec, .. } => {
                        (StageKind::CipherBlock, AlgorithmSpec::Block(*spec))
                    }
                };
                descriptors.insert(
                    0,
                    StageDescriptor {
                        kind,
                        algorithm_id: obfuscator.spec_to_id(spec),
                        wrapped_key: Some(key_set.wrap_key(&s.key)?),
                        init_vector: s.iv.clone(),
                        stored_value: None,
                        data_length: None,
                    },
                );
            }
            EncodeStage::Compress(_) => {
                descriptors.insert(
                    0,
                    StageDescriptor {
                        kind: StageKind::Compress,
                        algorithm_id: 0,
                        wrapped_key: None,
                        init_vector: None,
                        stored_value: None,
                        data_length: None,
                    },
                );
            }
            EncodeStage::Sink(_) => break,
        }
        current = current.inner().expect("non-sink stages wrap an inner stage");
    }
    Ok(descriptors)
}

/// Rebuild the mirrored read chain from stored descriptors. Iterates in
/// stored order, wrapping the chain built so far; the MAC stage is
/// remembered so a later digest descriptor can be wired to it for deferred
/// verification.
pub fn build_decode_pipeline(
    descriptors: &[StageDescriptor],
    source: Box<dyn Read + Send>,
    key_set: &KeySet,
    obfuscator: &IdObfuscator,
) -> Result<Box<dyn StageRead>> {
    let last_block_stage = descriptors
        .iter()
        .rposition(|d| d.kind == StageKind::CipherBlock);

    let mut reader: Box<dyn StageRead> = Box::new(SourceReader::new(source));
    let mut mac_check: Option<Arc<Mutex<MacCheck>>> = None;
    let mut block_stages_seen = 0usize;

    for (index, descriptor) in descriptors.iter().enumerate() {
        match descriptor.kind {
            StageKind::Mac => {
                let spec = match obfuscator.id_to_spec(descriptor.algorithm_id)? {
                    AlgorithmSpec::Mac(spec) => spec,
                    _ => return Err(kind_mismatch(descriptor)),
                };
                let key = key_set.unwrap_key(
                    required(&descriptor.wrapped_key, "wrapped key")?,
                    AlgorithmSpec::Mac(spec),
                )?;
                let iv = required(&descriptor.init_vector, "init vector")?;
                let expected = required(&descriptor.stored_value, "stored value")?.to_vec();
                let engine = create_mac(spec, &key, iv)?;
                let check = Arc::new(Mutex::new(MacCheck::new()));
                mac_check = Some(check.clone());
                reader = Box::new(TransformReader::new(
                    MacObserve::new(engine, expected, descriptor.data_length, check),
                    reader,
                ));
            }
            StageKind::CipherBlock => {
                let spec = match obfuscator.id_to_spec(descriptor.algorithm_id)? {
                    AlgorithmSpec::Block(spec) => spec,
                    _ => return Err(kind_mismatch(descriptor)),
                };
                let key = key_set.unwrap_key(
                    required(&descriptor.wrapped_key, "wrapped key")?,
                    AlgorithmSpec::Block(spec),
                )?;
                reader = if block_stages_seen == 0 {
                    let iv = required(&descriptor.init_vector, "init vector")?;
                    let engine = create_ctr(spec, &key, iv)?;
                    Box::new(TransformReader::new(Keystream::new(engine), reader))
                } else {
                    // Same position rule the encode side applied
                    let padded = Some(index) == last_block_stage
                        || spec.block_len() != REFERENCE_BLOCK_LEN;
                    let engine = create_block_cipher(spec, &key)?;
                    Box::new(TransformReader::new(EcbDecrypt::new(engine, padded), reader))
                };
                block_stages_seen += 1;
            }
            StageKind::CipherStream => {
                let spec = match obfuscator.id_to_spec(descriptor.algorithm_id)? {
                    AlgorithmSpec::Stream(spec) => spec,
                    _ => return Err(kind_mismatch(descriptor)),
                };
                let key = key_set.unwrap_key(
                    required(&descriptor.wrapped_key, "wrapped key")?,
                    AlgorithmSpec::Stream(spec),
                )?;
                let iv = required(&descriptor.init_vector, "init vector")?;
                let engine = create_stream_cipher(spec, &key, iv)?;
                reader = Box::new(TransformReader::new(Keystream::new(engine), reader));
            }
            StageKind::Compress => {
                reader = Box::new(LzmaReader::new(reader));
            }
            StageKind::Digest => {
                let spec = match obfuscator.id_to_spec(descriptor.algorithm_id)? {
                    AlgorithmSpec::Digest(spec) => spec,
                    _ => return Err(kind_mismatch(descriptor)),
                };
                let expected = required(&descriptor.stored_value, "stored value")?.to_vec();
                if let Some(check) = &mac_check {
                    check.lock().expect("cell lock").link_digest();
                }
                reader = Box::new(TransformReader::new(
                    DigestVerify::new(
                        create_digest(spec),
                        expected,
                        descriptor.data_length,
                        mac_check.clone(),
                    ),
                    reader,
                ));
            }
        }
    }
    Ok(reader)
}

fn captured_tag(tag: &Option<Vec<u8>>) -> Result<Vec<u8>> {
    tag.clone().ok_or_else(|| {
        LaminaError::Protocol("pipeline introspected before it was closed".into())
    })
}

fn required<'a>(field: &'a Option<Vec<u8>>, what: &str) -> Result<&'a [u8]> {
    field
        .as_deref()
        .ok_or_else(|| LaminaError::Protocol(format!("descriptor missing {}", what)))
}

fn kind_mismatch(descriptor: &StageDescriptor) -> LaminaError {
    LaminaError::Protocol(format!(
        "algorithm id {} does not belong to stage kind {:?}",
        descriptor.algorithm_id, descriptor.kind
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(
        plaintext: &[u8],
        options: &EncodeOptions,
        key_set: &KeySet,
    ) -> (Vec<u8>, Vec<StageDescriptor>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let ids = IdManager;
        let mut pipeline =
            build_encode_pipeline(Box::new(Shared(sink.clone())), options, &ids).unwrap();
        pipeline.write_bytes(plaintext).unwrap();
        pipeline.close().unwrap();
        let descriptors = analyze(&pipeline, key_set, &IdObfuscator).unwrap();
        let ciphertext = sink.lock().unwrap().clone();
        (ciphertext, descriptors)
    }

    fn decode(
        ciphertext: Vec<u8>,
        descriptors: &[StageDescriptor],
        key_set: &KeySet,
    ) -> std::io::Result<Vec<u8>> {
        let mut reader = build_decode_pipeline(
            descriptors,
            Box::new(Cursor::new(ciphertext)),
            key_set,
            &IdObfuscator,
        )
        .map_err(std::io::Error::from)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_descriptor_order_minimal_pipeline() {
        let key_set = KeySet::new(b"master");
        let options = EncodeOptions {
            compress: false,
            cascade_len: 0,
            key_len: 32,
        };
        let (_, descriptors) = encode(b"DigestInput", &options, &key_set);
        let kinds: Vec<StageKind> = descriptors.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![StageKind::Mac, StageKind::CipherStream, StageKind::Digest]
        );
        assert_eq!(descriptors[2].data_length, Some(11));
    }

    #[test]
    fn test_full_chain_descriptor_order() {
        let key_set = KeySet::new(b"master");
        let options = EncodeOptions {
            compress: true,
            cascade_len: 3,
            key_len: 32,
        };
        let (_, descriptors) = encode(b"layout check", &options, &key_set);
        let kinds: Vec<StageKind> = descriptors.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::Mac,
                StageKind::CipherBlock,
                StageKind::CipherBlock,
                StageKind::CipherBlock,
                StageKind::CipherStream,
                StageKind::Compress,
                StageKind::Digest,
            ]
        );
        // CTR entry carries an init vector, interior ECB entries do not
        assert!(descriptors[1].init_vector.is_some());
        assert!(descriptors[2].init_vector.is_none());
        assert!(descriptors[3].init_vector.is_none());
    }

    #[test]
    fn test_analyze_before_close_is_protocol_error() {
        let key_set = KeySet::new(b"master");
        let ids = IdManager;
        let pipeline = build_encode_pipeline(
            Box::new(std::io::sink()),
            &EncodeOptions::default(),
            &ids,
        )
        .unwrap();
        let err = analyze(&pipeline, &key_set, &IdObfuscator).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_roundtrip_one_cipher_layer() {
        let key_set = KeySet::new(b"master");
        let options = EncodeOptions {
            compress: false,
            cascade_len: 1,
            key_len: 32,
        };
        let plaintext = b"eleven bytes plus some more text";
        let (ciphertext, descriptors) = encode(plaintext, &options, &key_set);
        assert_eq!(decode(ciphertext, &descriptors, &key_set).unwrap(), plaintext);
    }

    #[test]
    fn test_decode_with_wrong_key_set_fails() {
        let key_set = KeySet::new(b"master");
        let (ciphertext, descriptors) =
            encode(b"secret", &EncodeOptions::default(), &key_set);
        let other = KeySet::new(b"not the master");
        assert!(decode(ciphertext, &descriptors, &other).is_err());
    }
}
