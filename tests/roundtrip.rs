use lamina::{
    analyze, build_decode_pipeline, build_encode_pipeline, decode_descriptors,
    encode_descriptors, EncodeOptions, IdManager, IdObfuscator, KeySet, StageDescriptor,
    StageKind,
};
use lamina::factory::create_digest;
use lamina::spec::AlgorithmSpec;
use proptest::prelude::*;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn encode(
    plaintext: &[u8],
    options: &EncodeOptions,
    key_set: &KeySet,
) -> (Vec<u8>, Vec<StageDescriptor>) {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = build_encode_pipeline(
        Box::new(SharedSink(captured.clone())),
        options,
        &IdManager,
    )
    .expect("encode pipeline should build");
    pipeline
        .write_bytes(plaintext)
        .expect("write should succeed");
    pipeline.close().expect("close should succeed");
    let descriptors =
        analyze(&pipeline, key_set, &IdObfuscator).expect("analyze should succeed");
    let ciphertext = captured.lock().unwrap().clone();
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

fn pseudorandom(len: usize) -> Vec<u8> {
    let mut state = 0x2545F4914F6CDD1Du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 32) as u8
        })
        .collect()
}

#[test]
fn roundtrip_across_shapes_and_sizes() {
    let key_set = KeySet::new(b"integration master secret");
    let plaintexts: [Vec<u8>; 5] = [
        Vec::new(),
        vec![0x7F],
        vec![0xAB; 16],
        vec![0x00; 16 * 40],
        pseudorandom(10_000),
    ];
    for cascade_len in [0usize, 1, 3] {
        for compress in [false, true] {
            for plaintext in &plaintexts {
                let options = EncodeOptions {
                    compress,
                    cascade_len,
                    key_len: 32,
                };
                let (ciphertext, descriptors) = encode(plaintext, &options, &key_set);
                let restored = decode(ciphertext, &descriptors, &key_set).unwrap_or_else(|e| {
                    panic!(
                        "decode failed for len={} cascade={} compress={}: {}",
                        plaintext.len(),
                        cascade_len,
                        compress,
                        e
                    )
                });
                assert_eq!(&restored, plaintext);
            }
        }
    }
}

#[test]
fn roundtrip_through_persisted_descriptors() {
    let key_set = KeySet::new(b"persisted secret");
    let plaintext = pseudorandom(4096);
    let (ciphertext, descriptors) = encode(&plaintext, &EncodeOptions::default(), &key_set);

    let persisted = encode_descriptors(&descriptors).expect("descriptor list should encode");
    let reloaded = decode_descriptors(&persisted).expect("descriptor list should parse");
    assert_eq!(reloaded, descriptors);

    let restored = decode(ciphertext, &reloaded, &key_set).expect("decode should succeed");
    assert_eq!(restored, plaintext);
}

#[test]
fn roundtrip_over_files() {
    let dir = tempdir().expect("tempdir");
    let data_path = dir.path().join("payload.bin");
    let meta_path = dir.path().join("payload.meta");

    let key_set = KeySet::new(b"file-backed secret");
    let plaintext = pseudorandom(64 * 1024);

    let sink = fs::File::create(&data_path).expect("create data file");
    let mut pipeline = build_encode_pipeline(
        Box::new(sink),
        &EncodeOptions {
            compress: true,
            cascade_len: 2,
            key_len: 32,
        },
        &IdManager,
    )
    .expect("encode pipeline should build");
    for chunk in plaintext.chunks(1000) {
        pipeline.write_bytes(chunk).expect("chunked write");
    }
    pipeline.close().expect("close");
    let descriptors = analyze(&pipeline, &key_set, &IdObfuscator).expect("analyze");
    fs::write(&meta_path, encode_descriptors(&descriptors).unwrap()).expect("write metadata");

    let reloaded = decode_descriptors(&fs::read(&meta_path).unwrap()).expect("parse metadata");
    let source = fs::File::open(&data_path).expect("open data file");
    let mut reader = build_decode_pipeline(&reloaded, Box::new(source), &key_set, &IdObfuscator)
        .expect("decode pipeline should build");
    let mut restored = Vec::new();
    reader.read_to_end(&mut restored).expect("read back");
    assert_eq!(restored, plaintext);
}

#[test]
fn minimal_pipeline_descriptor_layout() {
    let key_set = KeySet::new(b"layout secret");
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

    let digest = &descriptors[2];
    assert_eq!(digest.data_length, Some(11));

    // The stored value is the finished tag over the plaintext, recomputable
    // with the algorithm the descriptor names.
    let spec = match IdObfuscator.id_to_spec(digest.algorithm_id) {
        Ok(AlgorithmSpec::Digest(spec)) => spec,
        other => panic!("digest descriptor resolved to {:?}", other),
    };
    let mut engine = create_digest(spec);
    engine.update(b"DigestInput");
    assert_eq!(digest.stored_value.as_deref(), Some(&engine.finish()[..]));
    let mac = &descriptors[0];
    assert!(mac.wrapped_key.is_some());
    assert!(mac.init_vector.is_some());
    assert!(mac.stored_value.is_some());
}

#[test]
fn streamed_reads_match_bulk_read() {
    let key_set = KeySet::new(b"streamed secret");
    let plaintext = pseudorandom(30_000);
    let (ciphertext, descriptors) = encode(&plaintext, &EncodeOptions::default(), &key_set);

    let mut reader = build_decode_pipeline(
        &descriptors,
        Box::new(Cursor::new(ciphertext)),
        &key_set,
        &IdObfuscator,
    )
    .expect("decode pipeline should build");

    // Odd-sized read calls must reassemble the identical stream
    let mut restored = Vec::new();
    let mut buf = [0u8; 733];
    loop {
        let got = reader.read(&mut buf).expect("streamed read");
        if got == 0 {
            break;
        }
        restored.extend_from_slice(&buf[..got]);
    }
    assert_eq!(restored, plaintext);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn roundtrip_holds_for_arbitrary_payloads(
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
        cascade_len in 0usize..4,
        compress in any::<bool>(),
    ) {
        let key_set = KeySet::new(b"property secret");
        let options = EncodeOptions { compress, cascade_len, key_len: 32 };
        let (ciphertext, descriptors) = encode(&payload, &options, &key_set);
        let restored = decode(ciphertext, &descriptors, &key_set).unwrap();
        prop_assert_eq!(restored, payload);
    }
}
