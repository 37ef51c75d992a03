//! Test utilities for bfstripe-rs
// Fixture records, stripe-encrypted payloads and temp files shared by unit tests,
// integration tests and benchmarks. Built only for tests or with the `testlib` feature.

use std::io::Write;

use serde_json::json;
use tempfile::NamedTempFile;

use crate::cipher::{encrypt_block, is_encrypted_position};
use crate::keys::DecryptionKey;
use crate::metadata::{AlbumMetadata, TrackMetadata};
use crate::transport::BLOCK_SIZE;

/// Track record used throughout the tests
pub fn sample_track() -> TrackMetadata {
    TrackMetadata::from_value(json!({
        "SNG_ID": "12345",
        "TRACK_TOKEN": "token-12345",
        "SNG_TITLE": "Foo",
        "ART_NAME": "Bar",
        "ALB_TITLE": "Baz",
        "ALB_PICTURE": "cover-1",
        "TRACK_NUMBER": "3",
        "DURATION": "200",
        "FILESIZE_MP3_320": "6144",
    }))
}

pub fn sample_album() -> AlbumMetadata {
    AlbumMetadata::from_value(json!({
        "TRACKS": "10",
        "LABEL_NAME": "Lbl",
        "PHYSICAL_RELEASE_DATE": "2008-11-21",
    }))
}

/// Plaintext body with a recognisable byte pattern
pub fn plain_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Apply the stripe pattern to a plaintext body, producing what a stream source serves.
pub fn stripe_encrypt(plain: &[u8], key: &DecryptionKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(plain.len());
    for (position, block) in plain.chunks(BLOCK_SIZE).enumerate() {
        let mut block = block.to_vec();
        if is_encrypted_position(position as u64, block.len()) {
            encrypt_block(key, &mut block).unwrap();
        }
        out.extend_from_slice(&block);
    }
    out
}

/// Write bytes to a fresh temp file
pub fn create_payload_file(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

/// Smallest stream the FLAC tagger accepts: marker plus a single STREAMINFO block.
pub fn minimal_flac() -> Vec<u8> {
    let mut out = Vec::with_capacity(42);
    out.extend_from_slice(b"fLaC");
    // last-block flag | type 0 (STREAMINFO), length 34
    out.extend_from_slice(&[0x80, 0x00, 0x00, 0x22]);
    // min/max block size 4096
    out.extend_from_slice(&[0x10, 0x00, 0x10, 0x00]);
    // min/max frame size unknown
    out.extend_from_slice(&[0x00; 6]);
    // 44100 Hz, 2 channels, 16 bits per sample, 0 samples
    out.extend_from_slice(&[0x0A, 0xC4, 0x42, 0xF0, 0x00, 0x00, 0x00, 0x00]);
    // MD5 of the unencoded audio
    out.extend_from_slice(&[0x00; 16]);
    out
}
