//! Partial-block cipher filter
//!
//! Payloads are striped: every third 2048-byte block (positions 0, 3, 6, ...) is
//! Blowfish-CBC encrypted with the track key and a fixed IV, everything else is
//! plaintext. Each encrypted block is an independent CBC run; no chaining state is
//! carried from one block to the next. A short trailing block is never encrypted.

use blowfish::Blowfish;
use bytes::Bytes;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit};
use futures::stream::{Stream, StreamExt};
use thiserror::Error;

use crate::keys::DecryptionKey;
use crate::transport::{TransportError, BLOCK_SIZE};

/// IV used for every encrypted block
const STRIPE_IV: [u8; 8] = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];

/// Every `STRIPE_PERIOD`-th block is encrypted
pub const STRIPE_PERIOD: u64 = 3;

type BfCbcDec = cbc::Decryptor<Blowfish>;
type BfCbcEnc = cbc::Encryptor<Blowfish>;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Malformed encrypted chunk: {len} bytes is not a multiple of the cipher block size")]
    MalformedChunk { len: usize },
    #[error("Invalid key")]
    InvalidKey,
}

/// Errors surfaced while pulling decrypted blocks out of a stream
#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("Stream error at block {position}: {source}")]
    Transport {
        position: u64,
        #[source]
        source: TransportError,
    },
    #[error("Cipher error at block {position}: {source}")]
    Cipher {
        position: u64,
        #[source]
        source: CipherError,
    },
}

fn cipher_for(key: &DecryptionKey) -> Result<Blowfish, CipherError> {
    Blowfish::new_from_slice(key.as_bytes()).map_err(|_| CipherError::InvalidKey)
}

/// Decrypt one encrypted block in place (single CBC run with the stripe IV).
pub fn decrypt_block(key: &DecryptionKey, data: &mut [u8]) -> Result<(), CipherError> {
    let len = data.len();
    let decryptor = BfCbcDec::inner_iv_init(cipher_for(key)?, GenericArray::from_slice(&STRIPE_IV));
    decryptor
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| CipherError::MalformedChunk { len })?;
    Ok(())
}

/// Encrypt one block in place; the inverse of [`decrypt_block`].
pub fn encrypt_block(key: &DecryptionKey, data: &mut [u8]) -> Result<(), CipherError> {
    let len = data.len();
    let encryptor = BfCbcEnc::inner_iv_init(cipher_for(key)?, GenericArray::from_slice(&STRIPE_IV));
    encryptor
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| CipherError::MalformedChunk { len })?;
    Ok(())
}

/// Whether the block at `position` with length `len` is one of the encrypted stripes
pub fn is_encrypted_position(position: u64, len: usize) -> bool {
    position % STRIPE_PERIOD == 0 && len == BLOCK_SIZE
}

/// Stateful filter applied to the payload blocks in arrival order.
pub struct StripeDecryptor {
    key: DecryptionKey,
    position: u64,
    decrypted: u64,
}

impl StripeDecryptor {
    pub fn new(key: DecryptionKey) -> Self {
        Self { key, position: 0, decrypted: 0 }
    }

    /// Process the next block. Returns it decrypted or untouched, same length either way.
    pub fn process(&mut self, chunk: Bytes) -> Result<Bytes, CipherError> {
        let position = self.position;
        self.position += 1;

        if !is_encrypted_position(position, chunk.len()) {
            return Ok(chunk);
        }
        let mut data = chunk.to_vec();
        decrypt_block(&self.key, &mut data)?;
        self.decrypted += 1;
        Ok(Bytes::from(data))
    }

    /// Number of blocks seen so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of blocks that were decrypted
    pub fn decrypted(&self) -> u64 {
        self.decrypted
    }
}

/// Lazily decrypt a stream of payload blocks, one block out per block in.
pub fn decrypt_stream<S>(source: S, key: DecryptionKey) -> impl Stream<Item = Result<Bytes, DecryptError>>
where
    S: Stream<Item = Result<Bytes, TransportError>>,
{
    let mut decryptor = StripeDecryptor::new(key);
    source.map(move |item| {
        let position = decryptor.position();
        let chunk = item.map_err(|source| DecryptError::Transport { position, source })?;
        decryptor
            .process(chunk)
            .map_err(|source| DecryptError::Cipher { position, source })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{derive_key, AssetId};
    use futures::stream;
    use proptest::prelude::*;

    fn zero_key() -> DecryptionKey {
        DecryptionKey::from([0u8; 16])
    }

    #[test]
    fn test_decrypt_block_known_answer() {
        // Blowfish(0^8) under the all-zero key is 4EF997456198DD78; CBC then XORs in the IV.
        // A 16-byte zero key expands to the same schedule as the 8-byte one.
        let mut block = [0x4E, 0xF9, 0x97, 0x45, 0x61, 0x98, 0xDD, 0x78];
        decrypt_block(&zero_key(), &mut block).unwrap();
        assert_eq!(block, STRIPE_IV);
    }

    #[test]
    fn test_decrypt_block_known_answer_ones() {
        // Blowfish(FF^8) under the all-FF key is 51866FD5B85ECB8A
        let key = DecryptionKey::from([0xFF; 16]);
        let mut block = [0x51, 0x86, 0x6F, 0xD5, 0xB8, 0x5E, 0xCB, 0x8A];
        decrypt_block(&key, &mut block).unwrap();
        let expected: Vec<u8> = STRIPE_IV.iter().map(|b| b ^ 0xFF).collect();
        assert_eq!(block.to_vec(), expected);
    }

    #[test]
    fn test_encrypt_decrypt_symmetric() {
        let key = derive_key(&AssetId::from("12345"));
        let original: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        let mut data = original.clone();
        encrypt_block(&key, &mut data).unwrap();
        assert_ne!(data, original);
        decrypt_block(&key, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_iv_not_carried_between_blocks() {
        let key = derive_key(&AssetId::from("12345"));
        let plain = vec![0x11u8; BLOCK_SIZE];
        let mut encrypted = plain.clone();
        encrypt_block(&key, &mut encrypted).unwrap();

        // the same ciphertext at positions 0 and 3 must decrypt identically
        let mut decryptor = StripeDecryptor::new(key);
        let first = decryptor.process(Bytes::from(encrypted.clone())).unwrap();
        decryptor.process(Bytes::from(vec![0u8; BLOCK_SIZE])).unwrap();
        decryptor.process(Bytes::from(vec![0u8; BLOCK_SIZE])).unwrap();
        let fourth = decryptor.process(Bytes::from(encrypted)).unwrap();
        assert_eq!(first, plain);
        assert_eq!(fourth, plain);
    }

    #[test]
    fn test_malformed_block_rejected() {
        let mut data = vec![0u8; 13];
        let err = decrypt_block(&zero_key(), &mut data).unwrap_err();
        assert!(matches!(err, CipherError::MalformedChunk { len: 13 }));
    }

    #[test]
    fn test_short_final_chunk_passes_through() {
        let mut decryptor = StripeDecryptor::new(zero_key());
        let full = Bytes::from(vec![1u8; BLOCK_SIZE]);
        for _ in 0..3 {
            decryptor.process(full.clone()).unwrap();
        }
        // position 3 is a stripe position but the chunk is short
        let tail = Bytes::from(vec![5u8; 100]);
        assert_eq!(decryptor.process(tail.clone()).unwrap(), tail);
        assert_eq!(decryptor.decrypted(), 1);
        assert_eq!(decryptor.position(), 4);
    }

    #[test]
    fn test_is_encrypted_position() {
        assert!(is_encrypted_position(0, BLOCK_SIZE));
        assert!(!is_encrypted_position(1, BLOCK_SIZE));
        assert!(!is_encrypted_position(2, BLOCK_SIZE));
        assert!(is_encrypted_position(6, BLOCK_SIZE));
        assert!(!is_encrypted_position(6, BLOCK_SIZE - 8));
    }

    #[tokio::test]
    async fn test_decrypt_stream_reports_transport_position() {
        let items: Vec<Result<Bytes, TransportError>> = vec![
            Ok(Bytes::from(vec![0u8; BLOCK_SIZE])),
            Ok(Bytes::from(vec![0u8; BLOCK_SIZE])),
            Err(TransportError::Timeout),
        ];
        let out: Vec<_> = decrypt_stream(stream::iter(items), zero_key()).collect().await;
        assert_eq!(out.len(), 3);
        assert!(matches!(out[2], Err(DecryptError::Transport { position: 2, .. })));
    }

    proptest! {
        #[test]
        fn prop_stripe_count(full_blocks in 0usize..40, tail in 0usize..BLOCK_SIZE) {
            let mut decryptor = StripeDecryptor::new(zero_key());
            for _ in 0..full_blocks {
                decryptor.process(Bytes::from(vec![0u8; BLOCK_SIZE])).unwrap();
            }
            if tail > 0 {
                let chunk = Bytes::from(vec![3u8; tail]);
                prop_assert_eq!(decryptor.process(chunk.clone()).unwrap(), chunk);
            }
            prop_assert_eq!(decryptor.decrypted(), full_blocks.div_ceil(3) as u64);
        }

        #[test]
        fn prop_plain_positions_untouched(data in proptest::collection::vec(any::<u8>(), BLOCK_SIZE)) {
            let mut decryptor = StripeDecryptor::new(zero_key());
            decryptor.process(Bytes::from(vec![0u8; BLOCK_SIZE])).unwrap();
            let chunk = Bytes::from(data);
            prop_assert_eq!(decryptor.process(chunk.clone()).unwrap(), chunk.clone());
            prop_assert_eq!(decryptor.process(chunk.clone()).unwrap(), chunk);
        }
    }
}
