//! bfstripe-rs: decryption and tagging core for striped Blowfish media streams
//!
//! A track payload arrives as a sequence of 2048-byte blocks, every third of which
//! is Blowfish-CBC encrypted with a key derived from the track's asset id. The
//! [`TrackDownloader`] decrypts the payload as it streams and wraps it in an
//! ID3v2.3 header tag and an ID3v1.1 trailer (MP3), or hands the bare body to a
//! container tagger (FLAC).

pub mod api;
pub mod cipher;
pub mod flac;
pub mod frames;
pub mod keys;
pub mod metadata;
#[cfg(any(test, feature = "testlib"))]
pub mod testlib;
pub mod trailer;
pub mod transport;

pub use api::{DownloadConfig, DownloadConfigBuilder, DownloadReport, PipelineError, Stage, TrackDownloader};
pub use cipher::{decrypt_block, decrypt_stream, StripeDecryptor};
pub use flac::{ContainerTagger, MetaflacTagger};
pub use frames::encode_header_tag;
pub use keys::{derive_key, AssetId, DecryptionKey};
pub use metadata::{select_format, AlbumMetadata, AudioFormat, Container, QualityPreference, TrackMetadata};
pub use trailer::encode_trailer;
pub use transport::{CancelToken, Cancellable, FileSource, HttpTransport, MemoryTransport, PictureSource, StreamSource};

static LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate version string
pub fn version() -> &'static str {
    LIB_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(version(), "0.1.0");
    }

    #[test]
    fn test_fixtures_not_in_default_build() {
        let manifest = include_str!("../Cargo.toml");
        assert!(manifest.contains("tempfile = { version = \"3\", optional = true }"));
        assert!(manifest.contains("testlib = [\"dep:tempfile\"]"));
    }
}
