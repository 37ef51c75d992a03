//! Fixed 128-byte trailer tag (ID3v1.1 layout)
//!
//! ```text
//! 0..3     "TAG"
//! 3..33    title
//! 33..63   artist
//! 63..93   album
//! 93..97   year
//! 97..125  comment (carries the label name)
//! 125      0 (comment/track separator)
//! 126      track number
//! 127      genre (255 = unspecified)
//! ```

use crate::metadata::{fields, AlbumMetadata, Fields, TrackMetadata};

/// Trailer length in bytes
pub const TRAILER_LEN: usize = 128;

const MARKER: &[u8; 3] = b"TAG";
const GENRE_UNSPECIFIED: u8 = 255;

/// Copy `text` into a fixed-width, NUL-padded field, truncating on a character boundary.
fn put_text(out: &mut [u8], text: Option<&str>) {
    let Some(text) = text else { return };
    let mut end = text.len().min(out.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    out[..end].copy_from_slice(&text.as_bytes()[..end]);
}

/// Serialize the trailer for a track. Missing fields encode as zero bytes.
pub fn encode_trailer(track: &TrackMetadata, album: &AlbumMetadata) -> [u8; TRAILER_LEN] {
    let mut out = [0u8; TRAILER_LEN];

    out[0..3].copy_from_slice(MARKER);
    put_text(&mut out[3..33], track.text(fields::SNG_TITLE).as_deref());
    put_text(&mut out[33..63], track.text(fields::ART_NAME).as_deref());
    put_text(&mut out[63..93], track.text(fields::ALB_TITLE).as_deref());
    put_text(&mut out[93..97], album.text(fields::PHYSICAL_RELEASE_DATE).as_deref());
    put_text(&mut out[97..125], album.text(fields::LABEL_NAME).as_deref());
    out[125] = 0;
    // one byte only; larger track numbers saturate
    out[126] = track
        .number(fields::TRACK_NUMBER)
        .map(|n| n.min(u8::MAX as u64) as u8)
        .unwrap_or(0);
    out[127] = GENRE_UNSPECIFIED;

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn field(bytes: &[u8]) -> &str {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end]).unwrap()
    }

    #[test]
    fn test_layout() {
        let track = TrackMetadata::from_value(json!({
            "SNG_TITLE": "Foo",
            "ART_NAME": "Bar",
            "ALB_TITLE": "Baz",
            "TRACK_NUMBER": "3",
        }));
        let album = AlbumMetadata::from_value(json!({
            "LABEL_NAME": "Lbl",
            "PHYSICAL_RELEASE_DATE": "2008-11-21",
        }));
        let tag = encode_trailer(&track, &album);

        assert_eq!(&tag[0..3], b"TAG");
        assert_eq!(field(&tag[3..33]), "Foo");
        assert_eq!(field(&tag[33..63]), "Bar");
        assert_eq!(field(&tag[63..93]), "Baz");
        assert_eq!(&tag[93..97], b"2008");
        assert_eq!(field(&tag[97..125]), "Lbl");
        assert_eq!(tag[125], 0);
        assert_eq!(tag[126], 3);
        assert_eq!(tag[127], 255);
    }

    #[test]
    fn test_missing_fields_are_zero() {
        let tag = encode_trailer(&TrackMetadata::default(), &AlbumMetadata::default());
        assert_eq!(&tag[0..3], b"TAG");
        assert!(tag[3..127].iter().all(|b| *b == 0));
        assert_eq!(tag[127], 255);
    }

    #[test]
    fn test_long_title_truncated() {
        let track = TrackMetadata::from_value(json!({ "SNG_TITLE": "x".repeat(50) }));
        let tag = encode_trailer(&track, &AlbumMetadata::default());
        assert_eq!(&tag[3..33], "x".repeat(30).as_bytes());
        assert_eq!(tag[33], 0);
    }

    #[test]
    fn test_truncation_respects_utf8() {
        // 29 ASCII bytes followed by a two-byte character that does not fit
        let title = format!("{}é", "a".repeat(29));
        let track = TrackMetadata::from_value(json!({ "SNG_TITLE": title }));
        let tag = encode_trailer(&track, &AlbumMetadata::default());
        assert_eq!(field(&tag[3..33]), "a".repeat(29));
    }

    #[test]
    fn test_track_number_saturates() {
        let track = TrackMetadata::from_value(json!({ "TRACK_NUMBER": 300 }));
        let tag = encode_trailer(&track, &AlbumMetadata::default());
        assert_eq!(tag[126], 255);
    }

    proptest! {
        #[test]
        fn prop_always_128_bytes(title in ".{0,80}", artist in ".{0,80}", number in 0u64..100_000) {
            let track = TrackMetadata::from_value(json!({
                "SNG_TITLE": title,
                "ART_NAME": artist,
                "TRACK_NUMBER": number,
            }));
            let tag = encode_trailer(&track, &AlbumMetadata::default());
            prop_assert_eq!(tag.len(), TRAILER_LEN);
            prop_assert_eq!(&tag[0..3], b"TAG");
            prop_assert_eq!(tag[126] as u64, number.min(255));
            prop_assert!(std::str::from_utf8(&tag[3..33]).is_ok());
        }
    }
}
