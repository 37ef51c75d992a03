//! Track and album metadata records
//!
//! Records arrive as loosely typed JSON objects (string or number values keyed by
//! upper-case field names). They are read-only here: the encoders pull the fields
//! they need and treat anything absent, empty or unparsable as missing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::keys::AssetId;

/// Field names used by the encoders and the pipeline
pub mod fields {
    pub const SNG_ID: &str = "SNG_ID";
    pub const TRACK_TOKEN: &str = "TRACK_TOKEN";
    pub const SNG_TITLE: &str = "SNG_TITLE";
    pub const ART_NAME: &str = "ART_NAME";
    pub const ALB_TITLE: &str = "ALB_TITLE";
    pub const ALB_PICTURE: &str = "ALB_PICTURE";
    pub const TRACK_NUMBER: &str = "TRACK_NUMBER";
    pub const DISK_NUMBER: &str = "DISK_NUMBER";
    pub const DURATION: &str = "DURATION";
    pub const ISRC: &str = "ISRC";
    pub const FALLBACK: &str = "FALLBACK";

    pub const FILESIZE_AAC_64: &str = "FILESIZE_AAC_64";
    pub const FILESIZE_MP3_320: &str = "FILESIZE_MP3_320";
    pub const FILESIZE_MP3_256: &str = "FILESIZE_MP3_256";
    pub const FILESIZE_MP3_128: &str = "FILESIZE_MP3_128";
    pub const FILESIZE_MP3_64: &str = "FILESIZE_MP3_64";
    pub const FILESIZE_FLAC: &str = "FILESIZE_FLAC";
    pub const FILESIZE: &str = "FILESIZE";

    pub const TRACKS: &str = "TRACKS";
    pub const LABEL_NAME: &str = "LABEL_NAME";
    pub const PHYSICAL_RELEASE_DATE: &str = "PHYSICAL_RELEASE_DATE";
    pub const DIGITAL_RELEASE_DATE: &str = "DIGITAL_RELEASE_DATE";
}

/// Read access shared by track and album records.
pub trait Fields {
    fn fields(&self) -> &Map<String, Value>;

    /// Field as text. Numbers are rendered in decimal; empty strings count as missing.
    fn text(&self, key: &str) -> Option<String> {
        match self.fields().get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Field as an unsigned integer, accepting both numbers and numeric strings.
    fn number(&self, key: &str) -> Option<u64> {
        match self.fields().get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Metadata of one track, possibly carrying an alternate track under `FALLBACK`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackMetadata {
    fields: Map<String, Value>,
}

/// Album-level metadata accompanying a track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlbumMetadata {
    fields: Map<String, Value>,
}

impl Fields for TrackMetadata {
    fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl Fields for AlbumMetadata {
    fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl From<Map<String, Value>> for TrackMetadata {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl From<Map<String, Value>> for AlbumMetadata {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl TrackMetadata {
    /// Build from a JSON value; anything but an object yields an empty record.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }

    /// Key derivation input (`SNG_ID`)
    pub fn asset_id(&self) -> Option<AssetId> {
        self.text(fields::SNG_ID).map(AssetId::from)
    }

    /// Token handed to the stream source (`TRACK_TOKEN`)
    pub fn track_token(&self) -> Option<String> {
        self.text(fields::TRACK_TOKEN)
    }

    /// Cover reference (`ALB_PICTURE`)
    pub fn picture_ref(&self) -> Option<String> {
        self.text(fields::ALB_PICTURE)
    }

    /// Alternate track used when the primary payload cannot be opened
    pub fn fallback(&self) -> Option<TrackMetadata> {
        match self.fields.get(fields::FALLBACK)? {
            Value::Object(fields) if !fields.is_empty() => Some(Self { fields: fields.clone() }),
            _ => None,
        }
    }
}

impl AlbumMetadata {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self { fields },
            _ => Self::default(),
        }
    }
}

/// Container the decrypted body is tagged for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Flac,
    Mp3,
}

/// Encodings a payload can be requested in
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Flac,
    Mp3_320,
    Mp3_128,
}

impl AudioFormat {
    /// Name used when requesting the payload
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Flac => "FLAC",
            AudioFormat::Mp3_320 => "MP3_320",
            AudioFormat::Mp3_128 => "MP3_128",
        }
    }

    pub fn container(&self) -> Container {
        match self {
            AudioFormat::Flac => Container::Flac,
            AudioFormat::Mp3_320 | AudioFormat::Mp3_128 => Container::Mp3,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self.container() {
            Container::Flac => ".flac",
            Container::Mp3 => ".mp3",
        }
    }
}

/// Quality the caller would like to get
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityPreference {
    Flac,
    #[default]
    Mp3,
}

/// Pick the best available format for a track.
///
/// FLAC when preferred and present, then MP3 320 when present, else MP3 128.
pub fn select_format(track: &TrackMetadata, preference: QualityPreference) -> AudioFormat {
    let available = |key: &str| track.number(key).unwrap_or(0) > 0;

    if preference == QualityPreference::Flac && available(fields::FILESIZE_FLAC) {
        return AudioFormat::Flac;
    }
    if available(fields::FILESIZE_MP3_320) {
        AudioFormat::Mp3_320
    } else {
        AudioFormat::Mp3_128
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_accepts_strings_and_numbers() {
        let track = TrackMetadata::from_value(json!({
            "SNG_TITLE": "Foo",
            "DURATION": 200,
            "ISRC": "",
            "ALB_PICTURE": null,
        }));
        assert_eq!(track.text("SNG_TITLE").as_deref(), Some("Foo"));
        assert_eq!(track.text("DURATION").as_deref(), Some("200"));
        assert_eq!(track.text("ISRC"), None);
        assert_eq!(track.text("ALB_PICTURE"), None);
        assert_eq!(track.text("MISSING"), None);
    }

    #[test]
    fn test_number_parses_strings() {
        let track = TrackMetadata::from_value(json!({
            "TRACK_NUMBER": "3",
            "DURATION": 200,
            "SNG_TITLE": "Foo",
        }));
        assert_eq!(track.number("TRACK_NUMBER"), Some(3));
        assert_eq!(track.number("DURATION"), Some(200));
        assert_eq!(track.number("SNG_TITLE"), None);
    }

    #[test]
    fn test_fallback_record() {
        let track = TrackMetadata::from_value(json!({
            "SNG_ID": "1",
            "FALLBACK": { "SNG_ID": "2", "TRACK_TOKEN": "tok2" },
        }));
        let fallback = track.fallback().unwrap();
        assert_eq!(fallback.asset_id(), Some(AssetId::from("2")));
        assert_eq!(fallback.track_token().as_deref(), Some("tok2"));
        assert!(fallback.fallback().is_none());

        let empty = TrackMetadata::from_value(json!({ "FALLBACK": {} }));
        assert!(empty.fallback().is_none());
    }

    #[test]
    fn test_deserialize_transparent() {
        let album: AlbumMetadata = serde_json::from_str(r#"{"TRACKS": "10", "LABEL_NAME": "Lbl"}"#).unwrap();
        assert_eq!(album.number(fields::TRACKS), Some(10));
        assert_eq!(album.text(fields::LABEL_NAME).as_deref(), Some("Lbl"));
    }

    #[test]
    fn test_select_format() {
        let flac = TrackMetadata::from_value(json!({ "FILESIZE_FLAC": "1000", "FILESIZE_MP3_320": "500" }));
        let mp3 = TrackMetadata::from_value(json!({ "FILESIZE_FLAC": "0", "FILESIZE_MP3_320": 500 }));
        let low = TrackMetadata::from_value(json!({ "FILESIZE_MP3_128": "100" }));

        assert_eq!(select_format(&flac, QualityPreference::Flac), AudioFormat::Flac);
        assert_eq!(select_format(&flac, QualityPreference::Mp3), AudioFormat::Mp3_320);
        assert_eq!(select_format(&mp3, QualityPreference::Flac), AudioFormat::Mp3_320);
        assert_eq!(select_format(&low, QualityPreference::Flac), AudioFormat::Mp3_128);
    }

    #[test]
    fn test_format_container() {
        assert_eq!(AudioFormat::Flac.container(), Container::Flac);
        assert_eq!(AudioFormat::Mp3_320.extension(), ".mp3");
        assert_eq!(AudioFormat::Mp3_128.as_str(), "MP3_128");
    }
}
