//! Frame-based header tag (ID3v2.3 layout)
//!
//! The tag is a 10-byte header followed by a sequence of frames:
//!
//! ```text
//! header: "ID3" | major=3 | revision=0 | flags=0 | size (4 bytes, synchsafe)
//! frame:  id (4 ASCII) | payload length (u32 BE, plain) | flags=0 (u16) | payload
//! ```
//!
//! Every frame is built independently. A frame whose source field is missing or
//! malformed is left out; the rest of the tag is still emitted.


use thiserror::Error;
use tracing::debug;

use crate::metadata::{fields, AlbumMetadata, Fields, TrackMetadata};

/// Length of the tag header
pub const HEADER_LEN: usize = 10;
/// Length of a frame header
pub const FRAME_HEADER_LEN: usize = 10;
/// Largest payload size a synchsafe integer can carry
pub const MAX_SYNCHSAFE: u32 = 0x0FFF_FFFF;

const MARKER: &[u8; 3] = b"ID3";
const VERSION_MAJOR: u8 = 3;
const VERSION_REVISION: u8 = 0;

const ENCODING_LATIN1: u8 = 0x00;
const ENCODING_UTF8: u8 = 0x03;
const PICTURE_MIME: &[u8] = b"image/jpeg";
const PICTURE_COVER_FRONT: u8 = 0x03;

/// Size fields tried, in order, for the `TSIZ` frame
const SIZE_FIELDS: [&str; 5] = [
    fields::FILESIZE_AAC_64,
    fields::FILESIZE_MP3_320,
    fields::FILESIZE_MP3_256,
    fields::FILESIZE_MP3_64,
    fields::FILESIZE,
];

/// Direct text copies: (frame id, track field)
const TEXT_FRAMES: [(&[u8; 4], &str); 6] = [
    (b"TALB", fields::ALB_TITLE),
    (b"TPE1", fields::ART_NAME),
    (b"TPE2", fields::ART_NAME),
    (b"TPOS", fields::DISK_NUMBER),
    (b"TIT2", fields::SNG_TITLE),
    (b"TSRC", fields::ISRC),
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TagError {
    #[error("Tag payload of {size} bytes exceeds the synchsafe range")]
    TooLarge { size: usize },
}

/// Why a single frame was left out
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldError {
    #[error("field {0} is missing")]
    Missing(&'static str),
    #[error("field {0} is malformed")]
    Malformed(&'static str),
}

/// One typed frame: a four character id and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFrame {
    id: [u8; 4],
    payload: Vec<u8>,
}

impl TagFrame {
    pub fn new(id: &[u8; 4], payload: Vec<u8>) -> Self {
        Self { id: *id, payload }
    }

    /// Text frame: UTF-8 encoding marker followed by the text, no terminator.
    pub fn text(id: &[u8; 4], text: &str) -> Self {
        let mut payload = Vec::with_capacity(1 + text.len());
        payload.push(ENCODING_UTF8);
        payload.extend_from_slice(text.as_bytes());
        Self::new(id, payload)
    }

    /// `APIC` frame holding a JPEG front cover with an empty description.
    pub fn picture(jpeg: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(PICTURE_MIME.len() + jpeg.len() + 4);
        payload.push(ENCODING_LATIN1);
        payload.extend_from_slice(PICTURE_MIME);
        payload.push(0);
        payload.push(PICTURE_COVER_FRONT);
        payload.push(0);
        payload.extend_from_slice(jpeg);
        Self::new(b"APIC", payload)
    }

    pub fn id(&self) -> &str {
        std::str::from_utf8(&self.id).unwrap_or("????")
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Frame length on the wire, header included
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.payload);
    }
}

/// Spread a 28-bit value over four bytes, seven bits each, most significant first.
///
/// Returns `None` when the value does not fit in 28 bits.
pub fn encode_synchsafe(value: u32) -> Option<[u8; 4]> {
    if value > MAX_SYNCHSAFE {
        return None;
    }
    let spread = ((value << 3) & 0x7F00_0000)
        | ((value << 2) & 0x007F_0000)
        | ((value << 1) & 0x0000_7F00)
        | (value & 0x0000_007F);
    Some(spread.to_be_bytes())
}

/// Inverse of [`encode_synchsafe`]
pub fn decode_synchsafe(bytes: [u8; 4]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, b| (acc << 7) | u32::from(b & 0x7F))
}

fn required_text<F: Fields>(record: &F, key: &'static str) -> Result<String, FieldError> {
    record.text(key).ok_or(FieldError::Missing(key))
}

fn required_number<F: Fields>(record: &F, key: &'static str) -> Result<u64, FieldError> {
    let text = required_text(record, key)?;
    record.number(key).ok_or_else(|| {
        debug!(key, value = %text, "unparsable number");
        FieldError::Malformed(key)
    })
}

/// Zero-pad numeric values to two digits, pass anything else through.
fn pad2(value: &str) -> String {
    match value.trim().parse::<u64>() {
        Ok(n) => format!("{n:02}"),
        Err(_) => value.to_string(),
    }
}

/// Leading four-digit year of a `YYYY-MM-DD` date
fn date_year(date: &str, key: &'static str) -> Result<String, FieldError> {
    match date.get(..4) {
        Some(year) if year.bytes().all(|b| b.is_ascii_digit()) => Ok(year.to_string()),
        _ => Err(FieldError::Malformed(key)),
    }
}

/// `DDMM` of a `YYYY-MM-DD` date
fn date_day_month(date: &str, key: &'static str) -> Result<String, FieldError> {
    let parts: Vec<&str> = date.split('-').collect();
    let valid = |s: &str| s.len() == 2 && s.bytes().all(|b| b.is_ascii_digit());
    match parts.as_slice() {
        [_, month, day, ..] if valid(month) && valid(day) => Ok(format!("{day}{month}")),
        _ => Err(FieldError::Malformed(key)),
    }
}

fn track_frame(track: &TrackMetadata, album: &AlbumMetadata) -> Result<TagFrame, FieldError> {
    let number = pad2(&required_text(track, fields::TRACK_NUMBER)?);
    let text = match album.text(fields::TRACKS) {
        Some(total) => format!("{number}/{}", pad2(&total)),
        None => number,
    };
    Ok(TagFrame::text(b"TRCK", &text))
}

fn length_frame(track: &TrackMetadata) -> Result<TagFrame, FieldError> {
    let seconds = required_number(track, fields::DURATION)?;
    let millis = seconds.checked_mul(1000).ok_or(FieldError::Malformed(fields::DURATION))?;
    Ok(TagFrame::text(b"TLEN", &millis.to_string()))
}

fn size_frame(track: &TrackMetadata) -> TagFrame {
    let size = SIZE_FIELDS
        .iter()
        .filter_map(|key| track.number(key))
        .find(|size| *size > 0)
        .unwrap_or(0);
    TagFrame::text(b"TSIZ", &size.to_string())
}

fn original_year_frame(album: &AlbumMetadata) -> Result<TagFrame, FieldError> {
    let key = fields::PHYSICAL_RELEASE_DATE;
    let year = date_year(&required_text(album, key)?, key)?;
    Ok(TagFrame::text(b"TORY", &year))
}

fn year_frame(album: &AlbumMetadata) -> Result<TagFrame, FieldError> {
    let key = if album.text(fields::DIGITAL_RELEASE_DATE).is_some() {
        fields::DIGITAL_RELEASE_DATE
    } else {
        fields::PHYSICAL_RELEASE_DATE
    };
    let year = date_year(&required_text(album, key)?, key)?;
    Ok(TagFrame::text(b"TYER", &year))
}

fn date_frame(album: &AlbumMetadata) -> Result<TagFrame, FieldError> {
    let key = fields::PHYSICAL_RELEASE_DATE;
    let ddmm = date_day_month(&required_text(album, key)?, key)?;
    Ok(TagFrame::text(b"TDAT", &ddmm))
}

/// Build the frames for a track, in emission order.
///
/// `picture` is the already fetched cover; `None` leaves out `APIC`.
pub fn build_frames(track: &TrackMetadata, album: &AlbumMetadata, picture: Option<&[u8]>) -> Vec<TagFrame> {
    let mut frames = Vec::with_capacity(16);
    let mut keep = |id: &str, frame: Result<TagFrame, FieldError>| match frame {
        Ok(frame) => frames.push(frame),
        Err(reason) => debug!(frame = id, %reason, "omitting frame"),
    };

    keep("TRCK", track_frame(track, album));
    keep("TLEN", length_frame(track));
    keep("TSIZ", Ok(size_frame(track)));
    keep("TFLT", Ok(TagFrame::text(b"TFLT", "MPG/3")));
    for (id, key) in TEXT_FRAMES {
        let frame = required_text(track, key).map(|text| TagFrame::text(id, &text));
        keep(std::str::from_utf8(id).unwrap_or("????"), frame);
    }
    if let Some(jpeg) = picture {
        keep("APIC", Ok(TagFrame::picture(jpeg)));
    }
    keep("TORY", original_year_frame(album));
    keep("TYER", year_frame(album));
    keep("TDAT", date_frame(album));

    frames
}

/// Serialize a header and the given frames.
pub fn encode_frames(frames: &[TagFrame]) -> Result<Vec<u8>, TagError> {
    let size: usize = frames.iter().map(TagFrame::encoded_len).sum();
    let synchsafe = u32::try_from(size)
        .ok()
        .and_then(encode_synchsafe)
        .ok_or(TagError::TooLarge { size })?;

    let mut out = Vec::with_capacity(HEADER_LEN + size);
    out.extend_from_slice(MARKER);
    out.push(VERSION_MAJOR);
    out.push(VERSION_REVISION);
    out.push(0);
    out.extend_from_slice(&synchsafe);
    for frame in frames {
        frame.write_to(&mut out);
    }
    Ok(out)
}

/// Serialize the complete header tag for a track.
pub fn encode_header_tag(
    track: &TrackMetadata,
    album: &AlbumMetadata,
    picture: Option<&[u8]>,
) -> Result<Vec<u8>, TagError> {
    encode_frames(&build_frames(track, album, picture))
}

/// Split an encoded tag back into (id, payload) pairs. Used to check emitted tags.
pub fn parse_frames(tag: &[u8]) -> Option<Vec<(String, Vec<u8>)>> {
    if tag.len() < HEADER_LEN || &tag[0..3] != MARKER {
        return None;
    }
    let size = decode_synchsafe(tag[6..10].try_into().ok()?) as usize;
    let body = tag.get(HEADER_LEN..HEADER_LEN + size)?;

    let mut frames = Vec::new();
    let mut offset = 0;
    while offset + FRAME_HEADER_LEN <= body.len() {
        let id = std::str::from_utf8(&body[offset..offset + 4]).ok()?.to_string();
        let len = u32::from_be_bytes(body[offset + 4..offset + 8].try_into().ok()?) as usize;
        let start = offset + FRAME_HEADER_LEN;
        let payload = body.get(start..start + len)?.to_vec();
        frames.push((id, payload));
        offset = start + len;
    }
    (offset == body.len()).then_some(frames)
}
