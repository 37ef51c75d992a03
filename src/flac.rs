// FLAC container tagging
//
// FLAC output does not get the frame header or the trailer. Its tags live in the
// container's own metadata blocks (vorbis comments plus a picture block), which
// are rewritten in place once the decrypted body is on disk.

use std::path::Path;

use metaflac::block::PictureType;
use thiserror::Error;
use tracing::debug;

use crate::metadata::{fields, AlbumMetadata, Fields, TrackMetadata};

#[derive(Error, Debug)]
pub enum FlacTagError {
    #[error("FLAC metadata error: {0}")]
    Metaflac(#[from] metaflac::Error),
    #[error("Tagging task failed: {0}")]
    Task(String),
}

/// Rewrites container-level tags of a finished output file.
pub trait ContainerTagger: Send + Sync {
    fn tag(
        &self,
        path: &Path,
        track: &TrackMetadata,
        album: &AlbumMetadata,
        picture: Option<&[u8]>,
    ) -> Result<(), FlacTagError>;
}

/// Vorbis comment tagger backed by `metaflac`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetaflacTagger;

impl MetaflacTagger {
    pub fn new() -> Self {
        Self
    }
}

impl ContainerTagger for MetaflacTagger {
    fn tag(
        &self,
        path: &Path,
        track: &TrackMetadata,
        album: &AlbumMetadata,
        picture: Option<&[u8]>,
    ) -> Result<(), FlacTagError> {
        let mut tag = metaflac::Tag::read_from_path(path)?;

        let comments = tag.vorbis_comments_mut();
        let mut set = |key: &str, value: Option<String>| match value {
            Some(value) => comments.set(key, vec![value]),
            None => debug!(key, "no value for vorbis comment"),
        };
        set("TITLE", track.text(fields::SNG_TITLE));
        set("ARTIST", track.text(fields::ART_NAME));
        set("ALBUM", track.text(fields::ALB_TITLE));
        set("TRACKNUMBER", track.text(fields::TRACK_NUMBER));
        set(
            "DATE",
            album
                .text(fields::PHYSICAL_RELEASE_DATE)
                .and_then(|date| date.get(..4).map(str::to_string)),
        );
        set("LABEL", album.text(fields::LABEL_NAME));

        if let Some(jpeg) = picture {
            tag.remove_picture_type(PictureType::CoverFront);
            tag.add_picture("image/jpeg", PictureType::CoverFront, jpeg.to_vec());
        }

        tag.save()?;
        Ok(())
    }
}
