//! API facade module
//
// The downloader ties the pieces together for one track:
//
//   open stream (fallback once) -> derive key -> header tag -> decrypted body -> trailer
//
// Stream acquisition happens before anything reaches the sink, so a fallback retry
// never leaves a half-written header behind. Field and picture problems only drop
// the affected frame; stream and sink problems abort the run.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::cipher::{decrypt_stream, is_encrypted_position, CipherError, DecryptError};
use crate::flac::{ContainerTagger, FlacTagError, MetaflacTagger};
use crate::frames::{encode_header_tag, TagError};
use crate::keys::{derive_key, AssetId};
use crate::metadata::{select_format, AlbumMetadata, AudioFormat, Container, QualityPreference, TrackMetadata};
use crate::trailer::encode_trailer;
use crate::transport::{ChunkStream, PictureSource, StreamSource, TransportError};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
const DEFAULT_COVER_BASE_URL: &str = "https://e-cdns-images.dzcdn.net/images";

/// Immutable per-run configuration, built with [`DownloadConfigBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    quality: QualityPreference,
    fetch_cover: bool,
    cover_size: u32,
    timeout_seconds: u64,
    user_agent: String,
    cover_base_url: String,
}

impl DownloadConfig {
    pub fn quality(&self) -> QualityPreference {
        self.quality
    }
    pub fn fetch_cover(&self) -> bool {
        self.fetch_cover
    }
    pub fn cover_size(&self) -> u32 {
        self.cover_size
    }
    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds
    }
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
    pub fn cover_base_url(&self) -> &str {
        &self.cover_base_url
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        DownloadConfigBuilder::default().build()
    }
}

/// Builder for [`DownloadConfig`]. Numeric setters clamp to their valid range.
#[derive(Debug, Clone)]
pub struct DownloadConfigBuilder {
    quality: QualityPreference,      // Default: Mp3
    fetch_cover: bool,               // Default: true
    cover_size: u32,                 // Default: 1200, Range: 100-1800
    timeout_seconds: u64,            // Default: 30, Range: 1-300
    user_agent: String,
    cover_base_url: String,
}

impl Default for DownloadConfigBuilder {
    fn default() -> Self {
        Self {
            quality: QualityPreference::default(),
            fetch_cover: true,
            cover_size: 1200,
            timeout_seconds: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cover_base_url: DEFAULT_COVER_BASE_URL.to_string(),
        }
    }
}

impl DownloadConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn quality(mut self, quality: QualityPreference) -> Self {
        self.quality = quality;
        self
    }
    pub fn fetch_cover(mut self, fetch: bool) -> Self {
        self.fetch_cover = fetch;
        self
    }
    pub fn cover_size(mut self, size: u32) -> Self {
        self.cover_size = size.clamp(100, 1800);
        self
    }
    pub fn timeout_seconds(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs.clamp(1, 300);
        self
    }
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
    pub fn cover_base_url(mut self, url: impl Into<String>) -> Self {
        self.cover_base_url = url.into();
        self
    }
    pub fn build(self) -> DownloadConfig {
        DownloadConfig {
            quality: self.quality,
            fetch_cover: self.fetch_cover,
            cover_size: self.cover_size,
            timeout_seconds: self.timeout_seconds,
            user_agent: self.user_agent,
            cover_base_url: self.cover_base_url,
        }
    }
}

/// Step of a run, reported with every fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CreateOutput,
    OpenStream,
    HeaderTag,
    Body,
    Trailer,
    Flush,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::CreateOutput => "create output",
            Stage::OpenStream => "open stream",
            Stage::HeaderTag => "header tag",
            Stage::Body => "body",
            Stage::Trailer => "trailer",
            Stage::Flush => "flush",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("[{asset_id}] {stage}: track record has no asset id")]
    MissingAssetId { asset_id: AssetId, stage: Stage },
    #[error("[{asset_id}] {stage}: could not open encrypted stream: {source}")]
    StreamAcquisition {
        asset_id: AssetId,
        stage: Stage,
        #[source]
        source: TransportError,
    },
    #[error("[{asset_id}] {stage}: stream ended abnormally at block {position}: {source}")]
    StreamInterrupted {
        asset_id: AssetId,
        stage: Stage,
        position: u64,
        #[source]
        source: TransportError,
    },
    #[error("[{asset_id}] {stage}: malformed encrypted block {position}: {source}")]
    MalformedEncryptedChunk {
        asset_id: AssetId,
        stage: Stage,
        position: u64,
        #[source]
        source: CipherError,
    },
    #[error("[{asset_id}] {stage}: write failed: {source}")]
    SinkWrite {
        asset_id: AssetId,
        stage: Stage,
        #[source]
        source: std::io::Error,
    },
    #[error("[{asset_id}] {stage}: {source}")]
    Tag {
        asset_id: AssetId,
        stage: Stage,
        #[source]
        source: TagError,
    },
}

impl PipelineError {
    pub fn asset_id(&self) -> &AssetId {
        match self {
            PipelineError::MissingAssetId { asset_id, .. }
            | PipelineError::StreamAcquisition { asset_id, .. }
            | PipelineError::StreamInterrupted { asset_id, .. }
            | PipelineError::MalformedEncryptedChunk { asset_id, .. }
            | PipelineError::SinkWrite { asset_id, .. }
            | PipelineError::Tag { asset_id, .. } => asset_id,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::MissingAssetId { stage, .. }
            | PipelineError::StreamAcquisition { stage, .. }
            | PipelineError::StreamInterrupted { stage, .. }
            | PipelineError::MalformedEncryptedChunk { stage, .. }
            | PipelineError::SinkWrite { stage, .. }
            | PipelineError::Tag { stage, .. } => *stage,
        }
    }

    /// Whether the fallback track may be tried instead. A cancelled acquisition never does.
    fn allows_fallback(&self) -> bool {
        match self {
            PipelineError::MissingAssetId { .. } => true,
            PipelineError::StreamAcquisition { source, .. } => !matches!(source, TransportError::Cancelled),
            _ => false,
        }
    }

    fn sink(asset_id: &AssetId, stage: Stage) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| PipelineError::SinkWrite { asset_id: asset_id.clone(), stage, source }
    }
}

/// What a successful run wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    /// Asset actually downloaded (the fallback's when it was used)
    pub asset_id: AssetId,
    pub used_fallback: bool,
    pub format: AudioFormat,
    pub header_bytes: u64,
    pub body_bytes: u64,
    pub chunks: u64,
    pub decrypted_chunks: u64,
    pub trailer_bytes: u64,
}

impl DownloadReport {
    /// Bytes written to the sink
    pub fn total_bytes(&self) -> u64 {
        self.header_bytes + self.body_bytes + self.trailer_bytes
    }
}

struct Acquired<'t> {
    track: Cow<'t, TrackMetadata>,
    asset_id: AssetId,
    stream: ChunkStream,
    used_fallback: bool,
}

fn unknown_asset() -> AssetId {
    AssetId::new("<unknown>")
}

/// Decrypts and tags one track at a time into a caller-supplied sink.
pub struct TrackDownloader<S, P> {
    config: DownloadConfig,
    streams: S,
    pictures: P,
    tagger: Arc<dyn ContainerTagger>,
}

impl<S: StreamSource, P: PictureSource> TrackDownloader<S, P> {
    pub fn new(config: DownloadConfig, streams: S, pictures: P) -> Self {
        Self {
            config,
            streams,
            pictures,
            tagger: Arc::new(MetaflacTagger::new()),
        }
    }

    /// Replace the container tagger used for FLAC output
    pub fn with_tagger(mut self, tagger: Arc<dyn ContainerTagger>) -> Self {
        self.tagger = tagger;
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Best format for `track` under the configured quality preference
    pub fn format_for(&self, track: &TrackMetadata) -> AudioFormat {
        select_format(track, self.config.quality())
    }

    async fn open_one(&self, track: &TrackMetadata, format: AudioFormat) -> Result<(AssetId, ChunkStream), PipelineError> {
        let stage = Stage::OpenStream;
        let asset_id = track
            .asset_id()
            .ok_or_else(|| PipelineError::MissingAssetId { asset_id: unknown_asset(), stage })?;
        debug!(asset = %asset_id, format = format.as_str(), "opening stream");
        match self.streams.open(track, format).await {
            Ok(stream) => Ok((asset_id, stream)),
            Err(source) => Err(PipelineError::StreamAcquisition { asset_id, stage, source }),
        }
    }

    async fn acquire<'t>(&self, track: &'t TrackMetadata, format: AudioFormat) -> Result<Acquired<'t>, PipelineError> {
        let primary_err = match self.open_one(track, format).await {
            Ok((asset_id, stream)) => {
                return Ok(Acquired { track: Cow::Borrowed(track), asset_id, stream, used_fallback: false })
            }
            Err(e) => e,
        };

        let fallback = match track.fallback() {
            Some(fallback) if primary_err.allows_fallback() => fallback,
            _ => return Err(primary_err),
        };
        warn!(error = %primary_err, "primary stream unavailable, trying fallback track");

        let (asset_id, stream) = self.open_one(&fallback, format).await?;
        Ok(Acquired { track: Cow::Owned(fallback), asset_id, stream, used_fallback: true })
    }

    async fn fetch_cover(&self, track: &TrackMetadata) -> Option<Bytes> {
        if !self.config.fetch_cover() {
            return None;
        }
        let picture_ref = track.picture_ref()?;
        match self.pictures.fetch_picture(&picture_ref).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(picture = %picture_ref, error = %e, "cover fetch failed, continuing without it");
                None
            }
        }
    }

    async fn execute<'t, W>(
        &self,
        track: &'t TrackMetadata,
        album: &AlbumMetadata,
        format: AudioFormat,
        sink: &mut W,
    ) -> Result<(DownloadReport, Cow<'t, TrackMetadata>), PipelineError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let Acquired { track, asset_id, stream, used_fallback } = self.acquire(track, format).await?;
        let key = derive_key(&asset_id);
        let mp3 = format.container() == Container::Mp3;

        let mut report = DownloadReport {
            asset_id: asset_id.clone(),
            used_fallback,
            format,
            header_bytes: 0,
            body_bytes: 0,
            chunks: 0,
            decrypted_chunks: 0,
            trailer_bytes: 0,
        };

        if mp3 {
            let picture = self.fetch_cover(&track).await;
            let header = encode_header_tag(&track, album, picture.as_deref()).map_err(|source| {
                PipelineError::Tag { asset_id: asset_id.clone(), stage: Stage::HeaderTag, source }
            })?;
            sink.write_all(&header)
                .await
                .map_err(PipelineError::sink(&asset_id, Stage::HeaderTag))?;
            report.header_bytes = header.len() as u64;
            debug!(asset = %asset_id, bytes = header.len(), "header tag written");
        }

        let mut body = std::pin::pin!(decrypt_stream(stream, key));
        while let Some(item) = body.next().await {
            let block = item.map_err(|e| match e {
                DecryptError::Transport { position, source } => PipelineError::StreamInterrupted {
                    asset_id: asset_id.clone(),
                    stage: Stage::Body,
                    position,
                    source,
                },
                DecryptError::Cipher { position, source } => PipelineError::MalformedEncryptedChunk {
                    asset_id: asset_id.clone(),
                    stage: Stage::Body,
                    position,
                    source,
                },
            })?;
            if is_encrypted_position(report.chunks, block.len()) {
                report.decrypted_chunks += 1;
            }
            report.chunks += 1;
            report.body_bytes += block.len() as u64;
            sink.write_all(&block)
                .await
                .map_err(PipelineError::sink(&asset_id, Stage::Body))?;
        }
        debug!(asset = %asset_id, chunks = report.chunks, bytes = report.body_bytes, "body written");

        if mp3 {
            let trailer = encode_trailer(&track, album);
            sink.write_all(&trailer)
                .await
                .map_err(PipelineError::sink(&asset_id, Stage::Trailer))?;
            report.trailer_bytes = trailer.len() as u64;
        }

        sink.flush().await.map_err(PipelineError::sink(&asset_id, Stage::Flush))?;
        Ok((report, track))
    }

    /// Decrypt and tag `track` into `sink`.
    ///
    /// MP3 output gets a frame header tag and a trailer around the body; FLAC output
    /// is the bare decrypted body. A failed run never reports success; what to do
    /// with a partially written sink is up to the caller.
    pub async fn run<W>(
        &self,
        track: &TrackMetadata,
        album: &AlbumMetadata,
        format: AudioFormat,
        sink: &mut W,
    ) -> Result<DownloadReport, PipelineError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let (report, _) = self.execute(track, album, format, sink).await?;
        info!(
            asset = %report.asset_id,
            format = format.as_str(),
            bytes = report.total_bytes(),
            fallback = report.used_fallback,
            "track written"
        );
        Ok(report)
    }

    /// Run into a newly created file at `path`.
    ///
    /// The file must not exist yet. FLAC output is tagged afterwards with the
    /// container tagger; a tagging failure is logged and does not fail the download.
    pub async fn download_to_path(
        &self,
        track: &TrackMetadata,
        album: &AlbumMetadata,
        format: AudioFormat,
        path: impl AsRef<Path>,
    ) -> Result<DownloadReport, PipelineError> {
        let path = path.as_ref();
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|source| PipelineError::SinkWrite {
                asset_id: track.asset_id().unwrap_or_else(unknown_asset),
                stage: Stage::CreateOutput,
                source,
            })?;

        let mut writer = BufWriter::new(file);
        let (report, active) = self.execute(track, album, format, &mut writer).await?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(PipelineError::sink(&report.asset_id, Stage::Flush))?;

        if format.container() == Container::Flac {
            let picture = self.fetch_cover(&active).await;
            if let Err(e) = self.tag_container(path, active.into_owned(), album.clone(), picture).await {
                warn!(path = %path.display(), error = %e, "could not write FLAC tags");
            }
        }

        info!(
            asset = %report.asset_id,
            path = %path.display(),
            bytes = report.total_bytes(),
            fallback = report.used_fallback,
            "download finished"
        );
        Ok(report)
    }

    async fn tag_container(
        &self,
        path: &Path,
        track: TrackMetadata,
        album: AlbumMetadata,
        picture: Option<Bytes>,
    ) -> Result<(), FlacTagError> {
        let tagger = Arc::clone(&self.tagger);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || tagger.tag(&path, &track, &album, picture.as_deref()))
            .await
            .map_err(|e| FlacTagError::Task(e.to_string()))?
    }
}
