// Transport abstraction module
//
// The pipeline never talks to the network directly. It pulls encrypted payloads from
// a StreamSource and cover art from a PictureSource; both are implemented here for
// memory (tests), local files and HTTP.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::debug;

use crate::metadata::{AudioFormat, TrackMetadata};

/// Size of one block of the encrypted payload
pub const BLOCK_SIZE: usize = 2048;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Timeout")]
    Timeout,
    #[error("Cancelled")]
    Cancelled,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport error: {0}")]
    Other(String),
}

/// Lazy, forward-only sequence of payload blocks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

pub type OpenFuture<'a> = Pin<Box<dyn Future<Output = Result<ChunkStream, TransportError>> + Send + 'a>>;
pub type PictureFuture<'a> = Pin<Box<dyn Future<Output = Result<Bytes, TransportError>> + Send + 'a>>;
pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<String, TransportError>> + Send + 'a>>;

/// Source of encrypted track payloads.
pub trait StreamSource {
    /// Opens the encrypted payload of `track` in the given format.
    ///
    /// The returned stream yields blocks of [`BLOCK_SIZE`] bytes, except possibly the last one.
    /// It can be consumed only once.
    fn open<'a>(&'a self, track: &'a TrackMetadata, format: AudioFormat) -> OpenFuture<'a>;
}

/// Source of cover pictures.
pub trait PictureSource {
    fn fetch_picture<'a>(&'a self, picture_ref: &'a str) -> PictureFuture<'a>;
}

/// Turns a track token into a downloadable media URL (licensing lives outside this crate).
pub trait MediaResolver: Send + Sync {
    fn resolve<'a>(&'a self, track_token: &'a str, format: AudioFormat) -> ResolveFuture<'a>;
}

impl<T: StreamSource + ?Sized> StreamSource for Box<T> {
    fn open<'a>(&'a self, track: &'a TrackMetadata, format: AudioFormat) -> OpenFuture<'a> {
        (**self).open(track, format)
    }
}

impl<T: StreamSource + ?Sized> StreamSource for Arc<T> {
    fn open<'a>(&'a self, track: &'a TrackMetadata, format: AudioFormat) -> OpenFuture<'a> {
        (**self).open(track, format)
    }
}

impl<T: PictureSource + ?Sized> PictureSource for Box<T> {
    fn fetch_picture<'a>(&'a self, picture_ref: &'a str) -> PictureFuture<'a> {
        (**self).fetch_picture(picture_ref)
    }
}

impl<T: PictureSource + ?Sized> PictureSource for Arc<T> {
    fn fetch_picture<'a>(&'a self, picture_ref: &'a str) -> PictureFuture<'a> {
        (**self).fetch_picture(picture_ref)
    }
}

/// Re-chunk an arbitrary byte stream into fixed-size blocks. Only the last block may be short.
pub fn into_blocks<S>(source: S, block_size: usize) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
{
    struct State<S> {
        source: Pin<Box<S>>,
        buffer: BytesMut,
        done: bool,
    }

    let state = State {
        source: Box::pin(source),
        buffer: BytesMut::with_capacity(block_size),
        done: false,
    };

    Box::pin(stream::unfold(state, move |mut state| async move {
        loop {
            if state.buffer.len() >= block_size {
                let block = state.buffer.split_to(block_size).freeze();
                return Some((Ok(block), state));
            }
            if state.done {
                if state.buffer.is_empty() {
                    return None;
                }
                let tail = state.buffer.split().freeze();
                return Some((Ok(tail), state));
            }
            match state.source.next().await {
                Some(Ok(bytes)) => state.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    // nothing is yielded after an error
                    state.done = true;
                    state.buffer.clear();
                    return Some((Err(e), state));
                }
                None => state.done = true,
            }
        }
    }))
}

/// Cancellation signal shared by a caller and the streams it may want to stop.
///
/// Cloning yields a handle to the same signal. `cancel` can be called from any
/// thread, including a signal handler outside the runtime.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // the sender lives in `self`, so this only fails after it is gone
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Wrap a stream so that cancelling `token` ends it with [`TransportError::Cancelled`],
/// even while the source is waiting for its next block.
pub fn with_cancel(source: ChunkStream, token: CancelToken) -> ChunkStream {
    Box::pin(stream::unfold((source, token, false), |(mut source, token, done)| async move {
        if done {
            return None;
        }
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            item = source.next() => Some(item),
        };
        match next {
            None => Some((Err(TransportError::Cancelled), (source, token, true))),
            Some(None) => None,
            Some(Some(item)) => Some((item, (source, token, false))),
        }
    }))
}

/// Stream source whose streams all stop once the shared token is cancelled.
pub struct Cancellable<S> {
    inner: S,
    token: CancelToken,
}

impl<S> Cancellable<S> {
    pub fn new(inner: S, token: CancelToken) -> Self {
        Self { inner, token }
    }
}

impl<S: StreamSource + Sync> StreamSource for Cancellable<S> {
    fn open<'a>(&'a self, track: &'a TrackMetadata, format: AudioFormat) -> OpenFuture<'a> {
        Box::pin(async move {
            if self.token.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let stream = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(TransportError::Cancelled),
                opened = self.inner.open(track, format) => opened?,
            };
            Ok(with_cancel(stream, self.token.clone()))
        })
    }
}

/// In-memory payloads and pictures, keyed by track token and picture ref.
#[derive(Debug, Default, Clone)]
pub struct MemoryTransport {
    payloads: HashMap<String, Bytes>,
    pictures: HashMap<String, Bytes>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(mut self, track_token: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        self.payloads.insert(track_token.into(), payload.into());
        self
    }

    pub fn with_picture(mut self, picture_ref: impl Into<String>, picture: impl Into<Bytes>) -> Self {
        self.pictures.insert(picture_ref.into(), picture.into());
        self
    }
}

impl StreamSource for MemoryTransport {
    fn open<'a>(&'a self, track: &'a TrackMetadata, _format: AudioFormat) -> OpenFuture<'a> {
        Box::pin(async move {
            let token = track
                .track_token()
                .ok_or_else(|| TransportError::NotFound("track has no token".to_string()))?;
            let payload = self
                .payloads
                .get(&token)
                .cloned()
                .ok_or(TransportError::NotFound(token))?;
            let blocks: Vec<Result<Bytes, TransportError>> = (0..payload.len())
                .step_by(BLOCK_SIZE)
                .map(|start| Ok(payload.slice(start..(start + BLOCK_SIZE).min(payload.len()))))
                .collect();
            Ok(Box::pin(stream::iter(blocks)) as ChunkStream)
        })
    }
}

impl PictureSource for MemoryTransport {
    fn fetch_picture<'a>(&'a self, picture_ref: &'a str) -> PictureFuture<'a> {
        Box::pin(async move {
            self.pictures
                .get(picture_ref)
                .cloned()
                .ok_or_else(|| TransportError::NotFound(picture_ref.to_string()))
        })
    }
}

/// Reads an already downloaded encrypted payload from disk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StreamSource for FileSource {
    fn open<'a>(&'a self, _track: &'a TrackMetadata, _format: AudioFormat) -> OpenFuture<'a> {
        Box::pin(async move {
            let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TransportError::NotFound(self.path.display().to_string())
                } else {
                    TransportError::Io(e)
                }
            })?;

            let blocks = stream::unfold(Some(file), |file| async move {
                let mut file = file?;
                let mut block = vec![0u8; BLOCK_SIZE];
                let mut filled = 0;
                while filled < BLOCK_SIZE {
                    match file.read(&mut block[filled..]).await {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) => return Some((Err(TransportError::Io(e)), None)),
                    }
                }
                if filled == 0 {
                    return None;
                }
                block.truncate(filled);
                let next = if filled == BLOCK_SIZE { Some(file) } else { None };
                Some((Ok(Bytes::from(block)), next))
            });
            Ok(Box::pin(blocks) as ChunkStream)
        })
    }
}

/// Resolver that always answers with the same URL.
#[derive(Debug, Clone)]
pub struct FixedUrl(pub String);

impl MediaResolver for FixedUrl {
    fn resolve<'a>(&'a self, _track_token: &'a str, _format: AudioFormat) -> ResolveFuture<'a> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

/// HTTP transport for media payloads and cover pictures.
pub struct HttpTransport {
    client: reqwest::Client,
    picture_timeout: Duration,
    cover_base_url: String,
    cover_size: u32,
    resolver: Option<Arc<dyn MediaResolver>>,
}

impl HttpTransport {
    /// The configured timeout bounds connecting and every idle gap while reading,
    /// never the length of a whole media download. Cover fetches also get it as an
    /// overall deadline.
    pub fn new(config: &crate::api::DownloadConfig) -> Result<Self, TransportError> {
        let timeout = Duration::from_secs(config.timeout_seconds());
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent().to_string())
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            picture_timeout: timeout,
            cover_base_url: config.cover_base_url().trim_end_matches('/').to_string(),
            cover_size: config.cover_size(),
            resolver: None,
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn MediaResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Cover URL for a picture ref, e.g. `<base>/cover/<ref>/1200x1200.jpg`
    pub fn picture_url(&self, picture_ref: &str) -> String {
        format!(
            "{}/cover/{}/{}x{}.jpg",
            self.cover_base_url, picture_ref, self.cover_size, self.cover_size
        )
    }

    async fn get(&self, url: &str, deadline: Option<Duration>) -> Result<reqwest::Response, TransportError> {
        let mut request = self.client.get(url);
        if let Some(deadline) = deadline {
            request = request.timeout(deadline);
        }
        let response = request.send().await.map_err(map_reqwest)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound(url.to_string()));
        }
        response.error_for_status().map_err(map_reqwest)
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(e)
    }
}

impl StreamSource for HttpTransport {
    fn open<'a>(&'a self, track: &'a TrackMetadata, format: AudioFormat) -> OpenFuture<'a> {
        Box::pin(async move {
            let resolver = self
                .resolver
                .as_ref()
                .ok_or_else(|| TransportError::Other("no media resolver configured".to_string()))?;
            let token = track
                .track_token()
                .ok_or_else(|| TransportError::NotFound("track has no token".to_string()))?;
            let url = resolver.resolve(&token, format).await?;
            debug!(format = format.as_str(), "opening media stream");

            let response = self.get(&url, None).await?;
            let body = response.bytes_stream().map(|item| item.map_err(map_reqwest));
            Ok(into_blocks(body, BLOCK_SIZE))
        })
    }
}

impl PictureSource for HttpTransport {
    fn fetch_picture<'a>(&'a self, picture_ref: &'a str) -> PictureFuture<'a> {
        Box::pin(async move {
            let url = self.picture_url(picture_ref);
            let response = self.get(&url, Some(self.picture_timeout)).await?;
            response.bytes().await.map_err(map_reqwest)
        })
    }
}
