// Command-line front-end: decrypt and tag one track from a metadata record

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use libbfstripe::metadata::{fields, Fields};
use libbfstripe::transport::FixedUrl;
use libbfstripe::{
    AlbumMetadata, AudioFormat, CancelToken, Cancellable, DownloadConfigBuilder, FileSource, HttpTransport, QualityPreference,
    Stage, StreamSource, TrackDownloader, TrackMetadata,
};

#[derive(Parser)]
#[command(name = "bfstripe")]
#[command(about = "Decrypt a striped Blowfish media stream and tag the result", long_about = None)]
struct Cli {
    /// Track metadata record (JSON object)
    #[arg(long)]
    track: PathBuf,

    /// Album metadata record (JSON object)
    #[arg(long)]
    album: Option<PathBuf>,

    /// Encrypted payload already on disk
    #[arg(short, long, conflicts_with = "url", required_unless_present = "url")]
    input: Option<PathBuf>,

    /// URL of the encrypted payload
    #[arg(long)]
    url: Option<String>,

    /// Output file, or an existing directory to place "<artist> - <title>" in
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Preferred quality; falls back to what the track offers
    #[arg(short, long, value_enum, default_value = "mp3")]
    quality: Quality,

    /// Do not download cover art
    #[arg(long)]
    no_cover: bool,

    /// HTTP timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Quality {
    Flac,
    Mp3,
}

impl From<Quality> for QualityPreference {
    fn from(quality: Quality) -> Self {
        match quality {
            Quality::Flac => QualityPreference::Flac,
            Quality::Mp3 => QualityPreference::Mp3,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Keep path separators and control characters out of generated file names
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect()
}

fn output_path(output: &Path, track: &TrackMetadata, format: AudioFormat) -> PathBuf {
    if !output.is_dir() {
        return output.to_path_buf();
    }
    let artist = track.text(fields::ART_NAME).unwrap_or_else(|| "Unknown".to_string());
    let title = track.text(fields::SNG_TITLE).unwrap_or_else(|| "Unknown".to_string());
    output.join(format!("{}{}", sanitize(&format!("{artist} - {title}")), format.extension()))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let track: TrackMetadata = read_json(&cli.track)?;
    let album: AlbumMetadata = match &cli.album {
        Some(path) => read_json(path)?,
        None => AlbumMetadata::default(),
    };

    let config = DownloadConfigBuilder::new()
        .quality(cli.quality.into())
        .fetch_cover(!cli.no_cover)
        .timeout_seconds(cli.timeout)
        .build();

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("installing Ctrl-C handler")?;
    }

    let streams: Box<dyn StreamSource + Send + Sync> = match (&cli.input, &cli.url) {
        (Some(path), _) => Box::new(FileSource::new(path)),
        (None, Some(url)) => Box::new(HttpTransport::new(&config)?.with_resolver(Arc::new(FixedUrl(url.clone())))),
        (None, None) => anyhow::bail!("either --input or --url is required"),
    };
    let pictures = HttpTransport::new(&config)?;
    let downloader = TrackDownloader::new(config, Cancellable::new(streams, cancel), pictures);

    let format = downloader.format_for(&track);
    let path = output_path(&cli.output, &track, format);
    info!(path = %path.display(), format = format.as_str(), "downloading");

    match downloader.download_to_path(&track, &album, format, &path).await {
        Ok(report) => {
            info!(
                bytes = report.total_bytes(),
                chunks = report.chunks,
                decrypted = report.decrypted_chunks,
                fallback = report.used_fallback,
                "done"
            );
            Ok(())
        }
        Err(e) => {
            // the output was created by this run unless creating it is what failed
            if e.stage() != Stage::CreateOutput {
                if let Err(remove_err) = std::fs::remove_file(&path) {
                    error!(path = %path.display(), error = %remove_err, "could not remove partial file");
                }
            }
            Err(anyhow::Error::new(e).context(format!("downloading to {}", path.display())))
        }
    }
}
