// HLS Downloader: fetches every segment of a VOD playlist into a temp dir and remuxes to MP4.
//
// Layout of the temp dir:
//   variant.m3u8   raw master playlist (when the source is one)
//   index.m3u8     raw media playlist
//   playlist.m3u8  media playlist rewritten to the local `{n}.{ext}` files
//   1.ts, 2.ts ... segments named by 1-based playlist position

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use m3u8_rs::{MediaPlaylist, Playlist};
use parking_lot::Mutex;
use process_utils::ProcessManager;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::playlist::is_vod;
use super::scheduler::{SchedulerConfig, SchedulerHooks, SegmentJob, SegmentScheduler};
use crate::TidalError;
use crate::config::DownloaderConfig;
use crate::http::{HttpClient, ResourceFetcher};
use crate::remux::{DEFAULT_FFMPEG_PATH, remux_playlist};

pub const DEFAULT_PROGRESS_CAPACITY: usize = 1000;
const DEFAULT_SEGMENT_EXTENSION: &str = "ts";

/// Completed segments against the playlist total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub downloaded: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Output file stem, the artifact is `{output_dir}/{name}.mp4`
    pub name: String,
    pub output_dir: PathBuf,
    /// Defaults to `{output_dir}/temp`
    pub temp_dir: Option<PathBuf>,
    pub num_parallel: usize,
    /// Remove the temp dir after a successful remux
    pub auto_cleanup: bool,
    pub progress_capacity: usize,
    pub ffmpeg_path: PathBuf,
    pub http: DownloaderConfig,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            name: "output".to_string(),
            output_dir: PathBuf::from("."),
            temp_dir: None,
            num_parallel: 1,
            auto_cleanup: true,
            progress_capacity: DEFAULT_PROGRESS_CAPACITY,
            ffmpeg_path: PathBuf::from(DEFAULT_FFMPEG_PATH),
            http: DownloaderConfig::default(),
        }
    }
}

impl DownloadConfig {
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join("temp"))
    }
}

/// Downloads a VOD HLS stream into a single MP4.
pub struct HlsDownloader {
    uri: String,
    config: DownloadConfig,
    fetcher: Option<Arc<dyn ResourceFetcher>>,
    processes: ProcessManager,
    token: CancellationToken,
    progress: mpsc::Sender<Progress>,
}

impl HlsDownloader {
    /// Create a downloader and the receiving end of its progress channel. The
    /// channel closes when [`HlsDownloader::download`] returns.
    pub fn new(uri: impl Into<String>, config: DownloadConfig) -> (Self, mpsc::Receiver<Progress>) {
        let (progress, rx) = mpsc::channel(config.progress_capacity.max(1));
        let downloader = Self {
            uri: uri.into(),
            config,
            fetcher: None,
            processes: ProcessManager::new(),
            token: CancellationToken::new(),
            progress,
        };
        (downloader, rx)
    }

    /// Use `fetcher` instead of an HTTP client built from the config.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_process_manager(mut self, processes: ProcessManager) -> Self {
        self.processes = processes;
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Download, remux and return the path of the MP4.
    pub async fn download(self) -> Result<PathBuf, TidalError> {
        let started = Instant::now();
        let url = Url::parse(self.uri.trim())
            .map_err(|e| TidalError::invalid_url(&self.uri, e.to_string()))?;
        let temp_dir = self.config.temp_dir();

        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        tokio::fs::create_dir_all(&temp_dir).await?;

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpClient::new(&self.config.http)?),
        };
        let hooks = Arc::new(DownloadHooks::new(temp_dir.clone(), self.progress));

        info!(url = %url, dir = %temp_dir.display(), "Starting HLS download");
        let mut scheduler = SegmentScheduler::new(
            url,
            SchedulerConfig {
                num_parallel: self.config.num_parallel,
                ..Default::default()
            },
            fetcher,
            hooks.clone(),
            self.token.clone(),
        );
        scheduler.run().await?;
        drop(scheduler);
        let progress = hooks.snapshot();
        // closes the progress channel
        drop(hooks);

        if progress.total == 0 {
            return Err(TidalError::playlist("playlist has no segments"));
        }
        info!(
            segments = progress.total,
            elapsed = ?started.elapsed(),
            "Download completed"
        );

        let file_name = format!("{}.mp4", self.config.name);
        let merged = remux_playlist(
            &self.processes,
            &self.config.ffmpeg_path,
            &temp_dir,
            PLAYLIST_FILE,
            &file_name,
            &self.token,
        )
        .await?;

        let destination = self.config.output_dir.join(&file_name);
        tokio::fs::rename(&merged, &destination).await?;
        info!(path = %destination.display(), elapsed = ?started.elapsed(), "Merged to MP4");

        if self.config.auto_cleanup {
            tokio::fs::remove_dir_all(&temp_dir).await?;
            debug!(dir = %temp_dir.display(), "temp dir removed");
        }
        Ok(destination)
    }
}

const VARIANT_FILE: &str = "variant.m3u8";
const INDEX_FILE: &str = "index.m3u8";
const PLAYLIST_FILE: &str = "playlist.m3u8";

/// Extension of the segment URI path, without query or fragment.
pub fn segment_extension(uri: &str) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or_default();
    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => DEFAULT_SEGMENT_EXTENSION.to_string(),
    }
}

/// Local file name of the segment at `position`.
pub fn segment_file_name(position: usize, ext: &str) -> String {
    format!("{}.{ext}", position + 1)
}

/// Copy of `playlist` with every segment URI pointing at its local file.
pub fn rewrite_local(playlist: &MediaPlaylist, ext: &str) -> MediaPlaylist {
    let mut local = playlist.clone();
    for (position, segment) in local.segments.iter_mut().enumerate() {
        segment.uri = segment_file_name(position, ext);
    }
    local
}

struct DownloadHooks {
    temp_dir: PathBuf,
    extension: Mutex<Option<String>>,
    total: AtomicUsize,
    downloaded: AtomicUsize,
    progress: mpsc::Sender<Progress>,
}

impl DownloadHooks {
    fn new(temp_dir: PathBuf, progress: mpsc::Sender<Progress>) -> Self {
        Self {
            temp_dir,
            extension: Mutex::new(None),
            total: AtomicUsize::new(0),
            downloaded: AtomicUsize::new(0),
            progress,
        }
    }

    fn snapshot(&self) -> Progress {
        Progress {
            downloaded: self.downloaded.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
        }
    }

    fn extension(&self) -> String {
        self.extension
            .lock()
            .clone()
            .unwrap_or_else(|| DEFAULT_SEGMENT_EXTENSION.to_string())
    }

    async fn write_media_playlist(
        &self,
        raw: &Bytes,
        playlist: &MediaPlaylist,
    ) -> Result<(), TidalError> {
        if !is_vod(playlist) {
            return Err(TidalError::playlist(
                "live playlists cannot be downloaded, only VOD",
            ));
        }

        let ext = playlist
            .segments
            .first()
            .map(|s| segment_extension(&s.uri))
            .unwrap_or_else(|| DEFAULT_SEGMENT_EXTENSION.to_string());
        debug!(ext = %ext, "segment extension");
        *self.extension.lock() = Some(ext.clone());
        self.total.store(playlist.segments.len(), Ordering::SeqCst);

        let mut local = Vec::new();
        rewrite_local(playlist, &ext).write_to(&mut local)?;
        write_atomic(&self.temp_dir.join(PLAYLIST_FILE), &local).await?;
        write_atomic(&self.temp_dir.join(INDEX_FILE), raw).await?;
        Ok(())
    }

    async fn report(&self) {
        let downloaded = self.downloaded.fetch_add(1, Ordering::SeqCst) + 1;
        let progress = Progress {
            downloaded,
            total: self.total.load(Ordering::SeqCst),
        };
        debug!(downloaded, total = progress.total, "progress");
        if self.progress.send(progress).await.is_err() {
            debug!("progress receiver dropped");
        }
    }
}

#[async_trait]
impl SchedulerHooks for DownloadHooks {
    async fn on_playlist(&self, raw: &Bytes, playlist: &Playlist) -> Result<(), TidalError> {
        match playlist {
            Playlist::MasterPlaylist(_) => {
                write_atomic(&self.temp_dir.join(VARIANT_FILE), raw).await
            }
            Playlist::MediaPlaylist(media) => self.write_media_playlist(raw, media).await,
        }
    }

    async fn fetch_segment(
        &self,
        job: &SegmentJob,
        fetcher: &dyn ResourceFetcher,
        token: &CancellationToken,
    ) -> Result<(), TidalError> {
        let path = self
            .temp_dir
            .join(segment_file_name(job.position, &self.extension()));

        if tokio::fs::try_exists(&path).await? {
            debug!(path = %path.display(), "File exists, skip downloading");
        } else {
            let data = fetcher.fetch(&job.url, token).await?;
            write_atomic(&path, &data).await.inspect_err(|e| {
                warn!(path = %path.display(), error = %e, "failed to write segment");
            })?;
        }

        self.report().await;
        Ok(())
    }
}

/// Write to `{path}.part` and rename into place.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), TidalError> {
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);
    tokio::fs::write(&part, data).await?;
    tokio::fs::rename(&part, path).await?;
    Ok(())
}
