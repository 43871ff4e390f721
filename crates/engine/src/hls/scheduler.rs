// HLS Segment Scheduler: drives a playlist to completion and hands each segment to the hooks.
//
// Picks the leading variant of a master playlist, chooses where to start on a
// live playlist, and reloads live playlists until ENDLIST or cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use m3u8_rs::{MediaPlaylist, MediaSegment, Playlist};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::playlist::{
    DEFAULT_LIVE_START_INDEX, default_reload_interval, is_vod, parse_playlist, reload_interval,
    resolve_url, select_start_sequence, select_variant,
};
use super::pool::FetchPool;
use crate::TidalError;
use crate::http::ResourceFetcher;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Segment index to start live streams at; negative counts from the end.
    pub live_start_index: i64,
    /// Concurrent segment fetches for VOD. Live playlists always use one.
    pub num_parallel: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            live_start_index: DEFAULT_LIVE_START_INDEX,
            num_parallel: 1,
        }
    }
}

/// One unit of segment work.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    /// Absolute segment URL
    pub url: Url,
    /// Media sequence number of the segment
    pub sequence: u64,
    /// 0-based position in the playlist snapshot it was taken from
    pub position: usize,
    pub segment: MediaSegment,
}

/// Callbacks invoked by [`SegmentScheduler`]. Every method has a default.
#[async_trait]
pub trait SchedulerHooks: Send + Sync + 'static {
    /// Called for every playlist fetched, master or media, initial or reload.
    async fn on_playlist(&self, _raw: &Bytes, _playlist: &Playlist) -> Result<(), TidalError> {
        Ok(())
    }

    /// Called with the body of each fetched segment.
    async fn on_segment(&self, _data: Bytes, _job: &SegmentJob) -> Result<(), TidalError> {
        Ok(())
    }

    /// Fetch one segment. Override to skip or redirect the fetch.
    async fn fetch_segment(
        &self,
        job: &SegmentJob,
        fetcher: &dyn ResourceFetcher,
        token: &CancellationToken,
    ) -> Result<(), TidalError> {
        let data = fetcher.fetch(&job.url, token).await?;
        self.on_segment(data, job).await
    }
}

/// Playlist-driven segment scheduler. One instance per run.
pub struct SegmentScheduler {
    playlist_url: Url,
    config: SchedulerConfig,
    fetcher: Arc<dyn ResourceFetcher>,
    hooks: Arc<dyn SchedulerHooks>,
    token: CancellationToken,
    last_load: Option<Instant>,
    watermark: Option<u64>,
}

impl SegmentScheduler {
    pub fn new(
        url: Url,
        config: SchedulerConfig,
        fetcher: Arc<dyn ResourceFetcher>,
        hooks: Arc<dyn SchedulerHooks>,
        token: CancellationToken,
    ) -> Self {
        Self {
            playlist_url: url,
            config,
            fetcher,
            hooks,
            token,
            last_load: None,
            watermark: None,
        }
    }

    /// URL of the working media playlist once a variant was chosen.
    pub fn playlist_url(&self) -> &Url {
        &self.playlist_url
    }

    /// Highest segment sequence dispatched so far.
    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Run to completion (VOD) or until ENDLIST or cancellation (live).
    pub async fn run(&mut self) -> Result<(), TidalError> {
        info!(url = %self.playlist_url, "Starting HLS scheduler");

        let media = self.load_initial().await?;
        let vod = is_vod(&media);
        let parallel = if vod { self.config.num_parallel.max(1) } else { 1 };
        debug!(vod, parallel, segments = media.segments.len(), "media playlist loaded");

        let mut pool = FetchPool::new(parallel, &self.token).fail_fast(vod);
        let outcome = self.drive(&mut pool, media, vod).await;
        let failures = pool.join().await;

        if self.token.is_cancelled() {
            info!(url = %self.playlist_url, "HLS scheduler cancelled");
            return Err(TidalError::Cancelled);
        }

        let first_failure = failures.into_iter().next();
        match (outcome, first_failure) {
            (Ok(()), None) => {
                info!(url = %self.playlist_url, watermark = ?self.watermark, "HLS scheduler finished");
                Ok(())
            }
            // pool admission closed by a failing segment
            (Ok(()), Some(err)) | (Err(TidalError::Cancelled), Some(err)) => Err(err),
            (Err(err), _) => Err(err),
        }
    }

    async fn load_initial(&mut self) -> Result<MediaPlaylist, TidalError> {
        let url = self.playlist_url.clone();
        let raw = self.fetch_playlist(&url).await?;
        let playlist = parse_playlist(&raw, &url)?;
        self.hooks.on_playlist(&raw, &playlist).await?;

        match playlist {
            Playlist::MediaPlaylist(media) => Ok(media),
            Playlist::MasterPlaylist(master) => {
                let variant = select_variant(&master).ok_or(TidalError::NoSupportedVariant)?;
                let variant_url = resolve_url(&variant.uri, &url)?;
                info!(
                    url = %variant_url,
                    bandwidth = variant.bandwidth,
                    codecs = variant.codecs.as_deref().unwrap_or(""),
                    "Selected leading variant"
                );
                self.playlist_url = variant_url;
                self.load_media_playlist().await
            }
        }
    }

    async fn load_media_playlist(&mut self) -> Result<MediaPlaylist, TidalError> {
        let url = self.playlist_url.clone();
        let raw = self.fetch_playlist(&url).await?;
        let playlist = parse_playlist(&raw, &url)?;
        self.hooks.on_playlist(&raw, &playlist).await?;
        match playlist {
            Playlist::MediaPlaylist(media) => Ok(media),
            Playlist::MasterPlaylist(_) => Err(TidalError::playlist(format!(
                "expected media playlist, got master for {url}"
            ))),
        }
    }

    async fn fetch_playlist(&mut self, url: &Url) -> Result<Bytes, TidalError> {
        let raw = self.fetcher.fetch(url, &self.token).await?;
        self.last_load = Some(Instant::now());
        Ok(raw)
    }

    async fn drive(
        &mut self,
        pool: &mut FetchPool,
        media: MediaPlaylist,
        vod: bool,
    ) -> Result<(), TidalError> {
        if let Some(start) = select_start_sequence(&media, self.config.live_start_index) {
            debug!(start, "starting sequence selected");
            self.dispatch(pool, &media, start, vod).await?;
        }
        if vod {
            return Ok(());
        }

        let mut interval = default_reload_interval(&media)?;
        loop {
            let deadline = self
                .last_load
                .unwrap_or_else(Instant::now)
                .checked_add(interval)
                .ok_or_else(|| {
                    TidalError::playlist(format!("reload interval {interval:?} out of range"))
                })?;
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(TidalError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let media = self.load_media_playlist().await?;
            interval = reload_interval(&media, self.watermark)?;

            let from = match self.watermark {
                Some(mark) => Some(mark + 1),
                None => select_start_sequence(&media, self.config.live_start_index),
            };
            if let Some(from) = from {
                self.dispatch(pool, &media, from, false).await?;
            }

            if media.end_list {
                info!(url = %self.playlist_url, "Playlist ended, no more media segments");
                return Ok(());
            }
            debug!(interval_ms = interval.as_millis() as u64, "next playlist reload");
        }
    }

    /// Submit every segment with a sequence at or above `from`, in playlist order.
    async fn dispatch(
        &mut self,
        pool: &mut FetchPool,
        media: &MediaPlaylist,
        from: u64,
        vod: bool,
    ) -> Result<(), TidalError> {
        for (position, segment) in media.segments.iter().enumerate() {
            let sequence = media.media_sequence + position as u64;
            if sequence < from {
                continue;
            }

            let url = match resolve_url(&segment.uri, &self.playlist_url) {
                Ok(url) => url,
                Err(e) if !vod => {
                    warn!(sequence, error = %e, "Skipping segment with invalid URI");
                    self.watermark = Some(sequence);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let job = SegmentJob {
                url,
                sequence,
                position,
                segment: segment.clone(),
            };
            let hooks = self.hooks.clone();
            let fetcher = self.fetcher.clone();
            let token = self.token.clone();
            pool.submit(async move {
                match hooks.fetch_segment(&job, fetcher.as_ref(), &token).await {
                    Ok(()) => Ok(()),
                    Err(e) if vod => Err(e),
                    Err(TidalError::Cancelled) => Ok(()),
                    Err(e) => {
                        warn!(sequence = job.sequence, url = %job.url, error = %e, "Segment failed, skipping");
                        Ok(())
                    }
                }
            })
            .await?;
            self.watermark = Some(sequence);
        }
        Ok(())
    }
}
