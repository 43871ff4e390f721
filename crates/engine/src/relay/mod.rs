//! Stream relay: pull an HLS or HTTP-FLV source and republish it over RTMP.

pub mod detect;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flv::FlvTagReader;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Response;
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use ts::{EsFrame, TsDemuxer};
use url::Url;

pub use detect::{SourceKind, detect_source};

use crate::TidalError;
use crate::config::DownloaderConfig;
use crate::hls::playlist::DEFAULT_LIVE_START_INDEX;
use crate::hls::scheduler::{SchedulerConfig, SchedulerHooks, SegmentJob, SegmentScheduler};
use crate::http::HttpClient;
use crate::publisher::{AudioCodec, PublishError, PublisherConfig, RtmpPublisher, VideoCodec};

/// MPEG-TS clock rate per millisecond.
const TS_TICKS_PER_MS: u64 = 90;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub http: DownloaderConfig,
    pub publisher: PublisherConfig,
    /// Where to join a live HLS source, see [`SchedulerConfig`]
    pub live_start_index: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http: DownloaderConfig::default(),
            publisher: PublisherConfig::default(),
            live_start_index: DEFAULT_LIVE_START_INDEX,
        }
    }
}

/// One relay session. The token is cancelled when [`StreamRelay::run`]
/// returns, which tears down the publisher and any scheduler.
pub struct StreamRelay {
    source: String,
    destination: String,
    config: RelayConfig,
    token: CancellationToken,
}

impl StreamRelay {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        config: RelayConfig,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            config,
            token: CancellationToken::new(),
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn stop(&self) {
        info!(source = %self.source, "Stopping relay");
        self.token.cancel();
    }

    /// Relay until the source ends, a fatal error occurs or the session is
    /// cancelled (`Err(Cancelled)`).
    pub async fn run(&self) -> Result<(), TidalError> {
        let result = self.relay().await;
        self.token.cancel();
        match &result {
            Ok(()) => info!(source = %self.source, "Relay finished"),
            Err(TidalError::Cancelled) => info!(source = %self.source, "Relay cancelled"),
            Err(e) => warn!(source = %self.source, error = %e, "Relay failed"),
        }
        result
    }

    async fn relay(&self) -> Result<(), TidalError> {
        let source = self.source.trim();
        if source.is_empty() {
            return Err(TidalError::invalid_url(source, "source is empty"));
        }
        let source_url =
            Url::parse(source).map_err(|e| TidalError::invalid_url(source, e.to_string()))?;
        if !matches!(source_url.scheme(), "http" | "https") {
            return Err(TidalError::UnsupportedProtocol {
                protocol: source_url.scheme().to_string(),
            });
        }

        let destination = self.destination.trim();
        let scheme = destination
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        if scheme != "rtmp" && scheme != "rtmps" {
            return Err(TidalError::UnsupportedProtocol {
                protocol: if scheme.is_empty() {
                    destination.to_string()
                } else {
                    scheme
                },
            });
        }

        let publisher = Arc::new(
            RtmpPublisher::start(destination, self.config.publisher.clone(), self.token.clone())
                .await
                .map_err(publish_error)?,
        );

        let result = self.relay_source(&source_url, publisher.clone()).await;
        publisher.close().await;
        match (result, publisher.take_failure()) {
            // the pump cancelled the session, report why
            (Err(TidalError::Cancelled), Some(source)) => Err(TidalError::Publish { source }),
            (result, _) => result,
        }
    }

    async fn relay_source(
        &self,
        source_url: &Url,
        publisher: Arc<RtmpPublisher>,
    ) -> Result<(), TidalError> {
        let client = Arc::new(HttpClient::new(&self.config.http)?);
        let response = client.open(source_url, &self.token).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let final_url = response.url().clone();

        let kind = detect_source(content_type.as_deref(), &final_url)
            .or_else(|| detect_source(None, source_url))
            .ok_or_else(|| TidalError::UnsupportedContentType {
                content_type: content_type.clone().unwrap_or_default(),
                url: final_url.to_string(),
            })?;
        info!(
            url = %final_url,
            kind = ?kind,
            content_type = content_type.as_deref().unwrap_or(""),
            "Relaying source"
        );

        match kind {
            SourceKind::Hls => {
                drop(response);
                self.relay_hls(final_url, client, publisher).await
            }
            SourceKind::Flv => self.relay_flv(response, &publisher).await,
        }
    }

    async fn relay_hls(
        &self,
        playlist_url: Url,
        client: Arc<HttpClient>,
        publisher: Arc<RtmpPublisher>,
    ) -> Result<(), TidalError> {
        let hooks = Arc::new(TsRelayHooks::new(publisher));
        let mut scheduler = SegmentScheduler::new(
            playlist_url,
            SchedulerConfig {
                live_start_index: self.config.live_start_index,
                num_parallel: 1,
            },
            client,
            hooks.clone(),
            self.token.clone(),
        );
        scheduler.run().await?;
        hooks.flush()
    }

    async fn relay_flv(
        &self,
        response: Response,
        publisher: &RtmpPublisher,
    ) -> Result<(), TidalError> {
        let mut reader = FlvTagReader::new();
        let mut body = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(TidalError::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                info!(tags = reader.tags_read(), "FLV source ended");
                return Ok(());
            };
            let chunk = chunk?;

            let mut failure = None;
            reader.push(&chunk, |tag| {
                if failure.is_some() || !(tag.is_audio_tag() || tag.is_video_tag()) {
                    return;
                }
                if let Err(e) = publisher.write_frame(&tag) {
                    failure = Some(e);
                }
            })?;
            if let Some(e) = failure {
                return Err(publish_error(e));
            }
        }
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn publish_error(e: PublishError) -> TidalError {
    match e {
        PublishError::Cancelled => TidalError::Cancelled,
        PublishError::Timeout => TidalError::Timeout {
            reason: "RTMP server did not accept publishing".to_string(),
        },
        other => TidalError::from(other),
    }
}

/// Demuxes fetched TS segments and forwards the frames to the publisher.
struct TsRelayHooks {
    demuxer: Mutex<TsDemuxer>,
    publisher: Arc<RtmpPublisher>,
}

impl TsRelayHooks {
    fn new(publisher: Arc<RtmpPublisher>) -> Self {
        Self {
            demuxer: Mutex::new(TsDemuxer::new()),
            publisher,
        }
    }

    fn forward(&self, frame: &EsFrame) -> Result<(), PublishError> {
        let pts = frame.pts / TS_TICKS_PER_MS;
        let dts = frame.dts / TS_TICKS_PER_MS;
        if let Some(codec) = VideoCodec::from_stream_type(frame.stream_type) {
            self.publisher.write_video(codec, &frame.payload, pts, dts)
        } else if let Some(codec) = AudioCodec::from_stream_type(frame.stream_type) {
            self.publisher.write_audio(codec, &frame.payload, pts, dts)
        } else {
            trace!(pid = frame.pid, stream_type = ?frame.stream_type, "skipping stream");
            Ok(())
        }
    }

    fn demux(&self, data: &[u8], flush: bool) -> Result<(), TidalError> {
        let mut demuxer = self.demuxer.lock();
        let mut failure = None;
        let mut on_frame = |frame: EsFrame| {
            if failure.is_none()
                && let Err(e) = self.forward(&frame)
            {
                failure = Some(e);
            }
        };
        if flush {
            demuxer.flush(&mut on_frame)?;
        } else {
            demuxer.input(data, &mut on_frame)?;
        }
        failure.map_or(Ok(()), |e| Err(publish_error(e)))
    }

    fn flush(&self) -> Result<(), TidalError> {
        self.demux(&[], true)
    }
}

#[async_trait]
impl SchedulerHooks for TsRelayHooks {
    async fn on_segment(&self, data: Bytes, job: &SegmentJob) -> Result<(), TidalError> {
        debug!(sequence = job.sequence, len = data.len(), "demuxing segment");
        self.demux(&data, false)
    }
}
