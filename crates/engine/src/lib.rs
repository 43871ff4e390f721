//! Tidal streaming engine
//!
//! HLS downloading with parallel segment fetches and an ffmpeg merge step,
//! plus relaying of HLS or HTTP-FLV sources to an RTMP ingest server.

pub mod config;
pub mod error;
pub mod hls;
pub mod http;
pub mod publisher;
pub mod relay;
pub mod remux;
pub mod retry;
pub mod tls;

#[cfg(test)]
mod testing;

pub use config::DownloaderConfig;
pub use error::TidalError;
pub use hls::{DownloadConfig, HlsDownloader, Progress};
pub use publisher::{PublishError, PublishState, PublisherConfig, RtmpPublisher};
pub use relay::{RelayConfig, StreamRelay};
pub use retry::RetryPolicy;
