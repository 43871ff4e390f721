//! HLS support: playlist rules, the segment scheduler and the VOD downloader.

pub mod downloader;
pub mod playlist;
pub mod pool;
pub mod scheduler;

pub use downloader::{DownloadConfig, HlsDownloader, Progress};
pub use pool::FetchPool;
pub use scheduler::{SchedulerConfig, SchedulerHooks, SegmentJob, SegmentScheduler};
