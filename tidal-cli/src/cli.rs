use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tidal_engine::config::parse_header_line;
use tidal_engine::hls::downloader::DEFAULT_PROGRESS_CAPACITY;
use tidal_engine::hls::playlist::DEFAULT_LIVE_START_INDEX;
use tidal_engine::remux::DEFAULT_FFMPEG_PATH;
use tidal_engine::{DownloadConfig, DownloaderConfig, PublisherConfig, RelayConfig};

use crate::error::{AppError, Result};

#[derive(Parser, Debug)]
#[command(
    name = "tidal",
    author,
    version,
    about = "Download HLS streams or relay HLS/FLV sources to RTMP",
    long_about = None
)]
pub struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download a VOD HLS stream and merge it into an MP4 file
    Download {
        /// Playlist URL (master or media)
        url: String,

        /// Directory receiving the final file
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Output file name without extension
        #[arg(short, long, default_value = "output")]
        name: String,

        /// Segments fetched in parallel
        #[arg(short = 'j', long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..=64))]
        parallel: u16,

        /// Segment directory, defaults to `{output_dir}/temp`
        #[arg(long)]
        temp_dir: Option<PathBuf>,

        /// Keep the segment directory after merging
        #[arg(long)]
        keep_temp: bool,

        /// ffmpeg executable used for the final remux
        #[arg(long, default_value = DEFAULT_FFMPEG_PATH)]
        ffmpeg: PathBuf,

        /// How progress is reported
        #[arg(long, value_enum, default_value_t = ProgressFormat::Bar)]
        progress: ProgressFormat,

        #[command(flatten)]
        http: HttpArgs,
    },

    /// Relay an HLS or HTTP-FLV source to an RTMP server
    Relay {
        /// Source URL (HLS playlist or HTTP-FLV)
        source: String,

        /// Destination, `rtmp://host[:port]/app/stream_key`
        destination: String,

        /// Segment to join a live HLS source at, negative counts from the live edge
        #[arg(long, default_value_t = DEFAULT_LIVE_START_INDEX, allow_hyphen_values = true)]
        live_start_index: i64,

        /// Seconds to wait for the RTMP server to accept publishing
        #[arg(long)]
        ready_timeout: Option<u64>,

        #[command(flatten)]
        http: HttpArgs,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ProgressFormat {
    /// Interactive progress bar
    Bar,
    /// One JSON object per completed segment on stdout
    Json,
    /// No progress output
    None,
}

#[derive(clap::Args, Debug)]
pub struct HttpArgs {
    /// Extra request header, `Key: Value` (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,

    /// Override the User-Agent header
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub connect_timeout: u64,

    /// Retries per request
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
}

impl HttpArgs {
    pub fn to_config(&self) -> Result<DownloaderConfig> {
        let headers = self
            .headers
            .iter()
            .map(|line| {
                parse_header_line(line)
                    .ok_or_else(|| AppError::InvalidInput(format!("Invalid header format: {line}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut config = DownloaderConfig::default().with_headers(headers)?;
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = user_agent.clone();
        }
        config.connect_timeout = Duration::from_secs(self.connect_timeout);
        config.retry.max_retries = self.retries;
        Ok(config)
    }
}

pub fn download_config(
    output_dir: PathBuf,
    name: String,
    parallel: u16,
    temp_dir: Option<PathBuf>,
    keep_temp: bool,
    ffmpeg: PathBuf,
    http: DownloaderConfig,
) -> Result<DownloadConfig> {
    let name = name.trim();
    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(AppError::InvalidInput(format!("Invalid output name: {name:?}")));
    }
    Ok(DownloadConfig {
        name: name.to_string(),
        output_dir,
        temp_dir,
        num_parallel: usize::from(parallel),
        auto_cleanup: !keep_temp,
        progress_capacity: DEFAULT_PROGRESS_CAPACITY,
        ffmpeg_path: ffmpeg,
        http,
    })
}

pub fn relay_config(
    live_start_index: i64,
    ready_timeout: Option<u64>,
    http: DownloaderConfig,
) -> RelayConfig {
    RelayConfig {
        http,
        publisher: PublisherConfig {
            ready_timeout: ready_timeout.map(Duration::from_secs),
            ..PublisherConfig::default()
        },
        live_start_index,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_download() {
        let args = Args::try_parse_from([
            "tidal",
            "download",
            "https://cdn.example.com/vod/index.m3u8",
            "-o",
            "/tmp/out",
            "-j",
            "4",
            "-H",
            "Referer: https://example.com/",
            "--progress",
            "json",
        ])
        .unwrap();
        match args.command {
            Commands::Download {
                url,
                output_dir,
                parallel,
                progress,
                http,
                ..
            } => {
                assert_eq!(url, "https://cdn.example.com/vod/index.m3u8");
                assert_eq!(output_dir, PathBuf::from("/tmp/out"));
                assert_eq!(parallel, 4);
                assert_eq!(progress, ProgressFormat::Json);
                let config = http.to_config().unwrap();
                assert_eq!(config.headers["referer"], "https://example.com/");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn relay_accepts_negative_start_index() {
        let args = Args::try_parse_from([
            "tidal",
            "relay",
            "https://cdn.example.com/live/index.m3u8",
            "rtmp://127.0.0.1/live/key",
            "--live-start-index",
            "-5",
            "--ready-timeout",
            "10",
        ])
        .unwrap();
        let Commands::Relay {
            live_start_index,
            ready_timeout,
            http,
            ..
        } = args.command
        else {
            panic!("expected relay");
        };
        let config = relay_config(live_start_index, ready_timeout, http.to_config().unwrap());
        assert_eq!(config.live_start_index, -5);
        assert_eq!(config.publisher.ready_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn rejects_malformed_header() {
        let http = HttpArgs {
            headers: vec!["no colon here".to_string()],
            user_agent: None,
            connect_timeout: 30,
            retries: 3,
        };
        assert!(matches!(http.to_config(), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn rejects_zero_parallelism() {
        assert!(
            Args::try_parse_from(["tidal", "download", "https://a/b.m3u8", "-j", "0"]).is_err()
        );
    }

    #[test]
    fn output_name_must_be_a_file_stem() {
        let http = DownloaderConfig::default();
        let result = download_config(
            PathBuf::from("."),
            "../escape".to_string(),
            1,
            None,
            false,
            PathBuf::from("ffmpeg"),
            http,
        );
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }
}
