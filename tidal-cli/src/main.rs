mod cli;
mod error;
mod progress;

use std::process;

use clap::Parser;
use tidal_engine::retry::RetryHook;
use tidal_engine::{HlsDownloader, StreamRelay};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};
use crate::error::{AppError, Result};

/// Conventional exit status after SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = init_logging(args.verbose, args.quiet) {
        eprintln!("Error: {e}");
        process::exit(1);
    }

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    if let Err(e) = run(args, token).await {
        if e.is_cancelled() {
            info!("Interrupted");
            process::exit(EXIT_INTERRUPTED);
        }
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args, token: CancellationToken) -> Result<()> {
    match args.command {
        Commands::Download {
            url,
            output_dir,
            name,
            parallel,
            temp_dir,
            keep_temp,
            ffmpeg,
            progress,
            http,
        } => {
            let mut http = http.to_config()?;
            http.retry = http.retry.with_hook(log_retries());
            let config =
                cli::download_config(output_dir, name, parallel, temp_dir, keep_temp, ffmpeg, http)?;

            let (downloader, rx) = HlsDownloader::new(url.trim(), config);
            let reporter = tokio::spawn(progress::report(rx, progress));
            let result = downloader.with_token(token).download().await;
            // the sender is gone once `download` returns
            let _ = reporter.await;

            let path = result?;
            info!(path = %path.display(), "Download complete");
            println!("{}", path.display());
        }

        Commands::Relay {
            source,
            destination,
            live_start_index,
            ready_timeout,
            http,
        } => {
            let mut http = http.to_config()?;
            http.retry = http.retry.with_hook(log_retries());
            let config = cli::relay_config(live_start_index, ready_timeout, http);

            let relay = StreamRelay::new(source, destination, config).with_token(token);
            relay.run().await?;
        }
    }

    Ok(())
}

fn log_retries() -> RetryHook {
    RetryHook::new(|attempt, err| warn!(attempt, error = %err, "Retrying request"))
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            info!("Ctrl-C received, shutting down");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose),
        )
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))
}
