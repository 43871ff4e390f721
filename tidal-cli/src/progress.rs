use std::io::Write;

use indicatif::{ProgressBar, ProgressStyle};
use tidal_engine::Progress;
use tokio::sync::mpsc;
use tracing::warn;

use crate::cli::ProgressFormat;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} segments ({eta})";

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Drain progress updates until the downloader drops its sender.
pub async fn report(mut rx: mpsc::Receiver<Progress>, format: ProgressFormat) {
    match format {
        ProgressFormat::Bar => {
            let bar = ProgressBar::new(0);
            bar.set_style(bar_style());
            while let Some(progress) = rx.recv().await {
                bar.set_length(progress.total as u64);
                bar.set_position(progress.downloaded as u64);
            }
            bar.finish();
        }
        ProgressFormat::Json => {
            while let Some(progress) = rx.recv().await {
                match serde_json::to_string(&progress) {
                    Ok(line) => {
                        let mut stdout = std::io::stdout().lock();
                        if writeln!(stdout, "{line}").and_then(|_| stdout.flush()).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize progress"),
                }
            }
        }
        ProgressFormat::None => while rx.recv().await.is_some() {},
    }
}
