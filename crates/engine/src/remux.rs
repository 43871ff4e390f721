// Remux: turn a local HLS playlist into a single MP4 with ffmpeg stream copy.
use std::path::{Path, PathBuf};

use process_utils::{ProcessError, ProcessManager};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::TidalError;

pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";

/// Lines of ffmpeg stderr kept in error messages.
const STDERR_TAIL_LINES: usize = 20;

/// `ffmpeg -y -i {playlist} -c copy {output}` run inside `work_dir`.
pub fn remux_command(ffmpeg: &Path, work_dir: &Path, playlist: &str, output: &str) -> Command {
    let mut cmd = process_utils::tokio_command(ffmpeg);
    cmd.current_dir(work_dir)
        .env("LC_ALL", "C")
        .args(["-y", "-hide_banner", "-i", playlist, "-c", "copy", output]);
    cmd
}

/// Remux `work_dir/{playlist}` into `work_dir/{output}` and return the output
/// path.
pub async fn remux_playlist(
    processes: &ProcessManager,
    ffmpeg: &Path,
    work_dir: &Path,
    playlist: &str,
    output: &str,
    token: &CancellationToken,
) -> Result<PathBuf, TidalError> {
    let id = format!("remux:{}", work_dir.join(output).display());
    info!(dir = %work_dir.display(), output, "Remuxing to MP4");

    let command = remux_command(ffmpeg, work_dir, playlist, output);
    match processes.run(id, command, token).await {
        Ok(out) => {
            debug!(stderr = %tail(&out.stderr), "ffmpeg finished");
            Ok(work_dir.join(output))
        }
        Err(ProcessError::Cancelled(_)) => Err(TidalError::Cancelled),
        Err(ProcessError::Failed {
            status,
            stdout,
            stderr,
            ..
        }) => Err(TidalError::Remux {
            reason: format!(
                "ffmpeg exited with {status}: {}",
                if stderr.trim().is_empty() {
                    tail(&stdout)
                } else {
                    tail(&stderr)
                }
            ),
        }),
        Err(ProcessError::Spawn { program, source }) => Err(TidalError::Remux {
            reason: format!("failed to start {program}: {source}"),
        }),
        Err(e) => Err(e.into()),
    }
}

fn tail(output: &str) -> String {
    let lines: Vec<&str> = output.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
