use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

/// Deletes staged inputs and downloaded results once they are older than the
/// retention window. Works purely on the filesystem; job records are left alone.
pub struct RetentionSweeper {
    dirs: Vec<PathBuf>,
    retention: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(dirs: Vec<PathBuf>, retention: Duration, interval: Duration) -> Self {
        Self {
            dirs,
            retention,
            interval,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            retention_secs = self.retention.as_secs(),
            interval_secs = self.interval.as_secs(),
            "retention sweeper started"
        );

        loop {
            let report = self.sweep_once(SystemTime::now()).await;
            if report.removed > 0 || report.failed > 0 {
                info!(removed = report.removed, failed = report.failed, "retention sweep finished");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("retention sweeper stopped");
    }

    /// One pass over every directory, treating `now` as the current time.
    pub async fn sweep_once(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();

        let Some(cutoff) = now.checked_sub(self.retention) else {
            return report;
        };

        for dir in &self.dirs {
            if let Err(err) = sweep_dir(dir, cutoff, &mut report).await {
                if err.kind() == io::ErrorKind::NotFound {
                    debug!(dir = %dir.display(), "sweep skipped missing directory");
                } else {
                    warn!(dir = %dir.display(), "sweep failed: {err}");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

async fn sweep_dir(root: &Path, cutoff: SystemTime, report: &mut SweepReport) -> io::Result<()> {
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(path = %path.display(), "cannot stat: {err}");
                    report.failed += 1;
                    continue;
                }
            };

            if metadata.is_dir() {
                pending.push(path);
                continue;
            }

            let expired = metadata
                .modified()
                .map(|modified| modified < cutoff)
                .unwrap_or(false);

            if !expired {
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "removed expired file");
                    report.removed += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), "cannot remove expired file: {err}");
                    report.failed += 1;
                }
            }
        }
    }

    Ok(())
}
