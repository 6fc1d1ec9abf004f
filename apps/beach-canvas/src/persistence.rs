use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::grid::GridStore;

pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically writes the grid to disk and once more when shut down.
pub struct PersistenceScheduler {
    grid: Arc<GridStore>,
    path: PathBuf,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PersistenceScheduler {
    pub fn spawn(grid: Arc<GridStore>, path: impl Into<PathBuf>, interval: Duration) -> Self {
        let path = path.into();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(save_loop(grid.clone(), path.clone(), interval, stop_rx));
        Self {
            grid,
            path,
            stop_tx,
            handle,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saves immediately, outside the periodic schedule.
    pub async fn save_now(&self) -> bool {
        save(&self.grid, &self.path, "manual").await
    }

    /// Stops the periodic task after it has written one final snapshot.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "persistence task ended abnormally");
        }
    }
}

async fn save_loop(
    grid: Arc<GridStore>,
    path: PathBuf,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                save(&grid, &path, "periodic").await;
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }

    if save(&grid, &path, "shutdown").await {
        info!(path = %path.display(), "final canvas snapshot saved");
    }
}

async fn save(grid: &GridStore, path: &Path, reason: &'static str) -> bool {
    let started = Instant::now();
    match grid.save_to(path).await {
        Ok(bytes) => {
            counter!("beach_canvas_snapshot_saves_total", 1, "reason" => reason);
            histogram!(
                "beach_canvas_snapshot_save_ms",
                started.elapsed().as_secs_f64() * 1000.0
            );
            info!(path = %path.display(), bytes, reason, "canvas saved");
            true
        }
        Err(err) => {
            counter!("beach_canvas_snapshot_save_failures_total", 1, "reason" => reason);
            warn!(path = %path.display(), error = %err, reason, "failed to save canvas");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::Rgb;

    fn scratch_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("beach-canvas-{label}-{}.bin", uuid::Uuid::new_v4()))
    }

    #[test_timeout::tokio_timeout_test]
    async fn shutdown_writes_final_snapshot() {
        let path = scratch_path("shutdown");
        let grid = Arc::new(GridStore::new(4, 4));
        let scheduler = PersistenceScheduler::spawn(grid.clone(), &path, Duration::from_secs(3600));
        grid.set(2, 3, Rgb::new(8, 9, 10)).expect("set");

        scheduler.shutdown().await;

        let bytes = tokio::fs::read(&path).await.expect("snapshot written");
        assert_eq!(bytes, grid.snapshot_bytes());
        let _ = std::fs::remove_file(&path);
    }

    #[test_timeout::tokio_timeout_test]
    async fn periodic_save_tracks_grid() {
        let path = scratch_path("periodic");
        let grid = Arc::new(GridStore::new(2, 2));
        grid.set(1, 0, Rgb::new(1, 2, 3)).expect("set");
        let scheduler = PersistenceScheduler::spawn(grid.clone(), &path, Duration::from_millis(20));

        let mut saved = None;
        for _ in 0..100 {
            time::sleep(Duration::from_millis(10)).await;
            if let Ok(bytes) = tokio::fs::read(&path).await {
                saved = Some(bytes);
                break;
            }
        }
        assert_eq!(saved.expect("periodic save"), grid.snapshot_bytes());
        scheduler.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }

    #[test_timeout::tokio_timeout_test]
    async fn save_failure_is_not_fatal() {
        let path = std::env::temp_dir()
            .join(format!("beach-canvas-missing-{}", uuid::Uuid::new_v4()))
            .join("canvas.bin");
        let grid = Arc::new(GridStore::new(2, 2));
        let scheduler = PersistenceScheduler::spawn(grid, &path, Duration::from_millis(5));
        assert!(!scheduler.save_now().await);
        time::sleep(Duration::from_millis(20)).await;
        scheduler.shutdown().await;
        assert!(!path.exists());
    }
}
