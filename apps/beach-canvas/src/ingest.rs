use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::CanvasError;
use crate::grid::GridStore;
use crate::pixel::{DrawRequest, Pixel};

pub type UpdateSender = mpsc::UnboundedSender<Pixel>;
pub type UpdateReceiver = mpsc::UnboundedReceiver<Pixel>;

/// Creates the update queue between every ingest path and the broadcast batcher.
pub fn update_queue() -> (UpdateSender, UpdateReceiver) {
    mpsc::unbounded_channel()
}

/// Validates draw requests, applies them to the grid and queues them for broadcast.
#[derive(Clone)]
pub struct PixelIngest {
    grid: Arc<GridStore>,
    updates: UpdateSender,
}

impl PixelIngest {
    pub fn new(grid: Arc<GridStore>, updates: UpdateSender) -> Self {
        Self { grid, updates }
    }

    pub fn grid(&self) -> &Arc<GridStore> {
        &self.grid
    }

    pub fn ingest(&self, request: DrawRequest) -> Result<Pixel, CanvasError> {
        let (x, y) = match self.grid.check_bounds(request.x, request.y) {
            Ok(coords) => coords,
            Err(err) => {
                counter!("beach_canvas_pixels_rejected_total", 1, "reason" => err.metric_label());
                return Err(err);
            }
        };
        let pixel = Pixel::new(x, y, request.color());

        // Queue while the grid lock is held so broadcast order equals application order.
        self.grid.apply(pixel, |applied| {
            if self.updates.send(*applied).is_err() {
                debug!(x = applied.x, y = applied.y, "update queue closed; write not broadcast");
            }
        })?;
        counter!("beach_canvas_pixels_accepted_total", 1);
        Ok(pixel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::Rgb;

    fn request(x: i64, y: i64) -> DrawRequest {
        DrawRequest {
            x,
            y,
            r: 200,
            g: 100,
            b: 50,
        }
    }

    #[test_timeout::timeout]
    fn accepted_write_updates_grid_and_queue() {
        let grid = Arc::new(GridStore::new(10, 10));
        let (tx, mut rx) = update_queue();
        let ingest = PixelIngest::new(grid.clone(), tx);

        let pixel = ingest.ingest(request(3, 9)).expect("ingest");
        assert_eq!(pixel, Pixel::new(3, 9, Rgb::new(200, 100, 50)));
        assert_eq!(grid.get(3, 9).expect("get"), Rgb::new(200, 100, 50));
        assert_eq!(rx.try_recv().expect("queued"), pixel);
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn rejected_write_touches_nothing() {
        let grid = Arc::new(GridStore::new(10, 10));
        let (tx, mut rx) = update_queue();
        let ingest = PixelIngest::new(grid.clone(), tx);
        let before = grid.snapshot_bytes();

        for (x, y) in [(-1, 0), (0, -1), (10, 0), (0, 10), (i64::MAX, i64::MIN)] {
            let err = ingest.ingest(request(x, y)).unwrap_err();
            assert!(err.is_out_of_bounds());
        }
        assert_eq!(grid.snapshot_bytes(), before);
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn closed_queue_still_applies_write() {
        let grid = Arc::new(GridStore::new(2, 2));
        let (tx, rx) = update_queue();
        drop(rx);
        let ingest = PixelIngest::new(grid.clone(), tx);
        ingest.ingest(request(1, 1)).expect("ingest");
        assert_eq!(grid.get(1, 1).expect("get"), Rgb::new(200, 100, 50));
    }

    #[test_timeout::timeout]
    fn concurrent_writers_queue_in_application_order() {
        let grid = Arc::new(GridStore::new(4, 1));
        let (tx, mut rx) = update_queue();
        let ingest = PixelIngest::new(grid.clone(), tx);

        let handles: Vec<_> = (0..8u8)
            .map(|worker| {
                let ingest = ingest.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        ingest
                            .ingest(DrawRequest {
                                x: 0,
                                y: 0,
                                r: worker,
                                g: worker,
                                b: worker,
                            })
                            .expect("ingest");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let mut last = None;
        let mut total = 0;
        while let Ok(pixel) = rx.try_recv() {
            last = Some(pixel.color());
            total += 1;
        }
        assert_eq!(total, 8 * 200);
        // The final queued write is the one the grid kept.
        assert_eq!(last, Some(grid.get(0, 0).expect("get")));
    }
}
