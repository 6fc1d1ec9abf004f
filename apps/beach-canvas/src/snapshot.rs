//! Bootstraps a new viewer with the full grid.
//!
//! The grid is copied once and cut into full-state frames of at most `chunk_pixels`
//! pixels each, in row-major order, so no single message grows with the canvas size.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use metrics::{counter, histogram};
use tracing::debug;

use crate::error::{CanvasError, DeliveryError};
use crate::grid::{GridStore, BYTES_PER_PIXEL};
use crate::pixel::Rgb;
use crate::wire::{self, FrameKind, WireError, MAX_PIXELS_PER_FRAME};

/// Iterator of encoded full-state frames over one grid snapshot.
pub struct SnapshotChunks {
    cells: Vec<u8>,
    width: usize,
    chunk_pixels: usize,
    next_index: usize,
}

impl SnapshotChunks {
    pub fn new(grid: &GridStore, chunk_pixels: usize) -> Result<Self, CanvasError> {
        Self::from_bytes(grid.snapshot_bytes(), grid.width(), chunk_pixels)
    }

    pub fn from_bytes(cells: Vec<u8>, width: u16, chunk_pixels: usize) -> Result<Self, CanvasError> {
        if chunk_pixels == 0 {
            return Err(CanvasError::InvalidChunkSize(chunk_pixels));
        }
        if chunk_pixels > MAX_PIXELS_PER_FRAME {
            return Err(WireError::TooManyPixels(chunk_pixels).into());
        }
        Ok(Self {
            cells,
            width: width as usize,
            chunk_pixels,
            next_index: 0,
        })
    }

    fn total_pixels(&self) -> usize {
        self.cells.len() / BYTES_PER_PIXEL
    }

    /// Number of frames still to be produced.
    pub fn remaining_frames(&self) -> usize {
        let left = self.total_pixels() - self.next_index;
        left.div_ceil(self.chunk_pixels)
    }
}

impl Iterator for SnapshotChunks {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        let total = self.total_pixels();
        if self.next_index >= total || self.width == 0 {
            return None;
        }
        let start = self.next_index;
        let end = (start + self.chunk_pixels).min(total);
        self.next_index = end;

        // chunk_pixels was bounded in the constructor
        let mut buf = wire::begin_frame(FrameKind::FullState, end - start).ok()?;
        for index in start..end {
            let offset = index * BYTES_PER_PIXEL;
            let color = Rgb::new(
                self.cells[offset],
                self.cells[offset + 1],
                self.cells[offset + 2],
            );
            let x = (index % self.width) as u16;
            let y = (index / self.width) as u16;
            wire::write_pixel(&mut buf, x, y, color);
        }
        Some(buf.freeze())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let frames = self.remaining_frames();
        (frames, Some(frames))
    }
}

/// Writes the full grid to a freshly accepted connection. Returns the number of frames.
///
/// Any write failure is terminal for the connection: the caller must not register it
/// for live updates.
pub async fn stream_snapshot<S>(
    grid: &GridStore,
    chunk_pixels: usize,
    sink: &mut S,
) -> Result<usize, CanvasError>
where
    S: Sink<Bytes> + Unpin,
    S::Error: fmt::Display,
{
    let started = Instant::now();
    let chunks = SnapshotChunks::new(grid, chunk_pixels)?;
    let total = chunks.remaining_frames();
    let mut sent = 0usize;
    for frame in chunks {
        if let Err(err) = sink.send(frame).await {
            debug!(error = %err, sent, total, "snapshot stream aborted");
            return Err(DeliveryError::Closed.into());
        }
        sent += 1;
    }
    counter!("beach_canvas_snapshot_frames_total", sent as u64);
    histogram!(
        "beach_canvas_snapshot_duration_ms",
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_frame;

    fn painted_grid(width: u16, height: u16) -> GridStore {
        let grid = GridStore::new(width, height);
        for y in 0..height {
            for x in 0..width {
                grid.set(x, y, Rgb::new(x as u8, y as u8, (x ^ y) as u8))
                    .expect("set");
            }
        }
        grid
    }

    #[test_timeout::timeout]
    fn four_by_four_in_chunks_of_four() {
        let grid = painted_grid(4, 4);
        let frames: Vec<_> = SnapshotChunks::new(&grid, 4)
            .expect("chunks")
            .map(|frame| decode_frame(&frame).expect("decode"))
            .collect();

        assert_eq!(frames.len(), 4);
        for (row, frame) in frames.iter().enumerate() {
            assert_eq!(frame.kind, FrameKind::FullState);
            assert_eq!(frame.pixels.len(), 4);
            for (col, pixel) in frame.pixels.iter().enumerate() {
                assert_eq!((pixel.x as usize, pixel.y as usize), (col, row));
            }
        }
        let first = &frames[0].pixels;
        assert_eq!((first[0].x, first[0].y), (0, 0));
        assert_eq!((first[3].x, first[3].y), (3, 0));
    }

    #[test_timeout::timeout]
    fn uneven_chunks_cover_every_cell_once() {
        let grid = painted_grid(7, 5);
        let chunks = SnapshotChunks::new(&grid, 8).expect("chunks");
        assert_eq!(chunks.remaining_frames(), 35usize.div_ceil(8));

        let frames: Vec<_> = chunks.map(|f| decode_frame(&f).expect("decode")).collect();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames.last().expect("last").pixels.len(), 3);

        let pixels: Vec<_> = frames.into_iter().flat_map(|f| f.pixels).collect();
        assert_eq!(pixels.len(), 35);
        for (index, pixel) in pixels.iter().enumerate() {
            let (x, y) = ((index % 7) as u16, (index / 7) as u16);
            assert_eq!((pixel.x, pixel.y), (x, y));
            assert_eq!(pixel.color(), grid.get(x, y).expect("get"));
        }
    }

    #[test_timeout::timeout]
    fn rejects_unusable_chunk_sizes() {
        let grid = GridStore::new(2, 2);
        let err = SnapshotChunks::new(&grid, 0).err().expect("zero chunk rejected");
        assert!(matches!(err, CanvasError::InvalidChunkSize(0)));
        assert_eq!(err.to_string(), "snapshot chunk size must be at least one pixel, got 0");
        assert!(matches!(
            SnapshotChunks::new(&grid, MAX_PIXELS_PER_FRAME + 1),
            Err(CanvasError::Wire(WireError::TooManyPixels(_)))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn stream_writes_all_frames_in_order() {
        let grid = painted_grid(10, 10);
        let mut sink: Vec<Bytes> = Vec::new();
        let sent = stream_snapshot(&grid, 30, &mut sink).await.expect("stream");
        assert_eq!(sent, 4);

        let received: Vec<_> = sink.iter().map(|f| decode_frame(f).expect("decode")).collect();
        let sizes: Vec<_> = received.iter().map(|f| f.pixels.len()).collect();
        assert_eq!(sizes, vec![30, 30, 30, 10]);
        assert_eq!(received[3].pixels[0].y, 9);
    }

    #[test_timeout::tokio_timeout_test]
    async fn write_failure_aborts_stream() {
        let grid = GridStore::new(10, 10);
        let failing = futures_util::sink::unfold(0usize, |count, _frame: Bytes| async move {
            if count == 2 {
                Err("connection reset")
            } else {
                Ok(count + 1)
            }
        });
        let mut failing = std::pin::pin!(failing);
        let err = stream_snapshot(&grid, 10, &mut failing).await.unwrap_err();
        assert!(matches!(err, CanvasError::Delivery(DeliveryError::Closed)));
    }
}
