use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{CanvasError, PersistenceError};
use crate::pixel::{Pixel, Rgb};

pub const BYTES_PER_PIXEL: usize = 3;

/// Owner of the shared pixel matrix.
///
/// Cells are stored row-major as packed RGB triples, which is also the layout of the
/// snapshot file, so saving and bootstrapping viewers both start from a plain byte copy.
/// The lock is never held across an await point or any file I/O.
pub struct GridStore {
    width: u16,
    height: u16,
    cells: RwLock<Vec<u8>>,
}

impl GridStore {
    pub fn new(width: u16, height: u16) -> Self {
        let len = width as usize * height as usize * BYTES_PER_PIXEL;
        Self {
            width,
            height,
            cells: RwLock::new(vec![0; len]),
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn byte_len(&self) -> usize {
        self.pixel_count() * BYTES_PER_PIXEL
    }

    /// Validates untrusted coordinates against the canvas bounds.
    pub fn check_bounds(&self, x: i64, y: i64) -> Result<(u16, u16), CanvasError> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return Err(CanvasError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok((x as u16, y as u16))
    }

    pub fn set(&self, x: u16, y: u16, color: Rgb) -> Result<(), CanvasError> {
        self.apply(Pixel::new(x, y, color), |_| ())
    }

    pub fn get(&self, x: u16, y: u16) -> Result<Rgb, CanvasError> {
        let offset = self.offset(x, y)?;
        let cells = self.cells.read();
        Ok(Rgb::new(
            cells[offset],
            cells[offset + 1],
            cells[offset + 2],
        ))
    }

    /// Writes `pixel` and runs `on_applied` before the write lock is released.
    ///
    /// Callers use the hook to publish the write so that publication order matches the
    /// order in which writes hit the grid. The hook must not block.
    pub fn apply<F>(&self, pixel: Pixel, on_applied: F) -> Result<(), CanvasError>
    where
        F: FnOnce(&Pixel),
    {
        let offset = self.offset(pixel.x, pixel.y)?;
        let mut cells = self.cells.write();
        cells[offset..offset + BYTES_PER_PIXEL].copy_from_slice(&pixel.color().to_bytes());
        on_applied(&pixel);
        Ok(())
    }

    /// Consistent row-major copy of the whole grid.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        self.cells.read().clone()
    }

    /// Replaces the grid with `bytes`; anything but an exact-size image is rejected whole.
    pub fn load_from(&self, bytes: &[u8]) -> Result<(), CanvasError> {
        let expected = self.byte_len();
        if bytes.len() != expected {
            return Err(PersistenceError::SizeMismatch {
                expected,
                actual: bytes.len(),
            }
            .into());
        }
        self.cells.write().copy_from_slice(bytes);
        Ok(())
    }

    /// Loads the snapshot at `path`. Returns `Ok(false)` when no snapshot exists yet.
    pub async fn load_file(&self, path: &Path) -> Result<bool, CanvasError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(PersistenceError::Io(err).into()),
        };
        self.load_from(&bytes)?;
        Ok(true)
    }

    /// Writes the current grid to `path` via a sibling temp file and a rename.
    pub async fn save_to(&self, path: &Path) -> Result<usize, CanvasError> {
        let bytes = self.snapshot_bytes();
        let tmp = temp_path(path);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(PersistenceError::Io)?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(PersistenceError::Io)?;
        debug!(path = %path.display(), bytes = bytes.len(), "canvas snapshot written");
        Ok(bytes.len())
    }

    fn offset(&self, x: u16, y: u16) -> Result<usize, CanvasError> {
        self.check_bounds(x as i64, y as i64)?;
        Ok((y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "canvas.bin".into());
    name.push(".tmp");
    path.with_file_name(name)
}
