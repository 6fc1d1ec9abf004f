use std::io;

use thiserror::Error;

use crate::wire::WireError;

#[derive(Debug, Error)]
pub enum CanvasError {
    #[error("pixel ({x}, {y}) outside {width}x{height} canvas")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: u16,
        height: u16,
    },
    #[error("snapshot chunk size must be at least one pixel, got {0}")]
    InvalidChunkSize(usize),
    #[error("malformed draw message: {0}")]
    Decode(String),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// A frame could not be handed to one client's outbound queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("client connection closed")]
    Closed,
    #[error("client outbound queue full")]
    Lagging,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot io error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

impl CanvasError {
    pub fn is_out_of_bounds(&self) -> bool {
        matches!(self, CanvasError::OutOfBounds { .. })
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            CanvasError::OutOfBounds { .. } => "out_of_bounds",
            CanvasError::InvalidChunkSize(_) => "chunk_size",
            CanvasError::Decode(_) => "decode",
            CanvasError::Delivery(_) => "delivery",
            CanvasError::Persistence(_) => "persistence",
            CanvasError::Wire(_) => "wire",
        }
    }
}

impl From<serde_json::Error> for CanvasError {
    fn from(err: serde_json::Error) -> Self {
        CanvasError::Decode(err.to_string())
    }
}
