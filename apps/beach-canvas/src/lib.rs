//! Shared pixel canvas: one in-memory grid that any number of websocket viewers see
//! change in near real time.
//!
//! Writes arrive over websocket or HTTP, are applied to the [`grid::GridStore`] and
//! queued for the [`batcher::BroadcastBatcher`], which fans compact delta frames out to
//! every registered viewer. New viewers are bootstrapped with chunked full-state frames
//! and the grid is persisted to disk on a fixed schedule and at shutdown.

pub mod batcher;
pub mod config;
pub mod error;
pub mod grid;
pub mod ingest;
pub mod persistence;
pub mod pixel;
pub mod probe;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod telemetry;
pub mod wire;

pub use error::{CanvasError, DeliveryError, PersistenceError};
pub use grid::GridStore;
pub use pixel::{DrawRequest, Pixel, Rgb};
