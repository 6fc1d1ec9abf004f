use std::fmt;

use anyhow::{anyhow, bail, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info};

use crate::config::ProbeAction;
use crate::pixel::DrawRequest;
use crate::wire::{decode_frame, Frame, FrameKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run_probe(action: ProbeAction) -> Result<()> {
    match action {
        ProbeAction::Watch { url, deltas } => watch(&url, deltas).await,
        ProbeAction::Draw { url, x, y, r, g, b } => {
            let ack = draw(&url, DrawRequest { x, y, r, g, b }).await?;
            println!("{ack}");
            Ok(())
        }
    }
}

/// Running totals of the frames seen by `probe watch`.
#[derive(Debug, Default, PartialEq, Eq)]
struct WatchSummary {
    full_state_frames: usize,
    full_state_pixels: usize,
    delta_frames: usize,
    delta_pixels: usize,
}

impl WatchSummary {
    fn record(&mut self, frame: &Frame) {
        let pixels = frame.pixels.len();
        match frame.kind {
            FrameKind::FullState => {
                self.full_state_frames += 1;
                self.full_state_pixels += pixels;
                debug!(
                    frames = self.full_state_frames,
                    pixels = self.full_state_pixels,
                    "bootstrap progress"
                );
            }
            FrameKind::Delta => {
                self.delta_frames += 1;
                self.delta_pixels += pixels;
                info!(pixels, total_deltas = self.delta_frames, "delta frame");
            }
        }
    }

    /// `max_deltas == 0` watches until the socket closes.
    fn reached(&self, max_deltas: usize) -> bool {
        max_deltas > 0 && self.delta_frames >= max_deltas
    }
}

impl fmt::Display for WatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "full-state frames: {} ({} pixels), delta frames: {} ({} pixels)",
            self.full_state_frames, self.full_state_pixels, self.delta_frames, self.delta_pixels
        )
    }
}

async fn watch(url: &str, max_deltas: usize) -> Result<()> {
    let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => bail!("Connection timeout - is the canvas server running?"),
    };
    let (_write, mut read) = ws_stream.split();

    let mut summary = WatchSummary::default();
    while let Some(message) = read.next().await {
        match message? {
            Message::Binary(data) => {
                summary.record(&decode_frame(&data)?);
                if summary.reached(max_deltas) {
                    break;
                }
            }
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    info!(code = u16::from(frame.code), reason = frame.reason.as_str(), "server closed the stream");
                }
                break;
            }
            _ => continue,
        }
    }

    println!("{summary}");
    Ok(())
}

async fn draw(url: &str, request: DrawRequest) -> Result<String> {
    let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| anyhow!("Connection timeout - is the canvas server running?"))??;
    let (mut write, mut read) = ws_stream.split();

    let payload = serde_json::to_string(&request)?;
    write.send(Message::Text(payload.into())).await?;

    let reply = timeout(CONNECT_TIMEOUT, async {
        while let Some(message) = read.next().await {
            if let Message::Text(text) = message? {
                return Ok(text.as_str().to_string());
            }
        }
        Err(anyhow!("draw socket closed before acknowledging"))
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for acknowledgement"))??;

    let _ = write.send(Message::Close(None)).await;
    Ok(reply)
}
