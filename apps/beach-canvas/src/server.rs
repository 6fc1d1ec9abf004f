use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{future, SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::batcher::BroadcastBatcher;
use crate::config::ServerConfig;
use crate::error::CanvasError;
use crate::grid::GridStore;
use crate::ingest::{update_queue, PixelIngest};
use crate::persistence::PersistenceScheduler;
use crate::pixel::{DrawRequest, Pixel};
use crate::registry::{ClientHandle, ClientId, ClientRegistry};
use crate::snapshot::stream_snapshot;

const ACK_OK: &str = "ok";
const ACK_ERR: &str = "err";
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct AppState {
    grid: Arc<GridStore>,
    ingest: PixelIngest,
    registry: ClientRegistry,
    snapshot_chunk: usize,
    outbound_buffer: usize,
    draw_idle_timeout: Duration,
    metrics: PrometheusHandle,
}

#[derive(Debug, Serialize)]
struct StatsSnapshot {
    width: u16,
    height: u16,
    viewers: usize,
}

impl AppState {
    pub fn grid(&self) -> &Arc<GridStore> {
        &self.grid
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            width: self.grid.width(),
            height: self.grid.height(),
            viewers: self.registry.len(),
        }
    }

    fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

/// A bound listener with every background task of the canvas already running.
pub struct CanvasServer {
    state: Arc<AppState>,
    listener: TcpListener,
    persistence: PersistenceScheduler,
    batcher: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl CanvasServer {
    /// Restores the saved canvas, starts the batcher and the save schedule, and binds the listener.
    pub async fn bind(config: ServerConfig, metrics: PrometheusHandle) -> Result<Self> {
        let grid = Arc::new(GridStore::new(config.width, config.height));
        match grid.load_file(&config.snapshot_path).await {
            Ok(true) => info!(path = %config.snapshot_path.display(), "canvas restored"),
            Ok(false) => info!(
                path = %config.snapshot_path.display(),
                "no saved canvas found; starting blank"
            ),
            Err(err) => warn!(
                path = %config.snapshot_path.display(),
                error = %err,
                "failed to restore canvas; starting blank"
            ),
        }

        let registry = ClientRegistry::new();
        let (updates_tx, updates_rx) = update_queue();
        let batcher = BroadcastBatcher::new(config.batcher, registry.clone()).spawn(updates_rx);
        let persistence =
            PersistenceScheduler::spawn(grid.clone(), config.snapshot_path.clone(), config.save_interval);

        let state = Arc::new(AppState {
            ingest: PixelIngest::new(grid.clone(), updates_tx),
            grid,
            registry,
            snapshot_chunk: config.snapshot_chunk,
            outbound_buffer: config.outbound_buffer,
            draw_idle_timeout: config.draw_idle_timeout,
            metrics,
        });

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .context("failed to bind listener")?;

        Ok(Self {
            state,
            listener,
            persistence,
            batcher,
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Serves until `signal` resolves. The canvas is saved before the listener stops.
    pub async fn serve_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        let router = build_router(self.state.clone());
        let persistence = self.persistence;
        let shutdown = async move {
            signal.await;
            info!(path = %persistence.path().display(), "shutdown requested; saving canvas");
            persistence.shutdown().await;
        };

        info!("beach-canvas listening on {addr}");
        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("server shutdown with error")?;

        info!(
            grace_seconds = self.shutdown_grace.as_secs(),
            "listener closed; sleeping for graceful period"
        );
        self.batcher.abort();
        tokio::time::sleep(self.shutdown_grace).await;
        info!("graceful shutdown complete");
        Ok(())
    }
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    CanvasServer::bind(config, metrics)
        .await?
        .serve_until(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(viewer_ws_handler))
        .route("/ws/draw", get(draw_ws_handler))
        .route("/updatePixel", post(update_pixel_handler))
        .route("/getPixel", get(get_pixel_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl ApiError {
    fn bad_request(message: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn update_pixel_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let request = decode_draw(&body).map_err(|_| ApiError::bad_request("Invalid JSON payload"))?;
    state
        .ingest
        .ingest(request)
        .map_err(|_| ApiError::bad_request("Invalid coordinates"))?;
    Ok(StatusCode::OK)
}

async fn get_pixel_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Pixel>, ApiError> {
    let coord = |name: &str| params.get(name).and_then(|raw| raw.trim().parse::<i64>().ok());
    let (Some(x), Some(y)) = (coord("x"), coord("y")) else {
        return Err(ApiError::bad_request("Invalid query parameters"));
    };
    let (x, y) = state
        .grid
        .check_bounds(x, y)
        .map_err(|_| ApiError::bad_request("Invalid coordinates"))?;
    let color = state
        .grid
        .get(x, y)
        .map_err(|_| ApiError::bad_request("Invalid coordinates"))?;
    Ok(Json(Pixel::new(x, y, color)))
}

fn decode_draw(payload: &[u8]) -> Result<DrawRequest, CanvasError> {
    Ok(serde_json::from_slice(payload)?)
}

async fn viewer_ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_viewer(socket, state))
}

async fn handle_viewer(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let sent = {
        let mut frames = (&mut ws_tx)
            .with(|frame: Bytes| future::ready(Ok::<_, axum::Error>(Message::Binary(frame.to_vec()))));
        stream_snapshot(&state.grid, state.snapshot_chunk, &mut frames).await
    };
    let frames = match sent {
        Ok(frames) => frames,
        Err(err) => {
            counter!("beach_canvas_snapshot_failures_total", 1);
            debug!(error = %err, "viewer left during bootstrap");
            return;
        }
    };

    let (client, outbound) = ClientHandle::channel(state.outbound_buffer);
    let client_id = client.id();
    state.registry.register(client);
    info!(client_id = %client_id, snapshot_frames = frames, "viewer connected");

    let (close_tx, close_rx) = oneshot::channel();
    let mut writer = tokio::spawn(write_viewer(ws_tx, outbound, close_rx, client_id));

    let close = tokio::select! {
        close = read_viewer(&state, client_id, &mut ws_rx) => Some(close),
        _ = &mut writer => None,
    };
    if let Some(close) = close {
        // Hand the close frame over before unregistering so the writer does not
        // mistake this for a prune.
        let _ = close_tx.send(close);
        state.registry.unregister(client_id);
        if timeout(WRITER_CLOSE_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }
    } else {
        state.registry.unregister(client_id);
    }
    info!(client_id = %client_id, "viewer disconnected");
}

/// Reads draw messages from a viewer until it leaves or sends something undecodable.
/// Returns the close frame the server should answer with, if any.
async fn read_viewer(
    state: &AppState,
    client_id: ClientId,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Option<CloseFrame<'static>> {
    while let Some(message) = ws_rx.next().await {
        let payload = match message {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(err) => {
                debug!(client_id = %client_id, error = %err, "viewer read failed");
                return None;
            }
        };
        let request = match decode_draw(&payload) {
            Ok(request) => request,
            Err(err) => {
                counter!("beach_canvas_pixels_rejected_total", 1, "reason" => err.metric_label());
                warn!(client_id = %client_id, error = %err, "undecodable draw from viewer; closing");
                return Some(CloseFrame {
                    code: close_code::INVALID,
                    reason: "malformed draw message".into(),
                });
            }
        };
        if let Err(err) = state.ingest.ingest(request) {
            debug!(client_id = %client_id, error = %err, "viewer draw rejected");
        }
    }
    None
}

/// Drains the viewer's outbound queue onto the socket.
///
/// The queue closes when the registry drops the viewer (lagging or closed delivery).
/// Such a viewer has missed deltas, so it is told to reconnect and re-bootstrap.
async fn write_viewer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Bytes>,
    mut close_rx: oneshot::Receiver<Option<CloseFrame<'static>>>,
    client_id: ClientId,
) {
    let close = loop {
        tokio::select! {
            biased;
            close = &mut close_rx => break close.unwrap_or(None),
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if ws_tx.send(Message::Binary(frame.to_vec())).await.is_err() {
                        debug!(client_id = %client_id, "viewer write failed");
                        return;
                    }
                }
                None => {
                    info!(client_id = %client_id, "viewer dropped from broadcast; closing for resync");
                    break Some(CloseFrame {
                        code: close_code::AGAIN,
                        reason: "lagging; reconnect to resync".into(),
                    });
                }
            },
        }
    };
    if let Some(frame) = close {
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
    }
    let _ = ws_tx.close().await;
}

async fn draw_ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_draw(socket, state))
}

async fn handle_draw(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut deadline = Instant::now() + state.draw_idle_timeout;

    loop {
        let message = match timeout_at(deadline, ws_rx.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(err))) => {
                debug!(error = %err, "draw socket read failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!("draw socket idle; closing");
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "idle timeout".into(),
                    })))
                    .await;
                break;
            }
        };
        let payload = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => break,
            _ => continue,
        };

        let (ack, keep_open) = match decode_draw(&payload) {
            Ok(request) => match state.ingest.ingest(request) {
                Ok(_) => {
                    deadline = Instant::now() + state.draw_idle_timeout;
                    (ACK_OK, true)
                }
                Err(_) => (ACK_ERR, true),
            },
            Err(err) => {
                counter!("beach_canvas_pixels_rejected_total", 1, "reason" => err.metric_label());
                debug!(error = %err, "undecodable draw message; closing");
                (ACK_ERR, false)
            }
        };
        if ws_tx.send(Message::Text(ack.to_string())).await.is_err() || !keep_open {
            break;
        }
    }
}
