//! Coalesces accepted writes into delta frames and fans them out to every viewer.
//!
//! The batcher is the only consumer of the update queue. Pending pixels are flushed
//! either as soon as `batch_size` of them have accumulated or when the flush timer
//! fires, whichever happens first; a size-triggered flush restarts the timer so the two
//! triggers never race for the same batch, and an empty batch is never sent.

use std::time::Duration;

use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, trace};

use crate::ingest::UpdateReceiver;
use crate::pixel::Pixel;
use crate::registry::{BroadcastMetrics, ClientRegistry};
use crate::wire::{self, FrameKind, MAX_PIXELS_PER_FRAME};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Timer,
    Drain,
}

impl FlushTrigger {
    fn label(self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Drain => "drain",
        }
    }
}

pub struct BroadcastBatcher {
    config: BatcherConfig,
    registry: ClientRegistry,
    pending: Vec<Pixel>,
}

impl BroadcastBatcher {
    pub fn new(config: BatcherConfig, registry: ClientRegistry) -> Self {
        let batch_size = config.batch_size.clamp(1, MAX_PIXELS_PER_FRAME);
        Self {
            config: BatcherConfig {
                batch_size,
                flush_interval: config.flush_interval,
            },
            registry,
            pending: Vec::with_capacity(batch_size),
        }
    }

    pub fn spawn(self, updates: UpdateReceiver) -> JoinHandle<()> {
        tokio::spawn(self.run(updates))
    }

    /// Runs until every producer of the update queue has been dropped.
    pub async fn run(mut self, mut updates: UpdateReceiver) {
        let period = self.config.flush_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            batch_size = self.config.batch_size,
            flush_interval_ms = period.as_millis() as u64,
            "broadcast batcher started"
        );

        loop {
            tokio::select! {
                maybe_pixel = updates.recv() => {
                    match maybe_pixel {
                        Some(pixel) => {
                            self.pending.push(pixel);
                            if self.pending.len() >= self.config.batch_size {
                                self.flush(FlushTrigger::Size);
                                ticker.reset();
                            }
                        }
                        None => {
                            self.flush(FlushTrigger::Drain);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush(FlushTrigger::Timer);
                }
            }
        }

        debug!("broadcast batcher stopped: update queue closed");
    }

    fn flush(&mut self, trigger: FlushTrigger) -> Option<BroadcastMetrics> {
        if self.pending.is_empty() {
            return None;
        }
        let batch_len = self.pending.len();
        let frame = match wire::encode_frame(FrameKind::Delta, &self.pending) {
            Ok(frame) => frame,
            Err(err) => {
                // batch_size is clamped to the frame limit, so this only trips on a logic bug
                error!(error = %err, pixels = batch_len, "dropping unencodable batch");
                self.pending.clear();
                return None;
            }
        };
        self.pending.clear();

        let metrics = self.registry.broadcast(&frame);
        counter!("beach_canvas_batches_flushed_total", 1, "trigger" => trigger.label());
        histogram!("beach_canvas_batch_pixels", batch_len as f64);
        trace!(
            trigger = trigger.label(),
            pixels = batch_len,
            delivered = metrics.delivered,
            pruned = metrics.pruned,
            "delta batch flushed"
        );
        Some(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::update_queue;
    use crate::pixel::Rgb;
    use crate::registry::ClientHandle;
    use crate::wire::{decode_frame, Frame};
    use tokio::sync::mpsc;

    fn pixel(i: usize) -> Pixel {
        Pixel::new((i % 512) as u16, (i / 512) as u16, Rgb::new(i as u8, 0, 0))
    }

    fn start(
        batch_size: usize,
        flush_interval: Duration,
    ) -> (
        crate::ingest::UpdateSender,
        mpsc::Receiver<bytes::Bytes>,
        ClientRegistry,
        JoinHandle<()>,
    ) {
        let registry = ClientRegistry::new();
        let (client, rx) = ClientHandle::channel(64);
        registry.register(client);
        let (tx, updates) = update_queue();
        let batcher = BroadcastBatcher::new(
            BatcherConfig {
                batch_size,
                flush_interval,
            },
            registry.clone(),
        );
        let handle = batcher.spawn(updates);
        (tx, rx, registry, handle)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<bytes::Bytes>) -> Frame {
        let bytes = rx.recv().await.expect("frame");
        decode_frame(&bytes).expect("decode")
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn burst_flushes_full_batch_then_remainder_on_tick() {
        let (tx, mut rx, _registry, _handle) = start(100, Duration::from_millis(30));
        let started = Instant::now();
        for i in 0..150 {
            tx.send(pixel(i)).expect("queue");
        }

        let first = next_frame(&mut rx).await;
        assert_eq!(first.kind, FrameKind::Delta);
        assert_eq!(first.pixels.len(), 100);
        assert!(started.elapsed() < Duration::from_millis(30));

        let second = next_frame(&mut rx).await;
        assert_eq!(second.pixels.len(), 50);
        assert!(started.elapsed() >= Duration::from_millis(30));

        let pixels: Vec<_> = first.pixels.into_iter().chain(second.pixels).collect();
        let expected: Vec<_> = (0..150).map(pixel).collect();
        assert_eq!(pixels, expected);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn large_burst_emits_ceil_frames() {
        let (tx, mut rx, _registry, _handle) = start(25, Duration::from_millis(30));
        for i in 0..110 {
            tx.send(pixel(i)).expect("queue");
        }
        let mut sizes = Vec::new();
        for _ in 0..110usize.div_ceil(25) {
            sizes.push(next_frame(&mut rx).await.pixels.len());
        }
        assert_eq!(sizes, vec![25, 25, 25, 25, 10]);

        time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "no empty batches");
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn small_batch_waits_for_timer() {
        let (tx, mut rx, _registry, _handle) = start(100, Duration::from_millis(30));
        time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "idle ticks send nothing");

        let started = Instant::now();
        for i in 0..7 {
            tx.send(pixel(i)).expect("queue");
        }
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame.pixels.len(), 7);
        assert!(started.elapsed() <= Duration::from_millis(30));

        time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn failed_client_is_pruned_and_skipped() {
        let registry = ClientRegistry::new();
        let (healthy, mut healthy_rx) = ClientHandle::channel(16);
        let (broken, broken_rx) = ClientHandle::channel(16);
        registry.register(healthy);
        registry.register(broken.clone());
        drop(broken_rx);

        let (tx, updates) = update_queue();
        let _handle = BroadcastBatcher::new(
            BatcherConfig {
                batch_size: 2,
                flush_interval: Duration::from_millis(30),
            },
            registry.clone(),
        )
        .spawn(updates);

        tx.send(pixel(1)).expect("queue");
        tx.send(pixel(2)).expect("queue");
        assert_eq!(next_frame(&mut healthy_rx).await.pixels.len(), 2);
        assert!(!registry.contains(broken.id()));
        assert_eq!(registry.len(), 1);

        tx.send(pixel(3)).expect("queue");
        tx.send(pixel(4)).expect("queue");
        assert_eq!(next_frame(&mut healthy_rx).await.pixels.len(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn closing_queue_drains_pending() {
        let (tx, mut rx, _registry, handle) = start(100, Duration::from_secs(60));
        for i in 0..3 {
            tx.send(pixel(i)).expect("queue");
        }
        drop(tx);
        handle.await.expect("batcher exits");
        assert_eq!(next_frame(&mut rx).await.pixels.len(), 3);
    }
}
