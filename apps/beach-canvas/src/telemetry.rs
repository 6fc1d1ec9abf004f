use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::batcher::DEFAULT_BATCH_SIZE;

const OTEL_STDOUT_ENV: &str = "BEACH_CANVAS_OTEL_STDOUT";

const COUNTERS: &[(&str, &str)] = &[
    ("beach_canvas_pixels_accepted_total", "Writes applied to the canvas."),
    ("beach_canvas_pixels_rejected_total", "Writes refused, labelled by reason."),
    ("beach_canvas_batches_flushed_total", "Delta frames broadcast, labelled by trigger."),
    ("beach_canvas_clients_pruned_total", "Viewers dropped from the broadcast set, labelled by reason."),
    ("beach_canvas_snapshot_frames_total", "Full-state frames sent to bootstrapping viewers."),
    ("beach_canvas_snapshot_failures_total", "Viewers lost before their bootstrap completed."),
    ("beach_canvas_snapshot_saves_total", "Canvas snapshots written, labelled by reason."),
    ("beach_canvas_snapshot_save_failures_total", "Canvas snapshot writes that failed."),
];

/// Batch sizes cluster at the size trigger; anything past it is a timer or drain flush.
fn batch_pixel_buckets() -> Vec<f64> {
    let full = DEFAULT_BATCH_SIZE as f64;
    vec![1.0, 5.0, 10.0, 25.0, 50.0, full, full * 2.5, full * 10.0]
}

const SNAPSHOT_MS_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

/// Recorder layout for canvas metrics: histograms are exported with fixed buckets
/// instead of summaries so batch sizes and snapshot latencies aggregate across instances.
fn prometheus_builder() -> Result<PrometheusBuilder> {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("beach_canvas_batch_pixels".into()),
            &batch_pixel_buckets(),
        )?
        .set_buckets_for_metric(
            Matcher::Suffix("_ms".into()),
            SNAPSHOT_MS_BUCKETS,
        )?;
    Ok(builder)
}

fn describe_canvas_metrics() {
    for (name, description) in COUNTERS {
        describe_counter!((*name), (*description));
    }
    describe_gauge!("beach_canvas_clients_active", "Viewers currently receiving deltas.");
    describe_histogram!("beach_canvas_batch_pixels", "Pixels per broadcast delta frame.");
    describe_histogram!(
        "beach_canvas_snapshot_duration_ms",
        Unit::Milliseconds,
        "Time to stream the full canvas to one viewer."
    );
    describe_histogram!(
        "beach_canvas_snapshot_save_ms",
        Unit::Milliseconds,
        "Time to write one canvas snapshot to disk."
    );
}

/// Process-wide logging and metrics; keep alive for the lifetime of the server.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = prometheus_builder()?
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_canvas_metrics();

        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        let tracer_provider = if env_truthy(OTEL_STDOUT_ENV) {
            let provider = SdkTracerProvider::builder()
                .with_simple_exporter(SpanExporter::default())
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(
                    Resource::builder()
                        .with_attributes(vec![KeyValue::new("service.name", "beach-canvas")])
                        .build(),
                )
                .build();
            global::set_tracer_provider(provider.clone());
            Some(provider)
        } else {
            None
        };
        let otel_layer = tracer_provider
            .as_ref()
            .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("beach-canvas")));

        tracing_subscriber::registry()
            .with(default_filter())
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| parse_flag(&val))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
