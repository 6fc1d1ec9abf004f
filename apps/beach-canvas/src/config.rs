use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::batcher::BatcherConfig;
use crate::persistence::DEFAULT_SAVE_INTERVAL;
use crate::wire::MAX_PIXELS_PER_FRAME;

#[derive(Debug, Parser)]
#[command(
    name = "beach-canvas",
    author,
    version,
    about = "Shared pixel canvas server with batched websocket fan-out",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the canvas server (default when no subcommand is given).
    Serve(ServeArgs),
    /// Connect to a running server for manual checks.
    Probe {
        #[command(subcommand)]
        action: ProbeAction,
    },
}

impl Cli {
    /// Resolves the bare invocation to `serve` with the top-level arguments.
    pub fn into_command(self) -> Commands {
        self.command.unwrap_or(Commands::Serve(self.serve))
    }
}

#[derive(Debug, Subcommand)]
pub enum ProbeAction {
    /// Subscribe to the viewer stream and report the frames received.
    Watch {
        /// Viewer websocket URL.
        #[arg(long, default_value = "ws://127.0.0.1:9992/ws")]
        url: String,
        /// Stop after this many delta frames (0 = run until the socket closes).
        #[arg(long, default_value_t = 0)]
        deltas: usize,
    },
    /// Send a single pixel over the draw socket and print the acknowledgement.
    #[command(allow_negative_numbers = true)]
    Draw {
        /// Draw websocket URL.
        #[arg(long, default_value = "ws://127.0.0.1:9992/ws/draw")]
        url: String,
        x: i64,
        y: i64,
        r: u8,
        g: u8,
        b: u8,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP/websocket listener to.
    #[arg(long, env = "BEACH_CANVAS_LISTEN_ADDR", default_value = "0.0.0.0:9992")]
    pub listen_addr: String,

    /// Canvas width in pixels.
    #[arg(long, env = "BEACH_CANVAS_WIDTH", default_value_t = 1024)]
    pub width: u16,

    /// Canvas height in pixels.
    #[arg(long, env = "BEACH_CANVAS_HEIGHT", default_value_t = 1024)]
    pub height: u16,

    /// Snapshot file restored at startup and rewritten on every save.
    #[arg(long, env = "BEACH_CANVAS_SNAPSHOT_PATH", default_value = "canvas.bin")]
    pub snapshot_path: PathBuf,

    /// Seconds between periodic snapshot saves.
    #[arg(long, env = "BEACH_CANVAS_SAVE_INTERVAL_SECS", default_value_t = 60)]
    pub save_interval_secs: u64,

    /// Pixels that trigger an immediate delta flush.
    #[arg(long, env = "BEACH_CANVAS_BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    /// Maximum time a pending write waits before being flushed.
    #[arg(long, env = "BEACH_CANVAS_FLUSH_INTERVAL_MS", default_value_t = 30)]
    pub flush_interval_ms: u64,

    /// Pixels per full-state frame when bootstrapping a viewer.
    #[arg(long, env = "BEACH_CANVAS_SNAPSHOT_CHUNK", default_value_t = 5000)]
    pub snapshot_chunk: usize,

    /// Frames buffered per viewer before it is considered lagging and dropped.
    #[arg(long, env = "BEACH_CANVAS_OUTBOUND_BUFFER", default_value_t = 256)]
    pub outbound_buffer: usize,

    /// Idle seconds after which a draw socket is closed.
    #[arg(long, env = "BEACH_CANVAS_DRAW_IDLE_TIMEOUT_SECS", default_value_t = 30)]
    pub draw_idle_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_CANVAS_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub width: u16,
    pub height: u16,
    pub snapshot_path: PathBuf,
    pub save_interval: Duration,
    pub batcher: BatcherConfig,
    pub snapshot_chunk: usize,
    pub outbound_buffer: usize,
    pub draw_idle_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.width == 0 || args.height == 0 {
            bail!("canvas must be at least 1x1, got {}x{}", args.width, args.height);
        }
        check_frame_bound("batch size", args.batch_size)?;
        check_frame_bound("snapshot chunk", args.snapshot_chunk)?;
        if args.flush_interval_ms == 0 {
            bail!("flush interval must be greater than zero");
        }
        if args.save_interval_secs == 0 {
            bail!("save interval must be greater than zero");
        }

        Ok(ServerConfig {
            listen_addr,
            width: args.width,
            height: args.height,
            snapshot_path: args.snapshot_path,
            save_interval: Duration::from_secs(args.save_interval_secs),
            batcher: BatcherConfig {
                batch_size: args.batch_size,
                flush_interval: Duration::from_millis(args.flush_interval_ms),
            },
            snapshot_chunk: args.snapshot_chunk,
            outbound_buffer: args.outbound_buffer.max(1),
            draw_idle_timeout: Duration::from_secs(args.draw_idle_timeout_secs.max(1)),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

fn check_frame_bound(name: &str, value: usize) -> Result<()> {
    if value == 0 || value > MAX_PIXELS_PER_FRAME {
        bail!("{name} must be within 1..={MAX_PIXELS_PER_FRAME}, got {value}");
    }
    Ok(())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9992)),
            width: 1024,
            height: 1024,
            snapshot_path: PathBuf::from("canvas.bin"),
            save_interval: DEFAULT_SAVE_INTERVAL,
            batcher: BatcherConfig::default(),
            snapshot_chunk: 5000,
            outbound_buffer: 256,
            draw_idle_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        let mut argv = vec!["beach-canvas"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv)?;
        match cli.into_command() {
            Commands::Serve(args) => ServerConfig::try_from(args),
            other => bail!("expected serve, got {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn defaults_match_reference_server() {
        let config = parse(&[]).expect("defaults");
        assert_eq!(config.listen_addr.port(), 9992);
        assert_eq!((config.width, config.height), (1024, 1024));
        assert_eq!(config.batcher.batch_size, 100);
        assert_eq!(config.batcher.flush_interval, Duration::from_millis(30));
        assert_eq!(config.snapshot_chunk, 5000);
        assert_eq!(config.save_interval, Duration::from_secs(60));
    }

    #[test_timeout::timeout]
    fn rejects_out_of_range_values() {
        assert!(parse(&["--batch-size", "0"]).is_err());
        assert!(parse(&["--batch-size", "65536"]).is_err());
        assert!(parse(&["--snapshot-chunk", "70000"]).is_err());
        assert!(parse(&["--width", "0"]).is_err());
        assert!(parse(&["--listen-addr", "nope"]).is_err());
    }

    #[test_timeout::timeout]
    fn serve_subcommand_accepts_server_flags() {
        let config = parse(&["serve", "--width", "64", "--batch-size", "10"]).expect("serve args");
        assert_eq!((config.width, config.height), (64, 1024));
        assert_eq!(config.batcher.batch_size, 10);

        let bare = parse(&["--width", "32"]).expect("top-level args");
        assert_eq!(bare.width, 32);

        assert!(Cli::try_parse_from(["beach-canvas", "--width", "32", "serve"]).is_err());
    }

    #[test_timeout::timeout]
    fn probe_subcommand_parses() {
        let cli = Cli::try_parse_from(["beach-canvas", "probe", "draw", "1", "2", "3", "4", "5"])
            .expect("parse");
        match cli.into_command() {
            Commands::Probe {
                action: ProbeAction::Draw { x, y, r, g, b, .. },
            } => assert_eq!((x, y, r, g, b), (1, 2, 3, 4, 5)),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
