mod monitor;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use lumen_core::features::CATEGORIES;
use lumen_core::morph::{OVERRIDE_PATH, TRIGGERS};
use lumen_core::{FeatureLayout, ManualClock, SharedState, decode, seed_from_json};
use lumen_runtime::{
    DaemonSettings, FanoutSink, FramePipeline, LumenConfig, PipelineDaemon, RecorderSink, RecordingReader,
    UdpSink,
};

use crate::server::{AppState, BroadcastSink};

const DEFAULT_URL: &str = "http://127.0.0.1:7878";

#[derive(Parser)]
#[command(name = "lumen", about = "Real-time state-to-particle visualization pipeline")]
struct Cli {
    /// Configuration file (defaults to $LUMEN_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Default)]
struct PipelineOverrides {
    /// Target frame rate
    #[arg(long)]
    fps: Option<f32>,

    /// Accelerator backend: none | reference
    #[arg(long)]
    backend: Option<String>,

    /// Attributes per particle: position | full
    #[arg(long)]
    attributes: Option<String>,

    /// JSON document to seed the shared state with
    #[arg(long)]
    seed: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the frame loop and serve frames over WebSocket
    Run {
        #[command(flatten)]
        overrides: PipelineOverrides,

        /// Listen address for the HTTP/WebSocket server
        #[arg(long)]
        listen: Option<String>,

        /// Also mirror frames as UDP datagrams to host:port
        #[arg(long)]
        udp: Option<String>,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Run the pipeline offline on a simulated clock and record the frames
    Simulate {
        #[command(flatten)]
        overrides: PipelineOverrides,

        /// Number of frames to produce
        #[arg(long, default_value_t = 90)]
        frames: u32,

        /// Recording to write
        #[arg(long, short)]
        out: PathBuf,

        /// Set a field before the first frame: PATH=VALUE (VALUE is JSON, or a bare string)
        #[arg(long = "set", value_name = "PATH=VALUE")]
        set: Vec<String>,

        /// Set a field just before a given frame: FRAME:PATH=VALUE
        #[arg(long = "at", value_name = "FRAME:PATH=VALUE")]
        at: Vec<String>,
    },

    /// Print the frame headers of a recording
    Decode {
        /// Recording written by `simulate`
        path: PathBuf,

        /// One JSON header per line
        #[arg(long)]
        json: bool,
    },

    /// Print the feature layout and the mode trigger table
    Layout,

    /// Query a running daemon's health report
    Health {
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },

    /// Follow a running daemon's metrics stream
    Watch {
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,

        /// Stop after this many reports
        #[arg(long)]
        count: Option<usize>,
    },

    /// Write a field into a running daemon's shared state
    Set {
        /// Dotted path, e.g. interaction.user_present
        path: String,

        /// JSON value, or a bare string
        value: String,

        /// Expire the value after this many seconds
        #[arg(long)]
        ttl: Option<f64>,

        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Run {
            overrides,
            listen,
            udp,
            duration,
        } => cmd_run(&cli, overrides, listen.as_deref(), udp.as_deref(), *duration).await,
        Commands::Simulate {
            overrides,
            frames,
            out,
            set,
            at,
        } => cmd_simulate(&cli, overrides, *frames, out, set, at),
        Commands::Decode { path, json } => cmd_decode(path, *json),
        Commands::Layout => cmd_layout(),
        Commands::Health { url } => cmd_health(url).await,
        Commands::Watch { url, count } => monitor::watch(url, *count).await,
        Commands::Set { path, value, ttl, url } => cmd_set(url, path, value, *ttl).await,
    }
}

fn load_config(cli: &Cli, overrides: &PipelineOverrides) -> Result<LumenConfig> {
    let mut config = LumenConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(fps) = overrides.fps {
        config.pipeline.target_fps = fps;
        config.pipeline.min_fps = config.pipeline.min_fps.min(fps);
    }
    if let Some(backend) = &overrides.backend {
        config.engine.backend = backend.clone();
    }
    if let Some(attributes) = &overrides.attributes {
        config.pipeline.attributes = attributes.parse().map_err(anyhow::Error::msg)?;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn seed_state(state: &SharedState, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let doc: serde_json::Value =
        serde_json::from_str(&content).with_context(|| format!("{} is not valid JSON", path.display()))?;
    if !doc.is_object() {
        bail!("{} must contain a JSON object", path.display());
    }
    let n = seed_from_json(state, &doc, None);
    tracing::info!("seeded {n} fields from {}", path.display());
    Ok(())
}

/// `true`, `0.5`, `[1,2]` parse as JSON; anything else is taken as a string.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn parse_assignment(raw: &str) -> Result<(String, serde_json::Value)> {
    let Some((path, value)) = raw.split_once('=') else {
        bail!("expected PATH=VALUE, got '{raw}'");
    };
    let path = path.trim();
    if path.is_empty() {
        bail!("empty path in '{raw}'");
    }
    Ok((path.to_string(), parse_value(value.trim())))
}

fn parse_scheduled(raw: &str) -> Result<(u32, String, serde_json::Value)> {
    let Some((frame, assignment)) = raw.split_once(':') else {
        bail!("expected FRAME:PATH=VALUE, got '{raw}'");
    };
    let frame: u32 = frame
        .trim()
        .parse()
        .with_context(|| format!("bad frame number in '{raw}'"))?;
    let (path, value) = parse_assignment(assignment)?;
    Ok((frame, path, value))
}

async fn cmd_run(
    cli: &Cli,
    overrides: &PipelineOverrides,
    listen: Option<&str>,
    udp: Option<&str>,
    duration: Option<f64>,
) -> Result<()> {
    let mut config = load_config(cli, overrides)?;
    if let Some(listen) = listen {
        config.server.listen = listen.to_string();
    }
    if let Some(udp) = udp {
        config.sink.udp = Some(udp.to_string());
    }

    let state = SharedState::new();
    if let Some(seed) = &overrides.seed {
        seed_state(&state, seed)?;
    }

    let mut pipeline = FramePipeline::from_config(&config, state.clone())?;
    let engine = pipeline.warm_up();
    tracing::info!("engine {engine}");

    let (frames_tx, _) = broadcast::channel(config.sink.channel_capacity);
    let mut sink = FanoutSink::new().with(Box::new(BroadcastSink::new(frames_tx.clone())));
    if let Some(target) = &config.sink.udp {
        let mut udp = UdpSink::connect(target)?;
        udp.check_frame_size(config.max_frame_bytes());
        sink.push(Box::new(udp));
    }

    let mut daemon = PipelineDaemon::new(pipeline, Box::new(sink), DaemonSettings::from_config(&config.pipeline));
    daemon.start()?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let deadline = async {
                match duration {
                    Some(secs) => tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received, shutting down"),
                _ = deadline => tracing::info!("run duration elapsed, shutting down"),
            }
            cancel.cancel();
        });
    }

    let app = AppState {
        state,
        daemon: daemon.handle(),
        frames: frames_tx,
        cancel: cancel.clone(),
    };
    let served = server::serve(&config.server.listen, app).await;
    cancel.cancel();

    let report = tokio::task::spawn_blocking(move || {
        daemon.stop();
        daemon.metrics()
    })
    .await
    .context("daemon shutdown task failed")?;
    eprintln!("{}", monitor::summary_line(&report));
    served
}

fn cmd_simulate(
    cli: &Cli,
    overrides: &PipelineOverrides,
    frames: u32,
    out: &Path,
    set: &[String],
    at: &[String],
) -> Result<()> {
    let mut config = load_config(cli, overrides)?;
    // Host load would make recordings machine-dependent.
    config.features.host_sampling = false;

    let mut schedule = at.iter().map(|s| parse_scheduled(s)).collect::<Result<Vec<_>>>()?;
    schedule.sort_by_key(|(frame, _, _)| *frame);

    let clock = ManualClock::new();
    let state = SharedState::with_clock(Arc::new(clock.clone()));
    if let Some(seed) = &overrides.seed {
        seed_state(&state, seed)?;
    }
    for raw in set {
        let (path, value) = parse_assignment(raw)?;
        state.set(&path, value);
    }

    let mut pipeline = FramePipeline::from_config(&config, state.clone())?;
    let mut recorder = RecorderSink::create(out)?;
    let fps = config.pipeline.target_fps;
    let frame_dt = 1.0 / fps;
    let step = Duration::from_secs_f32(frame_dt);

    let mut modes = Vec::new();
    let mut pending = schedule.into_iter().peekable();
    for n in 1..=frames {
        while let Some((_, path, value)) = pending.next_if(|(frame, _, _)| *frame <= n) {
            state.set(&path, value);
        }
        clock.advance(step);
        let output = pipeline
            .run_frame(frame_dt, fps)
            .with_context(|| format!("frame {n} failed"))?;
        recorder
            .write_frame(&output.bytes)
            .with_context(|| format!("failed to write {}", out.display()))?;
        if modes.last() != Some(&output.mode) {
            modes.push(output.mode);
        }
    }
    recorder
        .flush()
        .with_context(|| format!("failed to write {}", out.display()))?;
    pipeline.shutdown();

    let modes: Vec<&str> = modes.iter().map(|m| m.name()).collect();
    println!(
        "wrote {} frames to {} (modes: {})",
        recorder.frames(),
        out.display(),
        modes.join(" -> ")
    );
    Ok(())
}

fn cmd_decode(path: &Path, json: bool) -> Result<()> {
    let reader = RecordingReader::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut count = 0usize;
    for (i, bytes) in reader.enumerate() {
        let bytes = bytes.with_context(|| format!("recording {} is damaged", path.display()))?;
        let frame = decode(&bytes).with_context(|| format!("frame #{i} does not decode"))?;
        let h = &frame.header;
        if json {
            println!("{}", serde_json::to_string(h)?);
        } else {
            let mode = h.mode().map(|m| m.name()).unwrap_or("?");
            println!(
                "frame {:>6}  t={:>7}ms  mode={:<11} particles={:<6} k={}  fps={:5.1}  infer={:.2}ms total={:.2}ms{}{}",
                h.frame_id,
                h.timestamp_ms,
                mode,
                h.particle_count,
                h.layout.k(),
                h.fps,
                h.inference_ms,
                h.total_ms,
                if h.is_accelerated() { "  accelerated" } else { "" },
                if h.is_blending() { "  blending" } else { "" },
            );
        }
        count += 1;
    }
    if !json {
        println!("{count} frames");
    }
    Ok(())
}

fn cmd_layout() -> Result<()> {
    let layout = FeatureLayout::standard();
    println!("feature layout v{} ({} slots)", layout.version(), layout.specs().len());
    for category in CATEGORIES {
        println!();
        println!("[{}] slots {}..{}", category.name, category.offset, category.offset + category.len);
        for (i, spec) in layout
            .specs()
            .iter()
            .enumerate()
            .skip(category.offset)
            .take(category.len)
        {
            println!("  {i:>3}  {:<32} neutral {:.1}", spec.name, spec.neutral);
        }
    }

    println!();
    println!("mode triggers (highest priority first):");
    println!("  {OVERRIDE_PATH} names a mode and overrides every trigger");
    for (mode, condition) in TRIGGERS {
        println!("  {:<11} {condition}", mode.name());
    }
    Ok(())
}

async fn cmd_health(url: &str) -> Result<()> {
    let report = monitor::fetch_health(url).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_set(url: &str, path: &str, value: &str, ttl: Option<f64>) -> Result<()> {
    let mut body = serde_json::json!({ "path": path, "value": parse_value(value) });
    if let Some(ttl) = ttl {
        body["ttl_secs"] = serde_json::json!(ttl);
    }
    let written = monitor::post_state(url, body).await?;
    println!("wrote {written} field(s)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("true"), serde_json::json!(true));
        assert_eq!(parse_value("0.6"), serde_json::json!(0.6));
        assert_eq!(parse_value("alert"), serde_json::json!("alert"));
    }

    #[test]
    fn test_parse_scheduled() {
        let (frame, path, value) = parse_scheduled("11:interaction.user_present=true").unwrap();
        assert_eq!(frame, 11);
        assert_eq!(path, "interaction.user_present");
        assert_eq!(value, serde_json::json!(true));
        assert!(parse_scheduled("x:a=1").is_err());
        assert!(parse_scheduled("3:=1").is_err());
        assert!(parse_assignment("novalue").is_err());
    }
}
