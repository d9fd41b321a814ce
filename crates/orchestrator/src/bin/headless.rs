//! Headless frame driver
//!
//! Loads a scene config, runs a number of frames and prints per-frame
//! statistics as JSON lines.

use clap::{Parser, ValueEnum};
use orchestrator::scene::overview_camera;
use orchestrator::{build_scene, BackendType, SceneConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Cpu,
    Gpu,
    Auto,
}

impl From<Backend> for BackendType {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Cpu => BackendType::Cpu,
            Backend::Gpu => BackendType::Gpu,
            Backend::Auto => BackendType::Auto,
        }
    }
}

/// Run a fluid scene without a window.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Scene configuration (JSON)
    config: String,
    /// Frames to run
    #[arg(short, long, default_value_t = 120)]
    frames: u64,
    /// Override the configured backend
    #[arg(short, long, value_enum)]
    backend: Option<Backend>,
    /// Submit and wait after every pipeline stage
    #[arg(long)]
    per_stage: bool,
    /// Draw the surface after every frame
    #[arg(long)]
    draw: bool,
    /// Print statistics every N frames (0: only the last frame)
    #[arg(long, default_value_t = 10)]
    stats_every: u64,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bukkit_headless=info,orchestrator=info,kernel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(Args::parse()) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = SceneConfig::load(&args.config)?;
    if let Some(backend) = args.backend {
        config.backend = backend.into();
    }
    if args.per_stage {
        config.submit_policy = kernel::SubmitPolicy::PerStage;
    }
    tracing::info!("Running {} for {} frames", config.name, args.frames);

    let mut scene = build_scene(&config)?;
    tracing::info!("Device: {}", scene.device_name());
    let dims = config.surface_dims();
    let extent = std::array::from_fn(|i| dims[i] as f32 * config.surface.resolution);
    let camera = overview_camera(config.surface.min, extent);

    let started = std::time::Instant::now();
    for frame in 1..=args.frames {
        scene.compute()?;
        if args.draw {
            scene.draw(camera)?;
        }
        let report = frame == args.frames || (args.stats_every > 0 && frame % args.stats_every == 0);
        if report {
            let stats = scene.frame_stats()?;
            println!("{}", serde_json::to_string(&stats)?);
        }
    }
    let elapsed = started.elapsed();
    tracing::info!(
        "{} frames in {:.2?} ({:.2} ms/frame)",
        args.frames,
        elapsed,
        elapsed.as_secs_f64() * 1000.0 / args.frames.max(1) as f64
    );

    scene.release_resources()?;
    Ok(())
}
