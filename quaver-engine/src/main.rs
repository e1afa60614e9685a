//! quaver - terminal music player engine
//!
//! Plays files given on the command line through the streaming core:
//! decoder registry -> codec session -> output buffer -> audio device,
//! with tags served from the persistent cache.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quaver_common::role::{self, ProcessRole};
use quaver_common::Config;
use quaver_engine::audio::{CpalSink, OutputBuffer};
use quaver_engine::decoder::{noise::NoiseDecoder, symphonia::SymphoniaDecoder, DecoderRegistry};
use quaver_engine::player::Player;
use quaver_engine::tags::TagCache;

/// Command-line arguments for quaver
#[derive(Parser, Debug)]
#[command(name = "quaver")]
#[command(about = "Terminal music player engine")]
#[command(version)]
struct Args {
    /// Files to play, in order
    files: Vec<PathBuf>,

    /// Config file path
    #[arg(short, long, env = "QUAVER_CONFIG")]
    config: Option<PathBuf>,

    /// Audio output device name (overrides config)
    #[arg(short, long)]
    device: Option<String>,

    /// Print tags for the given files instead of playing them
    #[arg(long)]
    tags: bool,

    /// Run as the background server process (changes fatal-error routing)
    #[arg(long)]
    server: bool,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quaver=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    role::set_role(if args.server {
        ProcessRole::Server
    } else {
        ProcessRole::Client
    });

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    debug!("Configuration: {:?}", config);

    // No tag cache is not a supported degraded mode
    let cache_dir = config.cache_dir();
    let cache = match TagCache::open(&cache_dir, config.tag_sync_interval) {
        Ok(cache) => Arc::new(cache),
        Err(e) => role::fatal(&format!(
            "cannot open tag cache at {}: {}",
            cache_dir.display(),
            e
        )),
    };

    let mut registry = DecoderRegistry::new();
    registry.register(Arc::new(SymphoniaDecoder::new(config.use_mmap)));
    registry.register(Arc::new(NoiseDecoder));
    registry
        .load_preferences(&config.preferred_decoders)
        .context("Invalid preferred_decoders entry")?;
    let registry = Arc::new(registry);
    info!("{} decoders registered", registry.len());

    let player = Player::new(Arc::clone(&registry), Some(cache));

    if args.files.is_empty() {
        info!("Nothing to play");
        return Ok(());
    }

    if args.tags {
        for path in &args.files {
            match player.tags_for(path) {
                Ok(tags) => println!(
                    "{}: {} - {} ({}) track {} [{}s]",
                    path.display(),
                    tags.artist,
                    tags.title,
                    tags.album,
                    tags.track,
                    tags.duration
                ),
                Err(e) => eprintln!("{}: {}", path.display(), e),
            }
        }
        return Ok(());
    }

    let device = args.device.or_else(|| config.audio_device.clone());
    let sink = CpalSink::new(device);
    let out = OutputBuffer::new(config.output_buffer_kb * 1024, Box::new(sink));

    let played = player.play_queue(&args.files, &out);
    // Dropping the buffer drains what is left and joins the consumer
    drop(out);

    if played == 0 && !args.files.is_empty() {
        anyhow::bail!("no file could be played");
    }
    Ok(())
}
