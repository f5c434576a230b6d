//! PlayerKit simulator (playerkit-sim) - Main entry point
//!
//! Composes a full playback Context on the simulated backend and drives one
//! session through it: prepare, play, seek, inline → full-screen → inline
//! transfer, pause, detach. Prints a summary of what happened.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use playerkit_common::config::PlayerKitConfig;
use playerkit_common::events::LoadState;
use playerkit_core::engine::sim::SimulatedBackendFactory;
use playerkit_core::engine::MediaDescriptor;
use playerkit_core::playback::{PlaybackControlCapability, SessionSnapshot};
use playerkit_core::pool::{EnginePoolCapability, PoolStatistics};
use playerkit_core::scene::{SceneKind, SceneManagerCapability, SceneTransferCapability, TransferReceipt};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for playerkit-sim
#[derive(Parser, Debug)]
#[command(name = "playerkit-sim")]
#[command(about = "Drive a simulated playback session through PlayerKit")]
#[command(version)]
struct Args {
    /// Config file (overrides PLAYERKIT_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source to play
    #[arg(short, long, default_value = "clip.mp4")]
    source: String,

    /// Seek target in seconds
    #[arg(long, default_value = "30")]
    seek_secs: u64,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Summary {
    source: String,
    transfers: Vec<TransferReceipt>,
    final_state: Option<SessionSnapshot>,
    pool: PoolStatistics,
}

const WAIT_LIMIT: Duration = Duration::from_secs(2);

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .with_context(|| format!("Timed out waiting for {}", what))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = PlayerKitConfig::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting playerkit-sim (pool max {}, prewarm {})",
        config.pool.max_pool_size, config.pool.prewarm_count
    );

    let factory = Arc::new(SimulatedBackendFactory::auto());
    let context = playerkit_core::standard_context("playerkit-sim", &config, factory)
        .context("Failed to compose playback context")?;

    let scenes = context.resolve::<SceneManagerCapability>()?;
    scenes.register_scene("inline", SceneKind::Inline)?;
    scenes.register_scene("fullscreen", SceneKind::FullScreen)?;
    scenes.activate("inline")?;

    let control = context.resolve::<PlaybackControlCapability>()?;
    let pump = control.clone().spawn_signal_pump();

    let session = control
        .clone()
        .acquire(MediaDescriptor::new(args.source.clone()))
        .context("Failed to open session")?;
    control.prepare()?;
    wait_until("source to load", || control.load_state() != LoadState::Preparing).await?;
    if control.load_state() != LoadState::Ready {
        anyhow::bail!("Source {} failed to load", args.source);
    }

    control.play()?;
    let target = Duration::from_secs(args.seek_secs);
    control.seek(target)?;
    wait_until("seek to complete", || control.current_position() >= target).await?;
    info!("Playing {} at {:?}", args.source, control.current_position());

    scenes.attach_session("inline", session.clone())?;
    let transfer = context.resolve::<SceneTransferCapability>()?;
    let mut transfers = Vec::new();
    scenes.activate("fullscreen")?;
    transfers.push(transfer.transfer("inline", "fullscreen")?);
    scenes.activate("inline")?;
    transfers.push(transfer.transfer("fullscreen", "inline")?);

    control.pause()?;
    let final_state = session.snapshot();

    scenes.detach_session("inline")?;
    control.detach()?;
    let pool = context.resolve::<EnginePoolCapability>()?.statistics();

    if let Some(pump) = pump {
        pump.abort();
    }
    context.teardown().context("Context teardown failed")?;

    let summary = Summary {
        source: args.source,
        transfers,
        final_state,
        pool,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("source: {}", summary.source);
        for receipt in &summary.transfers {
            println!(
                "transfer {} -> {}: engine {} generation {} ({})",
                receipt.from_scene,
                receipt.to_scene,
                receipt.engine_id,
                receipt.generation,
                receipt.state.playback_state
            );
        }
        if let Some(state) = &summary.final_state {
            println!(
                "final: {} / {} at {} ms",
                state.load_state, state.playback_state, state.position_ms
            );
        }
        println!(
            "pool: {} created, {} hits, {} misses, {} idle",
            summary.pool.created, summary.pool.hits, summary.pool.misses, summary.pool.idle
        );
    }

    info!("Simulation complete");
    Ok(())
}
