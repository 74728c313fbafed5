//! Parley CLI
//!
//! Runs a live voice session against the configured agent, plays narration
//! scripts, or lists capture devices.

mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Args, Command};
use parley_voice::{CpalCapture, NarrationSegment, ParleyConfig, ParleyEngine, PhaseState};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[parley] .env not loaded: {} (using system environment)", e);
    }

    let args = Args::parse();
    cli::init_logging(&args);

    match &args.command {
        Command::Devices => list_devices(),
        Command::Live => run_live(load_config(&args)?).await,
        Command::Narrate { script } => run_narration(load_config(&args)?, script).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<ParleyConfig> {
    let config = match &args.config {
        Some(path) => ParleyConfig::load_from(&path.to_string_lossy()),
        None => ParleyConfig::load(),
    };
    config.context("load parley config")
}

fn list_devices() -> anyhow::Result<()> {
    let devices = CpalCapture::list_input_devices().context("enumerate capture devices")?;
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for name in devices {
        println!("🎤 {}", name);
    }
    Ok(())
}

/// Log every phase change until the bus goes away.
fn spawn_phase_logger(mut rx: watch::Receiver<PhaseState>) {
    tokio::spawn(async move {
        let mut last = rx.borrow().phase;
        while rx.changed().await.is_ok() {
            let state = rx.borrow().clone();
            if state.phase != last {
                tracing::info!(phase = %state.phase, "phase");
                last = state.phase;
            }
            if !state.transcript.is_empty() && state.partial_transcript.is_empty() {
                tracing::debug!(transcript = %state.transcript, "heard");
            }
        }
    });
}

async fn run_live(config: ParleyConfig) -> anyhow::Result<()> {
    let engine = ParleyEngine::from_config(&config).context("build engine")?;
    spawn_phase_logger(engine.subscribe_phase());

    engine.start_live().await.context("start live session")?;
    tracing::info!(agent = %config.agent.url, "Live session running; Ctrl-C to hang up");

    tokio::select! {
        _ = engine.live_closed() => {
            tracing::info!("Agent ended the session");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("CTRL-C received; hanging up");
        }
    }

    if let Some(stats) = engine.stop_live().await {
        tracing::info!(
            blocks_sent = stats.blocks_sent,
            frames_scheduled = stats.frames_scheduled,
            interruptions = stats.interruptions,
            turns = stats.turns_completed,
            end = ?stats.end_reason,
            "Session summary"
        );
    }
    engine.shutdown().await;
    Ok(())
}

async fn run_narration(config: ParleyConfig, script: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(script)
        .with_context(|| format!("read narration script {}", script.display()))?;
    let segments: Vec<NarrationSegment> =
        serde_json::from_str(&raw).context("parse narration script")?;

    let engine = Arc::new(ParleyEngine::from_config(&config).context("build engine")?);
    spawn_phase_logger(engine.subscribe_phase());

    let mut player = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.play_narration(&segments).await })
    };

    let finished = tokio::select! {
        res = &mut player => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("CTRL-C received; stopping narration");
            engine.stop_narration().await;
            player.await
        }
    };

    let outcome = finished.context("narration task")??;
    tracing::info!(?outcome, "Narration done");
    Ok(())
}
