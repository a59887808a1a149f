use lane_replay_common::config::{BackendKind, Config};
use lane_replay_engine::clip::encoder::check_ffmpeg_available;
use lane_replay_engine::clip::{ClipFailure, FfmpegClipSink};
use lane_replay_engine::detect::{InferenceBackend, NullBackend, ScriptedBackend};
use lane_replay_engine::stats::StatsReporter;
use lane_replay_engine::{Pipeline, SessionCommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        cameras = config.cameras.len(),
        lanes = config.lanes.len(),
        tolerance_ms = config.sync.tolerance_ms,
        debounce_frames = config.events.debounce_frames,
        retention_secs = config.buffer.retention_secs,
        output_dir = %config.storage.output_dir.display(),
        "starting lane replay daemon"
    );

    let backend: Arc<dyn InferenceBackend> = match config.detection.backend {
        BackendKind::Null => Arc::new(NullBackend),
        BackendKind::Scripted => {
            // validate() guarantees the path for the scripted backend.
            let path = config.detection.script_path.clone().unwrap_or_default();
            match ScriptedBackend::load(&path) {
                Ok(b) => Arc::new(b),
                Err(e) => {
                    error!(error = %e, "failed to load detection script");
                    std::process::exit(1);
                }
            }
        }
    };

    // Check ffmpeg availability (clip storage will fail without it).
    check_ffmpeg_available().await;
    let sink = Arc::new(FfmpegClipSink::new(&config.storage));

    let stats_path = config.stats.path.clone();
    let stats_interval = Duration::from_secs(config.stats.interval_secs.max(1));

    let (mut pipeline, alerts) = match Pipeline::start(config, backend, sink, HashMap::new()) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to start pipeline");
            std::process::exit(1);
        }
    };

    let reporter = StatsReporter::new(
        stats_path,
        stats_interval,
        Arc::clone(pipeline.stats()),
        Arc::clone(pipeline.ingest_stats()),
    );
    let reporter_task = tokio::spawn(reporter.run(pipeline.shutdown_signal()));
    tokio::spawn(log_alerts(alerts));

    // Session commands arrive as JSON lines on stdin.
    info!("reading session commands from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("interrupt received");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_command_line(&mut pipeline, &line).await,
                Ok(None) => {
                    info!("session command feed closed; running until interrupted");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read session command feed");
                    stdin_open = false;
                }
            },
        }
    }

    pipeline.shutdown().await;
    if let Err(e) = reporter_task.await {
        warn!(error = %e, "stats reporter ended abnormally");
    }
}

async fn handle_command_line(pipeline: &mut Pipeline, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let command: SessionCommand = match serde_json::from_str(line) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, line, "malformed session command, skipping");
            return;
        }
    };
    let lane = command.lane().clone();
    match pipeline.apply(command).await {
        Ok(Some(status)) => {
            info!(lane = %lane, session = ?status.session, phase = status.phase.as_str(), "session command applied")
        }
        Ok(None) => info!(lane = %lane, "lane removed"),
        Err(e) => warn!(lane = %lane, error = %e, "session command rejected"),
    }
}

/// Stand-in for the external alerting path: clips the sink never accepted.
async fn log_alerts(mut alerts: mpsc::Receiver<ClipFailure>) {
    while let Some(failure) = alerts.recv().await {
        error!(
            clip = %failure.clip_id,
            lane = %failure.lane_id,
            attempts = failure.attempts,
            error = %failure.error,
            "clip lost after retries"
        );
    }
}
