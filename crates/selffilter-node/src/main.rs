//! `selffilter` – self-filter node
//!
//! Runs a [`SelfFilter`] against a synthetic rotating laser so the whole
//! pipeline can be exercised without hardware.  It:
//!
//! 1. Loads `selffilter.toml` (or `$SELFFILTER_CONFIG`) and seeds the pose
//!    buffer with the configured static transforms.
//! 2. Configures the filter from the robot model file, waiting for the file
//!    to appear if necessary.
//! 3. Filters one synthetic scan per period and logs the classification.
//! 4. Watches the model file and hot-reloads the filter when it changes.
//! 5. Reads `reload`, `status` and `quit` from stdin.
//! 6. Shuts down cleanly on Ctrl-C.

mod config;
mod model_file;

use std::f32::consts::PI;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::Utc;
use selffilter_kernel::{FilterState, LaserScan, ScanHeader, SelfFilter, SimClassifier};
use selffilter_perception::PoseBuffer;
use selffilter_types::{DescriptionField, FilterError, MaskValue, ModelUpdate, SystemClock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, SyntheticLaser};
use crate::model_file::FileDescriptions;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG selects the level (default "info"); SELFFILTER_LOG_FORMAT=json
    // switches to newline-delimited JSON.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("SELFFILTER_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let path = config::config_path();
    let cfg = config::load_from(&path)?;
    info!(
        config = %path.display(),
        robot_model = %cfg.robot_model.display(),
        fixed_frame = %cfg.filter.fixed_frame,
        sensor_frame = %cfg.filter.sensor_frame,
        "self-filter node starting"
    );

    let poses = Arc::new(PoseBuffer::new(cfg.filter.retention()));
    for t in &cfg.static_transforms {
        poses.set_static_transform(&t.parent, &t.child, t.isometry());
    }

    let filter = Arc::new(SelfFilter::new(
        cfg.filter.clone(),
        Box::new(SimClassifier::with_range(
            cfg.filter.min_distance,
            cfg.filter.max_distance,
        )),
        poses,
        Arc::new(FileDescriptions::new(&cfg.robot_model)),
        Arc::new(SystemClock),
    ));

    // Blocks until a model description is available.
    let configuring = {
        let filter = Arc::clone(&filter);
        tokio::task::spawn_blocking(move || filter.configure())
    };

    let scans = tokio::spawn(scan_loop(Arc::clone(&filter), cfg.clone()));
    let watcher = tokio::spawn(watch_model(Arc::clone(&filter), cfg.clone()));

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("Ctrl-C received, shutting down");
        }
        res = console(Arc::clone(&filter)) => {
            if let Err(e) = res {
                warn!(error = %format!("{e:#}"), "console failed");
            }
            info!("quit requested, shutting down");
        }
    }

    filter.shutdown();
    scans.abort();
    watcher.abort();

    match configuring.await {
        Ok(Ok(())) | Ok(Err(FilterError::ShutDown)) => {}
        Ok(Err(e)) => warn!(error = %e, "configuration did not complete"),
        Err(e) => warn!(error = %e, "configuration task failed"),
    }
    info!(reconfigurations = filter.reconfigurations(), "self-filter node stopped");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Synthetic scans
// ─────────────────────────────────────────────────────────────────────────────

fn synthetic_scan(frame: &str, laser: &SyntheticLaser) -> LaserScan {
    let rays = laser.rays.max(1);
    LaserScan {
        header: ScanHeader::new(Utc::now(), frame),
        angle_min: -PI,
        angle_increment: 2.0 * PI / rays as f32,
        time_increment: laser.time_increment,
        range_min: 0.0,
        range_max: laser.range * 2.0,
        ranges: vec![laser.range; rays],
    }
}

async fn scan_loop(filter: Arc<SelfFilter>, cfg: NodeConfig) {
    let mut ticker = tokio::time::interval(cfg.scan_period());
    loop {
        ticker.tick().await;
        if filter.state() != FilterState::Active {
            continue;
        }

        let scan = synthetic_scan(&cfg.filter.sensor_frame, &cfg.laser);
        let worker = Arc::clone(&filter);
        let result = tokio::task::spawn_blocking(move || worker.filter(scan)).await;
        match result {
            Ok(Ok(outcome)) => {
                let kept = outcome.mask.iter().filter(|m| m.is_outside()).count();
                debug!(
                    generation = outcome.generation,
                    points = outcome.mask.len(),
                    kept,
                    inside = outcome.points_with(MaskValue::Inside).len(),
                    shadow = outcome.points_with(MaskValue::Shadow).len(),
                    clip = outcome.points_with(MaskValue::Clip).len(),
                    "scan filtered"
                );
                if let Some(sphere) = outcome.bounds.sphere {
                    debug!(radius = sphere.radius, "robot bounding sphere");
                }
            }
            Ok(Err(FilterError::WarmingUp { .. } | FilterError::NotConfigured)) => {}
            Ok(Err(e)) => warn!(error = %e, "scan dropped"),
            Err(e) => warn!(error = %e, "filter task failed"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Model file watcher
// ─────────────────────────────────────────────────────────────────────────────

async fn watch_model(filter: Arc<SelfFilter>, cfg: NodeConfig) {
    let path: PathBuf = cfg.robot_model.clone();
    let mut seen: Option<SystemTime> = model_file::modified(&path);
    let mut ticker = tokio::time::interval(cfg.model_poll());
    loop {
        ticker.tick().await;
        let current = model_file::modified(&path);
        if current.is_none() || current == seen {
            continue;
        }
        seen = current;

        let model = match model_file::read_model(&path) {
            Ok(model) => model,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "ignoring model change");
                continue;
            }
        };
        info!(path = %path.display(), "robot model changed");

        let update = ModelUpdate {
            fields: vec![DescriptionField {
                name: cfg.filter.robot_description_field.clone(),
                model,
            }],
        };
        let worker = Arc::clone(&filter);
        match tokio::task::spawn_blocking(move || worker.on_model_changed(&update)).await {
            Ok(Some(outcome)) if !outcome.success => {
                warn!(message = %outcome.message, "reload after model change failed");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "reload task failed"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Console
// ─────────────────────────────────────────────────────────────────────────────

/// Serve stdin commands until `quit`.  End of input leaves the node running.
async fn console(filter: Arc<SelfFilter>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        match line.trim() {
            "" => {}
            "quit" | "exit" => return Ok(()),
            "reload" => {
                let worker = Arc::clone(&filter);
                let outcome = tokio::task::spawn_blocking(move || worker.reload())
                    .await
                    .context("reload task failed")?;
                if outcome.success {
                    println!("  reload ok (generation {})", filter.generation());
                } else {
                    println!("  reload failed: {}", outcome.message);
                }
            }
            "status" => print_status(&filter),
            other => println!("  unknown command `{other}` (reload, status, quit)"),
        }
    }
    std::future::pending::<()>().await;
    Ok(())
}

fn print_status(filter: &SelfFilter) {
    println!("  state:             {:?}", filter.state());
    match filter.configured_since() {
        Some(since) => println!("  configured since:  {since}"),
        None => println!("  configured since:  -"),
    }
    println!("  generation:        {}", filter.generation());
    println!("  reconfigurations:  {}", filter.reconfigurations());
    let unreachable = filter.unreachable_frames();
    if unreachable.is_empty() {
        println!("  unreachable links: none");
    }
    for frame in unreachable {
        match filter.watchdog().since_last_seen(&frame) {
            Some(ago) => println!(
                "  unreachable link:  {frame} (last seen {:.1}s ago)",
                ago.as_secs_f64()
            ),
            None => println!("  unreachable link:  {frame} (never seen)"),
        }
    }
}
