use std::{ops::ControlFlow, path::Path};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};
use tracking_core::{ProcessTracker, Sensor, config::proc_name, file_tree::show_tree};

use crate::cli::SensorDaemonOpts;

mod config;
pub mod replay;
pub mod term_print;

pub use config::SensorConfig;
use replay::ReplayStats;
use term_print::{ProcessCounters, TermPrintable};

pub async fn sensor_daemon_run(options: &SensorDaemonOpts) -> Result<()> {
    log::trace!("Sensor Daemon Options: {:?}", options);

    let config = if let Some(custom_file) = &options.config_file {
        SensorConfig::with_custom_file(custom_file)?
    } else {
        SensorConfig::new()?
    };
    let tracker_config = config.tracker_config()?;

    let (tx, rx) = mpsc::unbounded_channel();
    let sensor = Sensor::new(ProcessTracker::new(tracker_config, tx));
    let drain_handle = tokio::spawn(replay::drain(rx, tokio::io::stdout()));

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    let replay_stats = tokio::select! {
        stats = run_replay(options.input.as_deref(), &sensor) => Some(stats?),
        _ = sig_int.recv() => {
            log::trace!("SIGINT received");
            None
        }
        _ = sig_term.recv() => {
            log::trace!("SIGTERM received");
            None
        }
    };

    if options.dump {
        dump(&sensor, replay_stats)?;
    }

    log::info!("Terminating tracking...");
    sensor.tracker().shutdown();
    drop(sensor);

    let written = drain_handle.await.context("Event writer failed")??;
    log::info!("{written} events written");

    Ok(())
}

async fn run_replay(input: Option<&Path>, sensor: &Sensor) -> Result<ReplayStats> {
    let stats = match input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Error opening {path:?}"))?;
            replay::replay(BufReader::new(file), sensor).await?
        }
        None => replay::replay(BufReader::new(tokio::io::stdin()), sensor).await?,
    };
    log::info!(
        "Replayed {} records ({} dropped, {} malformed)",
        stats.records,
        stats.dropped,
        stats.malformed
    );
    Ok(stats)
}

fn dump(sensor: &Sensor, replay_stats: Option<ReplayStats>) -> Result<()> {
    let tracker = sensor.tracker();

    if let Some(replay_stats) = replay_stats {
        replay_stats.term_print()?;
    }
    tracker.stats().term_print()?;
    tracker.show_table().term_print()?;
    tracker.files().show_table().term_print()?;
    for tree in tree_dumps(tracker) {
        tree.term_print()?;
    }

    let mut processes = Vec::new();
    let _ = tracker.for_each(|posix| {
        let name = posix
            .exec_identity()
            .and_then(|exec| exec.path())
            .map(|path| proc_name(&path).to_string())
            .unwrap_or_default();
        processes.push(ProcessCounters {
            pid: posix.pid(),
            name,
            counters: posix.counters().snapshot(),
        });
        ControlFlow::Continue(())
    });
    processes.term_print()?;

    Ok(())
}

/// One rendered file tree per process holding tracked files.
fn tree_dumps(tracker: &ProcessTracker) -> Vec<String> {
    let mut trees = Vec::new();
    let _ = tracker.for_each_tree(|tree| {
        trees.push(show_tree(tree));
        ControlFlow::Continue(())
    });
    trees
}
