//! Feeding raw records into the sensor and writing out what it emits.

use anyhow::{Context, Result};
use sensor_common::{RawEvent, log_error};
use serde::Serialize;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracking_core::{Event, Sensor};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub records: u64,
    pub handled: u64,
    pub dropped: u64,
    pub malformed: u64,
}

/// Apply every JSON line of `reader` to `sensor`. Malformed lines are
/// logged and skipped.
pub async fn replay<R>(reader: R, sensor: &Sensor) -> Result<ReplayStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = ReplayStats::default();
    let mut lines = reader.lines();

    while let Some(line) = lines
        .next_line()
        .await
        .context("Error reading raw records")?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        stats.records += 1;

        match RawEvent::from_json(line) {
            Ok(raw) => {
                log::trace!("{raw}");
                if sensor.handle(raw) {
                    stats.handled += 1;
                } else {
                    stats.dropped += 1;
                }
            }
            Err(err) => {
                stats.malformed += 1;
                log_error(&format!("Skipping record {}", stats.records), err);
            }
        }
    }

    Ok(stats)
}

/// Write every event as a JSON line until all senders are gone. Returns the
/// number of events written.
pub async fn drain<W>(mut rx: mpsc::UnboundedReceiver<Event>, mut out: W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(event) = rx.recv().await {
        log::debug!("{event}");
        let mut line = serde_json::to_vec(&event).context("Error serializing event")?;
        line.push(b'\n');
        out.write_all(&line).await.context("Error writing event")?;
        written += 1;
    }
    out.flush().await.context("Error writing event")?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use tracking_core::{EventType, ProcessTracker, config::TrackerConfig};

    use super::*;

    const RECORDS: &str = r#"
{"timestamp": 1, "pid": 100, "task": {"comm": "bash", "parent_pid": 1}, "payload": {"type": "Fork", "content": {"ppid": 1}}}
{"timestamp": 2, "pid": 100, "payload": {"type": "Exec", "content": {"path": "/usr/bin/id", "path_found": true, "device": 8, "inode": 12, "cmdline": "id -u"}}}
not json
{"timestamp": 3, "pid": 100, "payload": {"type": "Exit", "content": {"exit_code": 0}}}
{"timestamp": 4, "pid": 100, "payload": {"type": "Exit", "content": {"exit_code": 0}}}
"#;

    #[tokio::test]
    async fn replay_then_drain() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sensor = Sensor::new(ProcessTracker::new(TrackerConfig::default(), tx));

        let stats = replay(RECORDS.as_bytes(), &sensor).await.unwrap();
        assert_eq!(
            stats,
            ReplayStats {
                records: 5,
                handled: 3,
                dropped: 1,
                malformed: 1,
            }
        );

        sensor.tracker().shutdown();
        drop(sensor);

        let mut out = Vec::new();
        let written = drain(rx, &mut out).await.unwrap();
        let events: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(written, 4);
        let types: Vec<&str> = events
            .iter()
            .map(|event| event["event_type"].as_str().unwrap())
            .collect();
        assert_eq!(
            types,
            vec![
                EventType::ProcessStart.to_string(),
                EventType::ProcessStartExec.to_string(),
                EventType::ProcessLastExit.to_string(),
                EventType::ProcessLastExit.to_string(),
            ]
        );
        assert_eq!(events[3]["proc_info"]["path"], "/usr/bin/id");
    }
}
