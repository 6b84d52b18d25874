//! Offline frame source: one JSON frame per line
//!
//! Used to run recorded detector output through the engine. Frames are sent
//! with back-pressure (`send().await`), so nothing is dropped; lines that do
//! not parse are skipped with a warning.

use crate::domain::detection::DetectionFrame;
use crate::io::mqtt::parse_frame_message;
use anyhow::Context;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Counts from one replay run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub frames: u64,
    pub skipped: u64,
}

/// Stream every frame of a JSONL file into `frame_tx`, in file order
pub async fn replay_file<P: AsRef<Path>>(
    path: P,
    frame_tx: mpsc::Sender<DetectionFrame>,
) -> anyhow::Result<ReplayStats> {
    let path = path.as_ref();
    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open replay file {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut stats = ReplayStats::default();
    let mut line_no = 0u64;
    // Frames without a timestamp keep the previous one
    let mut last_ts = 0u64;

    info!(file = %path.display(), "replay_started");

    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("Failed to read replay file {}", path.display()))?
    {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match parse_frame_message(&line, last_ts) {
            Ok(frame) => {
                last_ts = frame.timestamp_ms;
                if frame_tx.send(frame).await.is_err() {
                    warn!(line = %line_no, "replay_stopped: frame channel closed");
                    break;
                }
                stats.frames += 1;
            }
            Err(e) => {
                stats.skipped += 1;
                warn!(line = %line_no, error = %e, "replay_line_skipped");
            }
        }
    }

    info!(frames = %stats.frames, skipped = %stats.skipped, "replay_finished");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_replay_in_order_and_skips_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"timestamp": 1000, "detections": []}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"detections": [{{"track_id": 1}}]}}"#).unwrap();
        writeln!(file, r#"{{"timestamp": 1200, "detections": [], "dropped_tracks": [1]}}"#).unwrap();
        file.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let stats = replay_file(file.path(), tx).await.unwrap();
        assert_eq!(stats, ReplayStats { frames: 3, skipped: 1 });

        let timestamps: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok()).map(|f| f.timestamp_ms).collect();
        assert_eq!(timestamps, vec![1000, 1000, 1200]);
    }

    #[tokio::test]
    async fn test_replay_missing_file() {
        let (tx, _rx) = mpsc::channel(1);
        let err = replay_file("/nonexistent/frames.jsonl", tx).await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/frames.jsonl"));
    }
}
