//! Fire-and-forget per-tick pose log
//!
//! Simulation tasks call [`PositionLog::enqueue`], which never blocks: when
//! the bounded queue is full the record is dropped and counted. A single
//! writer task drains the queue in batches.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{info, trace, warn};

/// Records handed to the writer per batch
const BATCH_SIZE: usize = 256;

/// Log a warning once per this many dropped records
const DROP_REPORT_EVERY: u64 = 1000;

/// Pose of one car at one tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub angle: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRecord {
    pub player: String,
    pub tick: u64,
    #[serde(flatten)]
    pub pose: Pose,
    pub recorded_at: DateTime<Utc>,
}

/// Cloneable producer handle
#[derive(Clone)]
pub struct PositionLog {
    tx: Option<mpsc::Sender<PositionRecord>>,
    dropped: Arc<AtomicU64>,
}

impl PositionLog {
    /// Enabled log with a bounded queue; the receiver goes to [`run_writer`]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PositionRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let log = Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (log, rx)
    }

    /// Log that accepts and discards everything
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn enqueue(&self, player: &str, tick: u64, pose: Pose) {
        let Some(tx) = &self.tx else {
            return;
        };

        let record = PositionRecord {
            player: player.to_string(),
            tick,
            pose,
            recorded_at: Utc::now(),
        };

        if tx.try_send(record).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % DROP_REPORT_EVERY == 1 {
                warn!(dropped, "Position log saturated, dropping records");
            }
        }
    }

    /// Records waiting for the writer
    pub fn pending(&self) -> usize {
        self.tx
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Destination for drained batches
pub enum PositionWriter {
    /// Append JSON lines to a file
    File(File),
    /// Emit each record as a trace event
    Trace,
}

impl PositionWriter {
    /// File writer when a path is configured, trace events otherwise
    pub async fn open(path: Option<PathBuf>) -> std::io::Result<Self> {
        match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?;
                info!(path = %path.display(), "Position log writing to file");
                Ok(Self::File(file))
            }
            None => Ok(Self::Trace),
        }
    }

    pub async fn write_batch(&mut self, batch: &[PositionRecord]) -> std::io::Result<()> {
        match self {
            Self::File(file) => {
                let mut buf = Vec::with_capacity(batch.len() * 96);
                for record in batch {
                    serde_json::to_writer(&mut buf, record)?;
                    buf.push(b'\n');
                }
                file.write_all(&buf).await?;
                file.flush().await
            }
            Self::Trace => {
                for record in batch {
                    trace!(
                        player = %record.player,
                        tick = record.tick,
                        x = record.pose.x,
                        y = record.pose.y,
                        z = record.pose.z,
                        angle = record.pose.angle,
                        "position"
                    );
                }
                Ok(())
            }
        }
    }
}

/// Drain the queue until shutdown, then flush whatever is left
pub async fn run_writer(
    mut rx: mpsc::Receiver<PositionRecord>,
    mut writer: PositionWriter,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batch = Vec::with_capacity(BATCH_SIZE);

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(record) => batch.push(record),
                    None => break,
                }
            }
            _ = shutdown.changed() => break,
        }

        while batch.len() < BATCH_SIZE {
            match rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }

        if let Err(e) = writer.write_batch(&batch).await {
            warn!(error = %e, lost = batch.len(), "Position log write failed");
        }
        batch.clear();
    }

    while let Ok(record) = rx.try_recv() {
        batch.push(record);
    }
    if !batch.is_empty() {
        if let Err(e) = writer.write_batch(&batch).await {
            warn!(error = %e, lost = batch.len(), "Position log final flush failed");
        }
    }
    info!("Position log writer stopped");
}
