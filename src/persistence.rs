//! Optional persistence collaborator.
//!
//! Simulation loops hand every event to a [`SinkHandle`], which queues it on
//! a bounded channel without waiting. A background task drains the channel
//! into a [`TelemetrySink`]. A full queue or a failing sink is logged and
//! never stops a simulation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::SimEvent;

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn persist(&self, event: &SimEvent) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON document per line.
pub struct JsonLinesSink {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonLinesSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        info!(path = %path.display(), "persisting events as JSON lines");
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
        })
    }
}

#[async_trait]
impl TelemetrySink for JsonLinesSink {
    async fn persist(&self, event: &SimEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.file.lock().await.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.file.lock().await.flush().await?;
        Ok(())
    }
}

/// Keeps events in memory; handy for tests and demos.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<SimEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn persist(&self, event: &SimEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Producer side of the sink queue.
#[derive(Clone, Debug)]
pub struct SinkHandle {
    tx: mpsc::Sender<SimEvent>,
}

impl SinkHandle {
    /// Spawn the forwarder task. It runs until every handle is dropped.
    pub fn spawn<S>(sink: std::sync::Arc<S>, capacity: usize) -> (Self, JoinHandle<()>)
    where
        S: TelemetrySink + ?Sized + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<SimEvent>(capacity.max(1));
        let task = tokio::spawn(async move {
            let mut failures: u64 = 0;
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.persist(&event).await {
                    failures += 1;
                    warn!(error = %e, battery_id = %event.battery_id(), failures, "sink rejected event");
                }
            }
            if let Err(e) = sink.flush().await {
                warn!(error = %e, "sink flush failed");
            }
        });
        (Self { tx }, task)
    }

    /// Queue without waiting; a full queue drops the event.
    pub fn offer(&self, event: &SimEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                warn!(battery_id = %ev.battery_id(), "sink queue full, event not persisted");
            }
            Err(mpsc::error::TrySendError::Closed(ev)) => {
                warn!(battery_id = %ev.battery_id(), "sink closed, event not persisted");
            }
        }
    }
}
