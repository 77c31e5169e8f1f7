//! Export of results to an external store.
//!
//! The core hands events to a [`SinkHandle`], which forwards them over an
//! unbounded channel to a background task. Emitting never waits on the sink.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::analysis::AnalysisResult;
use crate::execution::TestResult;
use crate::healing::HealingEvent;

/// Plain data the core exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum CoreEvent {
    TestCompleted(TestResult),
    Healing(HealingEvent),
    Analysis(AnalysisResult),
}

/// Persistence or metrics collaborator.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn export(&self, event: CoreEvent) -> anyhow::Result<()>;
}

/// Non-blocking front of a [`ResultSink`].
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl SinkHandle {
    /// Start the forwarding task. It ends once every handle is dropped.
    pub fn spawn(sink: Arc<dyn ResultSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<CoreEvent>();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.export(event).await {
                    tracing::warn!("Result sink export failed: {}", e);
                }
            }
        });
        (Self { tx }, task)
    }

    pub fn emit(&self, event: CoreEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Result sink is gone, dropping event");
        }
    }
}

/// Appends events as JSON lines to a file.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ResultSink for JsonlSink {
    async fn export(&self, event: CoreEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Default)]
pub struct MemorySink {
    events: parking_lot::Mutex<Vec<CoreEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn export(&self, event: CoreEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
