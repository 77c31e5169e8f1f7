//! Progress updates: the only liveness channel a run exposes.
//!
//! One producer per run, any number of subscribers. Updates sent while nobody
//! listens are dropped, and slow subscribers see `Lagged` instead of blocking
//! the run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovery,
    Authentication,
    AuthenticatedDiscovery,
    Generation,
    Execution,
    Analysis,
    Report,
    Rbac,
    Completed,
    Error,
}

impl Phase {
    /// Overall progress window `[start, end]` of the phase.
    pub fn window(&self) -> (f64, f64) {
        match self {
            Phase::Discovery => (0.0, 20.0),
            Phase::Authentication => (20.0, 30.0),
            Phase::AuthenticatedDiscovery => (30.0, 40.0),
            Phase::Generation => (40.0, 50.0),
            Phase::Execution => (50.0, 85.0),
            Phase::Analysis => (85.0, 95.0),
            Phase::Report | Phase::Rbac => (95.0, 100.0),
            Phase::Completed => (100.0, 100.0),
            Phase::Error => (100.0, 100.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub phase: Phase,
    /// 0 to 100
    pub progress: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Sending half of the progress channel.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: broadcast::Sender<ProgressUpdate>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.tx.subscribe()
    }

    /// Report `fraction` (0..=1) of the way through `phase`.
    pub fn report(&self, phase: Phase, fraction: f64, message: impl Into<String>) {
        self.send(phase, fraction, message.into(), None);
    }

    pub fn report_with(&self, phase: Phase, fraction: f64, message: impl Into<String>, details: Value) {
        self.send(phase, fraction, message.into(), Some(details));
    }

    fn send(&self, phase: Phase, fraction: f64, message: String, details: Option<Value>) {
        let (start, end) = phase.window();
        let progress = start + (end - start) * fraction.clamp(0.0, 1.0);
        tracing::debug!("[{:?} {:.0}%] {}", phase, progress, message);
        // No subscribers is fine
        let _ = self.tx.send(ProgressUpdate {
            phase,
            progress,
            message,
            details,
        });
    }

    /// Reporter bound to one phase.
    pub fn phase(&self, phase: Phase) -> PhaseProgress {
        PhaseProgress {
            reporter: self.clone(),
            phase,
        }
    }
}

/// Progress within a single phase.
#[derive(Clone)]
pub struct PhaseProgress {
    reporter: ProgressReporter,
    phase: Phase,
}

impl PhaseProgress {
    pub fn report(&self, fraction: f64, message: impl Into<String>) {
        self.reporter.report(self.phase, fraction, message);
    }

    pub fn report_details(&self, fraction: f64, message: impl Into<String>, details: Value) {
        self.reporter.report_with(self.phase, fraction, message, details);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_mapped_into_phase_window() {
        let reporter = ProgressReporter::new();
        let mut rx = reporter.subscribe();
        reporter.report(Phase::Execution, 0.5, "half way");
        reporter.phase(Phase::Analysis).report(2.0, "over");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.phase, Phase::Execution);
        assert!((first.progress - 67.5).abs() < 1e-9);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.progress, 95.0);
    }

    #[test]
    fn test_send_without_subscribers() {
        ProgressReporter::new().report(Phase::Discovery, 0.0, "nobody listens");
    }

    #[test]
    fn test_update_wire_format() {
        let update = ProgressUpdate {
            phase: Phase::AuthenticatedDiscovery,
            progress: 30.0,
            message: "m".into(),
            details: None,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["phase"], "authenticated_discovery");
        assert!(json.get("details").is_none());
    }
}
