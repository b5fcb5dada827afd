//! Pipeline events for observers.
//!
//! Pipelines never touch presentation state directly. They queue events on
//! an unbounded channel that a single consumer drains, so observers see a
//! consistent per-tool order: Pending, Downloading, Extracting, Normalizing,
//! Registering, Completed (or an early Failed/Cancelled).

use tokio::sync::mpsc;

use super::types::Stage;

// =============================================================================
// Events
// =============================================================================

/// Events sent from the orchestrator to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum InstallEvent {
    /// A tool's job entered a new stage.
    Status { tool: String, stage: Stage },

    /// Stage-local progress changed.
    Progress {
        tool: String,
        stage: Stage,
        /// Stage-local fraction, 0.0 to 1.0.
        fraction: f64,
        /// Overall job progress, 0 to 100.
        overall: f64,
    },

    /// A tool's job failed. Sent once, right after the Failed status.
    Failed {
        tool: String,
        stage: Stage,
        message: String,
    },

    /// Every job of the run reached a terminal stage.
    AllDone(RunSummary),
}

impl InstallEvent {
    /// The tool this event is about, if any.
    pub fn tool(&self) -> Option<&str> {
        match self {
            Self::Status { tool, .. } | Self::Progress { tool, .. } | Self::Failed { tool, .. } => {
                Some(tool)
            }
            Self::AllDone(_) => None,
        }
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    /// True when every job completed.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

// =============================================================================
// Channel Types
// =============================================================================

/// Sender for install events.
pub type EventSender = mpsc::UnboundedSender<InstallEvent>;

/// Receiver for install events.
pub type EventReceiver = mpsc::UnboundedReceiver<InstallEvent>;

/// Create an event channel for install events.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tool_accessor() {
        let event = InstallEvent::Status {
            tool: "CMake".to_string(),
            stage: Stage::Downloading,
        };
        assert_eq!(event.tool(), Some("CMake"));
        assert_eq!(InstallEvent::AllDone(RunSummary::default()).tool(), None);
    }

    #[test]
    fn test_run_summary() {
        let summary = RunSummary {
            completed: 3,
            failed: 1,
            cancelled: 1,
        };
        assert_eq!(summary.total(), 5);
        assert!(!summary.is_success());
        assert!(RunSummary {
            completed: 2,
            ..Default::default()
        }
        .is_success());
    }

    #[tokio::test]
    async fn test_event_channel_preserves_order() {
        let (tx, mut rx) = event_channel();
        for stage in [Stage::Pending, Stage::Downloading, Stage::Extracting] {
            tx.send(InstallEvent::Status {
                tool: "Ninja".to_string(),
                stage,
            })
            .unwrap();
        }
        drop(tx);

        let mut stages = Vec::new();
        while let Some(InstallEvent::Status { stage, .. }) = rx.recv().await {
            stages.push(stage);
        }
        assert_eq!(
            stages,
            vec![Stage::Pending, Stage::Downloading, Stage::Extracting]
        );
    }
}
