//! Lifecycle events published to the presentation layer

use crate::models::{
    ExecutionId, GeneratedImage, ImageId, QcStatus, RetryJobId, RetryJobStatus, RetryOutcome,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Phase a progress tick belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Initialization,
    ParameterGeneration,
    ImageGeneration,
    Finalization,
}

/// Events emitted by the engine while one execution runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobEvent {
    Progress {
        phase: JobPhase,
        /// Weighted overall completion, 0..=100
        percent: f32,
        generation: Option<u32>,
        message: String,
    },
    ImageGenerated {
        image: GeneratedImage,
    },
    Error {
        generation: Option<u32>,
        message: String,
    },
    JobComplete {
        status: crate::engine::JobOutcomeStatus,
        total_images: u32,
        successful_images: u32,
        failed_images: u32,
        message: Option<String>,
    },
}

impl JobEvent {
    /// `job-complete` is always the final event of an execution
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::JobComplete { .. })
    }
}

/// A job event tagged with the execution it belongs to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobUpdate {
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub event: JobEvent,
}

/// Ordered, per-execution event sink handed to the engine
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl EventSink {
    /// Sink and the receiver that observes it in emission order
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A sink that drops everything
    pub fn disconnected() -> Self {
        Self { sender: None }
    }

    pub fn emit(&self, event: JobEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                tracing::debug!("Job event receiver dropped");
            }
        }
    }
}

/// Events emitted by the retry queue and processor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RetryEvent {
    QueueUpdated {
        batch_id: Option<RetryJobId>,
        queue_length: usize,
    },
    JobStatusUpdated {
        job_id: RetryJobId,
        image_id: ImageId,
        status: RetryJobStatus,
    },
    JobCompleted {
        job_id: RetryJobId,
        image_id: ImageId,
        outcome: RetryOutcome,
    },
    JobError {
        job_id: RetryJobId,
        image_id: ImageId,
        error: String,
    },
    ImageStatusUpdated {
        image_id: ImageId,
        status: QcStatus,
        reason: Option<String>,
    },
    Progress {
        processed: usize,
        remaining: usize,
    },
    Stopped {
        discarded: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::JobOutcomeStatus;

    #[tokio::test]
    async fn test_event_sink_preserves_order() {
        let (sink, mut receiver) = EventSink::channel();
        sink.emit(JobEvent::Error {
            generation: Some(1),
            message: "first".to_string(),
        });
        sink.emit(JobEvent::JobComplete {
            status: JobOutcomeStatus::Completed,
            total_images: 0,
            successful_images: 0,
            failed_images: 0,
            message: None,
        });
        drop(sink);

        let first = receiver.recv().await.unwrap();
        assert!(!first.is_terminal());
        let second = receiver.recv().await.unwrap();
        assert!(second.is_terminal());
        assert!(receiver.recv().await.is_none());
    }

    #[test]
    fn test_disconnected_sink_ignores_events() {
        let sink = EventSink::disconnected();
        sink.emit(JobEvent::Error {
            generation: None,
            message: "ignored".to_string(),
        });
    }

    #[test]
    fn test_event_wire_names() {
        let event = RetryEvent::Stopped { discarded: 2 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stopped");

        let event = RetryEvent::QueueUpdated {
            batch_id: None,
            queue_length: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "queue-updated");
    }
}
