//! FIFO retry queue with a single active job

use crate::error::{PipelineStage, ProcessingError, Result};
use crate::events::RetryEvent;
use crate::models::{
    FailOptions, ImageId, ProcessingSettings, RetryJob, RetryJobId, RetryJobStatus, RetryOutcome,
    RetryRequest,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Reprocesses one image; never fails, the outcome carries the error
#[async_trait]
pub trait RetryJobProcessor: Send + Sync {
    async fn process_image(&self, request: &RetryRequest) -> RetryOutcome;
}

/// A batch of images to retry with shared options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRetryRequest {
    pub image_ids: Vec<ImageId>,
    pub use_original_settings: bool,
    #[serde(default)]
    pub modified_settings: Option<ProcessingSettings>,
    #[serde(default)]
    pub include_metadata: bool,
    #[serde(default)]
    pub fail_options: FailOptions,
}

impl BatchRetryRequest {
    /// Retry with each image's original settings
    pub fn original(image_ids: Vec<ImageId>) -> Self {
        Self {
            image_ids,
            use_original_settings: true,
            modified_settings: None,
            include_metadata: false,
            fail_options: FailOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRetryResponse {
    pub success: bool,
    pub job_id: RetryJobId,
    pub queued_jobs: usize,
    pub queue_length: usize,
}

/// Snapshot of the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub is_processing: bool,
    pub queue_length: usize,
    pub current_job: Option<RetryJob>,
    pub pending_jobs: Vec<RetryJob>,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<RetryJob>,
    current: Option<RetryJob>,
    finished: Vec<RetryJob>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    is_processing: AtomicBool,
    processor: RwLock<Arc<dyn RetryJobProcessor>>,
    events: broadcast::Sender<RetryEvent>,
    progress_delay: Duration,
    idle: Notify,
}

/// Retry queue handle; clones share the same queue
#[derive(Clone)]
pub struct RetryQueue {
    inner: Arc<QueueInner>,
}

impl RetryQueue {
    pub fn new(processor: Arc<dyn RetryJobProcessor>, progress_delay: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                is_processing: AtomicBool::new(false),
                processor: RwLock::new(processor),
                events,
                progress_delay,
                idle: Notify::new(),
            }),
        }
    }

    /// Subscribe to queue events
    pub fn subscribe(&self) -> broadcast::Receiver<RetryEvent> {
        self.inner.events.subscribe()
    }

    /// Sender for publishing on this queue's event stream
    pub fn event_sender(&self) -> broadcast::Sender<RetryEvent> {
        self.inner.events.clone()
    }

    /// Replace the processor used for jobs dequeued from now on
    pub async fn set_processor(&self, processor: Arc<dyn RetryJobProcessor>) {
        *self.inner.processor.write().await = processor;
        debug!("Retry processor replaced");
    }

    /// Enqueue one retry job per image id, in order, and start processing
    pub async fn add_batch_retry_job(&self, request: BatchRetryRequest) -> Result<BatchRetryResponse> {
        if request.image_ids.is_empty() {
            return Err(ProcessingError::InvalidInput {
                message: "No image ids supplied for retry".to_string(),
            });
        }

        let batch_id = Uuid::new_v4();
        let queued_jobs = request.image_ids.len();
        let queue_length = {
            let mut state = self.inner.state.lock().await;
            for image_id in &request.image_ids {
                state.pending.push_back(RetryJob::new(
                    batch_id,
                    RetryRequest {
                        image_id: *image_id,
                        use_original_settings: request.use_original_settings,
                        modified_settings: request.modified_settings.clone(),
                        include_metadata: request.include_metadata,
                        fail_options: request.fail_options.clone(),
                    },
                ));
            }
            state.pending.len()
        };

        self.inner.emit(RetryEvent::QueueUpdated {
            batch_id: Some(batch_id),
            queue_length,
        });
        info!(
            "Queued retry batch {} with {} image(s), queue length {}",
            batch_id, queued_jobs, queue_length
        );

        self.start_processing();

        Ok(BatchRetryResponse {
            success: true,
            job_id: batch_id,
            queued_jobs,
            queue_length,
        })
    }

    /// Start draining the queue; a no-op while a drain is already running
    pub fn start_processing(&self) {
        if self
            .inner
            .is_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Retry queue already processing");
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                inner.drain().await;
                inner.is_processing.store(false, Ordering::SeqCst);

                // a batch may have arrived between the last dequeue and the reset
                let has_more = !inner.state.lock().await.pending.is_empty();
                if !has_more
                    || inner
                        .is_processing
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                {
                    break;
                }
            }
            inner.idle.notify_waiters();
        });
    }

    pub async fn get_queue_status(&self) -> QueueStatus {
        let state = self.inner.state.lock().await;
        let count = |status: RetryJobStatus| state.finished.iter().filter(|j| j.status == status).count();

        QueueStatus {
            is_processing: self.inner.is_processing.load(Ordering::SeqCst),
            queue_length: state.pending.len(),
            current_job: state.current.clone(),
            pending_jobs: state.pending.iter().cloned().collect(),
            completed_jobs: count(RetryJobStatus::Completed),
            failed_jobs: count(RetryJobStatus::Failed),
        }
    }

    /// Forget finished jobs, returning how many were dropped
    pub async fn clear_completed_jobs(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let cleared = state.finished.len();
        state.finished.clear();
        debug!("Cleared {} finished retry job(s)", cleared);
        cleared
    }

    /// Discard every pending job. The job currently being processed runs to
    /// completion.
    pub async fn stop_processing(&self) -> usize {
        let discarded = {
            let mut state = self.inner.state.lock().await;
            let discarded = state.pending.len();
            state.pending.clear();
            discarded
        };

        info!("Retry queue stopped, {} pending job(s) discarded", discarded);
        self.inner.emit(RetryEvent::Stopped { discarded });
        self.inner.emit(RetryEvent::QueueUpdated {
            batch_id: None,
            queue_length: 0,
        });
        discarded
    }

    /// Resolve once nothing is pending or processing
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle().await {
                return;
            }
            notified.await;
        }
    }

    async fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().await;
        !self.inner.is_processing.load(Ordering::SeqCst)
            && state.pending.is_empty()
            && state.current.is_none()
    }
}

impl QueueInner {
    fn emit(&self, event: RetryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn drain(&self) {
        loop {
            let job = {
                let mut state = self.state.lock().await;
                let Some(mut job) = state.pending.pop_front() else {
                    break;
                };
                job.status = RetryJobStatus::Processing;
                job.started_at = Some(Utc::now());
                state.current = Some(job.clone());
                job
            };

            self.emit(RetryEvent::JobStatusUpdated {
                job_id: job.id,
                image_id: job.image_id(),
                status: RetryJobStatus::Processing,
            });

            let outcome = self.run_job(&job).await;
            self.finish_job(job, outcome).await;

            if !self.progress_delay.is_zero() {
                tokio::time::sleep(self.progress_delay).await;
            }
        }
    }

    async fn run_job(&self, job: &RetryJob) -> RetryOutcome {
        let processor = Arc::clone(&*self.processor.read().await);
        debug!("Processing retry job {} for image {}", job.id, job.image_id());

        AssertUnwindSafe(processor.process_image(&job.request))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!("Retry processor panicked on image {}", job.image_id());
                RetryOutcome::failed(
                    "Retry processor panicked",
                    Some(PipelineStage::Qc.qc_reason()),
                )
            })
    }

    async fn finish_job(&self, mut job: RetryJob, outcome: RetryOutcome) {
        job.completed_at = Some(Utc::now());
        if outcome.success {
            job.status = RetryJobStatus::Completed;
        } else {
            job.status = RetryJobStatus::Failed;
            job.error = outcome.error.clone();
        }

        let (processed, remaining) = {
            let mut state = self.state.lock().await;
            state.current = None;
            state.finished.push(job.clone());
            (state.finished.len(), state.pending.len())
        };

        self.emit(RetryEvent::JobStatusUpdated {
            job_id: job.id,
            image_id: job.image_id(),
            status: job.status,
        });

        if outcome.success {
            info!("Retry job {} completed for image {}", job.id, job.image_id());
            self.emit(RetryEvent::JobCompleted {
                job_id: job.id,
                image_id: job.image_id(),
                outcome,
            });
        } else {
            warn!(
                "Retry job {} failed for image {}: {}",
                job.id,
                job.image_id(),
                job.error.as_deref().unwrap_or("unknown error")
            );
            self.emit(RetryEvent::JobError {
                job_id: job.id,
                image_id: job.image_id(),
                error: job.error.clone().unwrap_or_default(),
            });
        }

        self.emit(RetryEvent::Progress {
            processed,
            remaining,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockRetryProcessor;

    fn ids(n: usize) -> Vec<ImageId> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    struct PanickingProcessor;

    #[async_trait]
    impl RetryJobProcessor for PanickingProcessor {
        async fn process_image(&self, _request: &RetryRequest) -> RetryOutcome {
            panic!("processor bug");
        }
    }

    #[tokio::test]
    async fn test_batch_is_processed_in_submission_order() {
        let processor = Arc::new(MockRetryProcessor::new());
        let queue = RetryQueue::new(processor.clone(), Duration::ZERO);
        let image_ids = ids(3);

        let response = queue
            .add_batch_retry_job(BatchRetryRequest::original(image_ids.clone()))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.queued_jobs, 3);

        queue.wait_until_idle().await;
        assert_eq!(processor.processed(), image_ids);

        let status = queue.get_queue_status().await;
        assert!(!status.is_processing);
        assert_eq!(status.completed_jobs, 3);
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let queue = RetryQueue::new(Arc::new(MockRetryProcessor::new()), Duration::ZERO);
        let result = queue.add_batch_retry_job(BatchRetryRequest::original(vec![])).await;
        assert!(matches!(result, Err(ProcessingError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_repeated_start_does_not_duplicate_work() {
        let processor = Arc::new(MockRetryProcessor::new().with_delay(Duration::from_millis(10)));
        let queue = RetryQueue::new(processor.clone(), Duration::ZERO);
        let image_ids = ids(3);

        queue
            .add_batch_retry_job(BatchRetryRequest::original(image_ids.clone()))
            .await
            .unwrap();
        queue.start_processing();
        queue.start_processing();

        queue.wait_until_idle().await;
        assert_eq!(processor.processed(), image_ids);
    }

    #[tokio::test]
    async fn test_events_and_failures() {
        let image_ids = ids(2);
        let processor = Arc::new(MockRetryProcessor::new().failing_for(image_ids[1]));
        let queue = RetryQueue::new(processor, Duration::ZERO);
        let mut events = queue.subscribe();

        queue
            .add_batch_retry_job(BatchRetryRequest::original(image_ids.clone()))
            .await
            .unwrap();
        queue.wait_until_idle().await;

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }

        assert!(matches!(received[0], RetryEvent::QueueUpdated { queue_length: 2, .. }));
        let completed = received
            .iter()
            .filter(|e| matches!(e, RetryEvent::JobCompleted { .. }))
            .count();
        let errors: Vec<_> = received
            .iter()
            .filter_map(|e| match e {
                RetryEvent::JobError { image_id, .. } => Some(*image_id),
                _ => None,
            })
            .collect();
        assert_eq!(completed, 1);
        assert_eq!(errors, vec![image_ids[1]]);
        assert!(matches!(
            received.last(),
            Some(RetryEvent::Progress {
                processed: 2,
                remaining: 0
            })
        ));

        let status = queue.get_queue_status().await;
        assert_eq!(status.failed_jobs, 1);
        assert_eq!(queue.clear_completed_jobs().await, 2);
        assert_eq!(queue.get_queue_status().await.completed_jobs, 0);
    }

    #[tokio::test]
    async fn test_stop_discards_pending_but_finishes_current() {
        let processor = Arc::new(MockRetryProcessor::new().with_delay(Duration::from_millis(50)));
        let queue = RetryQueue::new(processor.clone(), Duration::ZERO);
        let mut events = queue.subscribe();
        let image_ids = ids(4);

        queue
            .add_batch_retry_job(BatchRetryRequest::original(image_ids.clone()))
            .await
            .unwrap();

        // let the first job get picked up
        tokio::time::sleep(Duration::from_millis(10)).await;
        let discarded = queue.stop_processing().await;
        queue.wait_until_idle().await;

        assert_eq!(discarded, 3);
        assert_eq!(processor.processed(), vec![image_ids[0]]);

        let mut saw_stopped = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RetryEvent::Stopped { discarded: 3 }) {
                saw_stopped = true;
            }
        }
        assert!(saw_stopped);
    }

    #[tokio::test]
    async fn test_processor_can_be_swapped() {
        let first = Arc::new(MockRetryProcessor::new());
        let second = Arc::new(MockRetryProcessor::new());
        let queue = RetryQueue::new(first.clone(), Duration::ZERO);

        queue
            .add_batch_retry_job(BatchRetryRequest::original(ids(1)))
            .await
            .unwrap();
        queue.wait_until_idle().await;

        queue.set_processor(second.clone()).await;
        queue
            .add_batch_retry_job(BatchRetryRequest::original(ids(2)))
            .await
            .unwrap();
        queue.wait_until_idle().await;

        assert_eq!(first.processed().len(), 1);
        assert_eq!(second.processed().len(), 2);
    }

    #[tokio::test]
    async fn test_panicking_processor_fails_the_job() {
        let queue = RetryQueue::new(Arc::new(PanickingProcessor), Duration::ZERO);
        queue
            .add_batch_retry_job(BatchRetryRequest::original(ids(2)))
            .await
            .unwrap();
        queue.wait_until_idle().await;

        let status = queue.get_queue_status().await;
        assert_eq!(status.failed_jobs, 2);
        assert!(!status.is_processing);
    }
}
