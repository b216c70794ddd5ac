//! Reprocesses one stored image for the retry queue

use crate::config_resolver::ConfigResolver;
use crate::error::PipelineStage;
use crate::events::RetryEvent;
use crate::models::{GeneratedImage, ImageId, QcStatus, RetryOutcome, RetryRequest};
use crate::post_processing::{PostProcessRequest, PostProcessingRunner};
use crate::queue::RetryJobProcessor;
use crate::repository::Repository;
use crate::utils;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

pub const RETRY_SUCCESS_REASON: &str = "Retry processing successful";

/// Default [`RetryJobProcessor`]: resolves source, configuration and
/// settings for an image, then runs it through the post-processing pipeline
pub struct RetryProcessor {
    repository: Arc<dyn Repository>,
    resolver: ConfigResolver,
    runner: Arc<PostProcessingRunner>,
    events: Option<broadcast::Sender<RetryEvent>>,
}

impl RetryProcessor {
    pub fn new(
        repository: Arc<dyn Repository>,
        resolver: ConfigResolver,
        runner: Arc<PostProcessingRunner>,
    ) -> Self {
        Self {
            repository,
            resolver,
            runner,
            events: None,
        }
    }

    /// Publish image status changes on `events`
    pub fn with_events(mut self, events: broadcast::Sender<RetryEvent>) -> Self {
        self.events = Some(events);
        self
    }

    async fn set_status(&self, image_id: ImageId, status: QcStatus, reason: Option<&str>) {
        if let Err(e) = self.repository.update_image_status(image_id, status, reason).await {
            warn!("Failed to set image {} to {}: {}", image_id, status, e);
        }

        if let Some(events) = &self.events {
            let _ = events.send(RetryEvent::ImageStatusUpdated {
                image_id,
                status,
                reason: reason.map(str::to_string),
            });
        }
    }

    /// First readable file among the temp and final paths
    async fn source_path(image: &GeneratedImage) -> Option<PathBuf> {
        for candidate in [&image.temp_image_path, &image.final_image_path] {
            if let Some(path) = utils::paths::non_empty(candidate.as_ref()) {
                if utils::file::is_file_accessible(path).await {
                    return Some(path.clone());
                }
            }
        }
        None
    }
}

#[async_trait]
impl RetryJobProcessor for RetryProcessor {
    #[instrument(skip(self, request), fields(image_id = %request.image_id))]
    async fn process_image(&self, request: &RetryRequest) -> RetryOutcome {
        let image = match self.repository.get_image(request.image_id).await {
            Ok(Some(image)) => image,
            Ok(None) => return RetryOutcome::failed(format!("Image {} not found", request.image_id), None),
            Err(e) => return RetryOutcome::failed(e.to_string(), None),
        };

        let Some(source_path) = Self::source_path(&image).await else {
            warn!("Image {} has no accessible file to reprocess", image.id);
            return RetryOutcome::failed(
                format!("No accessible source file for image {}", image.id),
                None,
            );
        };

        let job_configuration = self.resolver.get_original_job_configuration(&image).await;
        let settings = match (&request.modified_settings, request.use_original_settings) {
            (Some(modified), false) => modified.clone(),
            _ => self.resolver.get_original_processing_settings(&image),
        };

        self.set_status(image.id, QcStatus::Processing, None).await;

        let image_id = image.id;
        let outcome = self
            .runner
            .run(PostProcessRequest {
                image,
                source_path,
                settings,
                include_metadata: request.include_metadata,
                job_configuration,
                use_original_settings: request.use_original_settings,
                fail_options: request.fail_options.clone(),
            })
            .await;

        if outcome.success {
            self.set_status(image_id, QcStatus::Approved, Some(RETRY_SUCCESS_REASON)).await;
            info!("Retry of image {} succeeded", image_id);
            RetryOutcome::succeeded(RETRY_SUCCESS_REASON, outcome.processed_image_path)
        } else {
            let reason = outcome
                .qc_reason
                .unwrap_or_else(|| PipelineStage::Qc.qc_reason());
            self.set_status(image_id, QcStatus::RetryFailed, Some(&reason)).await;
            RetryOutcome::failed(
                outcome.error.unwrap_or_else(|| "Retry processing failed".to_string()),
                Some(reason),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathDefaults;
    use crate::mocks::{write_test_png, MockTransformer};
    use crate::models::{FailOptions, ProcessingSettings};
    use crate::repository::MemoryRepository;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Fixture {
        dir: TempDir,
        repository: Arc<MemoryRepository>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                repository: Arc::new(MemoryRepository::new()),
            }
        }

        fn defaults(&self) -> PathDefaults {
            PathDefaults::under(self.dir.path())
        }

        fn processor(&self, transformer: MockTransformer) -> RetryProcessor {
            let resolver = ConfigResolver::new(self.repository.clone(), self.defaults(), Duration::from_millis(1));
            let runner = PostProcessingRunner::new(self.repository.clone(), Arc::new(transformer), self.defaults());
            RetryProcessor::new(self.repository.clone(), resolver, Arc::new(runner))
        }

        async fn image_in_temp(&self, settings: Option<&str>) -> GeneratedImage {
            let path = self.defaults().temp_directory.join(format!("{}.png", Uuid::new_v4()));
            write_test_png(&path).await.unwrap();
            let mut image = GeneratedImage::new(Uuid::new_v4(), "a fox");
            image.qc_status = QcStatus::QcFailed;
            image.temp_image_path = Some(path);
            image.processing_settings = settings.map(str::to_string);
            self.repository.insert_image(&image).await.unwrap();
            image
        }
    }

    fn request(image_id: ImageId) -> RetryRequest {
        RetryRequest {
            image_id,
            use_original_settings: true,
            modified_settings: None,
            include_metadata: false,
            fail_options: FailOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_unknown_image_fails() {
        let fixture = Fixture::new();
        let outcome = fixture
            .processor(MockTransformer::new())
            .process_image(&request(Uuid::new_v4()))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_missing_files_fail_without_touching_status() {
        let fixture = Fixture::new();
        let mut image = GeneratedImage::new(Uuid::new_v4(), "a fox");
        image.qc_status = QcStatus::QcFailed;
        image.temp_image_path = Some(fixture.dir.path().join("gone.png"));
        fixture.repository.insert_image(&image).await.unwrap();

        let outcome = fixture.processor(MockTransformer::new()).process_image(&request(image.id)).await;

        assert!(!outcome.success);
        let stored = fixture.repository.get_image(image.id).await.unwrap().unwrap();
        assert_eq!(stored.qc_status, QcStatus::QcFailed);
    }

    #[tokio::test]
    async fn test_success_marks_image_approved() {
        let fixture = Fixture::new();
        let image = fixture.image_in_temp(None).await;
        let (events, mut receiver) = broadcast::channel(16);
        let processor = fixture.processor(MockTransformer::new()).with_events(events);

        let outcome = processor.process_image(&request(image.id)).await;

        assert!(outcome.success);
        assert_eq!(outcome.message.as_deref(), Some(RETRY_SUCCESS_REASON));
        let stored = fixture.repository.get_image(image.id).await.unwrap().unwrap();
        assert_eq!(stored.qc_status, QcStatus::Approved);
        assert_eq!(stored.qc_reason.as_deref(), Some(RETRY_SUCCESS_REASON));
        assert_eq!(stored.final_image_path, outcome.processed_image_path);

        let mut statuses = Vec::new();
        while let Ok(RetryEvent::ImageStatusUpdated { status, .. }) = receiver.try_recv() {
            statuses.push(status);
        }
        assert_eq!(statuses, vec![QcStatus::Processing, QcStatus::Approved]);
    }

    #[tokio::test]
    async fn test_original_settings_drive_stage_failure_reason() {
        let fixture = Fixture::new();
        let image = fixture
            .image_in_temp(Some(r#"{"trimTransparentBackground":true}"#))
            .await;
        let processor = fixture.processor(MockTransformer::new().failing_on(PipelineStage::Trim));

        let mut hard = request(image.id);
        hard.fail_options = FailOptions::hard_fail_on([PipelineStage::Trim]);
        let outcome = processor.process_image(&hard).await;

        assert!(!outcome.success);
        assert_eq!(outcome.qc_reason.as_deref(), Some("processing_failed:trim"));
        let stored = fixture.repository.get_image(image.id).await.unwrap().unwrap();
        assert_eq!(stored.qc_status, QcStatus::RetryFailed);
        assert_eq!(stored.qc_reason.as_deref(), Some("processing_failed:trim"));
    }

    #[tokio::test]
    async fn test_modified_settings_replace_originals() {
        let fixture = Fixture::new();
        let image = fixture
            .image_in_temp(Some(r#"{"trimTransparentBackground":true}"#))
            .await;
        let processor = fixture.processor(MockTransformer::new().failing_on(PipelineStage::Trim));

        let mut modified = request(image.id);
        modified.use_original_settings = false;
        modified.modified_settings = Some(ProcessingSettings::default());
        modified.fail_options = FailOptions::hard_fail_on([PipelineStage::Trim]);

        assert!(processor.process_image(&modified).await.success);
    }

    #[tokio::test]
    async fn test_falls_back_to_final_path() {
        let fixture = Fixture::new();
        let final_path = fixture.defaults().output_directory.join("kept.png");
        write_test_png(&final_path).await.unwrap();
        let mut image = GeneratedImage::new(Uuid::new_v4(), "a fox");
        image.temp_image_path = Some(fixture.dir.path().join("missing.png"));
        image.final_image_path = Some(final_path.clone());
        fixture.repository.insert_image(&image).await.unwrap();

        let outcome = fixture.processor(MockTransformer::new()).process_image(&request(image.id)).await;

        assert!(outcome.success);
        assert_eq!(outcome.processed_image_path, Some(final_path.clone()));
        assert!(final_path.exists());
    }
}
