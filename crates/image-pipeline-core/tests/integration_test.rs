//! Integration tests for the image pipeline core

use image_pipeline_core::clients::MemorySecretStore;
use image_pipeline_core::mocks::{
    write_test_png, MockImageGenerator, MockParameterGenerator, MockQualityChecker, MockRetryProcessor,
    MockTransformer,
};
use image_pipeline_core::transform::RasterTransformer;
use image_pipeline_core::{
    init, version, BatchRetryRequest, ConfigManager, ConfigResolver, DatabaseConfig, ExecutionStatus,
    FailOptions, GeneratedImage, JobConfiguration, JobEngine, JobEvent, JobExecution, JobService,
    PathDefaults, PipelineStage, PostProcessRequest, PostProcessingRunner, ProcessingSettings, QcStatus,
    Repository, RerunCoordinator, RerunQueue, RetryEvent, RetryProcessor, RetryQueue,
    SavedConfiguration, SqliteRepository, StartOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

async fn sqlite(dir: &TempDir) -> Arc<SqliteRepository> {
    let url = format!("sqlite:{}", dir.path().join("pipeline.db").display());
    Arc::new(SqliteRepository::connect(DatabaseConfig::with_url(url)).await.unwrap())
}

fn job_config(count: u32, variations: u32) -> JobConfiguration {
    let mut config = JobConfiguration::default();
    config.parameters.count = count;
    config.parameters.variations = variations;
    config.parameters.generation_retry_attempts = 0;
    config
}

#[tokio::test]
async fn test_core_initialization() {
    let result = init().await;
    assert!(result.is_ok(), "Core initialization should succeed");
}

#[test]
fn test_version_info() {
    assert_eq!(version(), "0.1.0", "Version should match workspace version");
}

#[test]
fn test_config_manager_defaults() {
    let temp_dir = tempfile::tempdir().unwrap();
    let manager = ConfigManager::with_path(temp_dir.path().join("config.toml")).unwrap();
    let config = manager.config();

    assert_eq!(config.queue.progress_delay_ms, 100);
    assert_eq!(config.logging.level, "info");
    assert!(config.generation.command.is_none());

    manager.save().unwrap();
    assert!(manager.config_path().exists());
}

#[tokio::test]
async fn test_failed_parameter_generation_degrades_job() {
    let dir = TempDir::new().unwrap();
    let repository = sqlite(&dir).await;
    let engine = JobEngine::new(
        Arc::new(MockParameterGenerator::new().failing_at(2)),
        Arc::new(MockImageGenerator::new()),
    )
    .with_path_defaults(PathDefaults::under(dir.path()));
    let service = JobService::new(repository.clone(), engine);
    let mut updates = service.subscribe();

    let response = service.start_job(job_config(2, 1), StartOptions::default()).await.unwrap();

    assert!(response.success);
    assert_eq!(response.result.total_images, 2);
    assert_eq!(response.result.successful_images, 1);
    assert_eq!(response.result.failed_images, 1);

    let mut errors = Vec::new();
    let mut last = None;
    while let Ok(update) = updates.try_recv() {
        if let JobEvent::Error { generation, .. } = &update.event {
            errors.push(*generation);
        }
        last = Some(update.event);
    }
    assert_eq!(errors, vec![Some(2)]);
    assert!(last.unwrap().is_terminal());

    let execution = repository.get_execution(response.execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.total_images, 2);
    assert_eq!(execution.successful_images, 1);
    assert_eq!(execution.failed_images, 1);
}

#[tokio::test]
async fn test_rejected_images_are_retried_in_order() {
    let dir = TempDir::new().unwrap();
    let defaults = PathDefaults::under(dir.path());
    let repository = sqlite(&dir).await;

    let engine = JobEngine::new(
        Arc::new(MockParameterGenerator::new()),
        Arc::new(MockImageGenerator::new()),
    )
    .with_quality_checker(Arc::new(MockQualityChecker::rejecting("blurry")))
    .with_path_defaults(defaults.clone());
    let service = JobService::new(repository.clone(), engine);

    let mut config = job_config(3, 1);
    config.ai.run_quality_check = true;
    let response = service.start_job(config, StartOptions::default()).await.unwrap();
    assert_eq!(response.result.failed_images, 3);

    let images = repository.images_for_execution(response.execution_id).await.unwrap();
    assert_eq!(images.len(), 3);
    assert!(images.iter().all(|i| i.qc_status == QcStatus::QcFailed));
    let image_ids: Vec<Uuid> = images.iter().map(|i| i.id).collect();

    let resolver = ConfigResolver::new(repository.clone(), defaults.clone(), Duration::from_millis(5));
    let runner = PostProcessingRunner::new(repository.clone(), Arc::new(RasterTransformer::new()), defaults.clone());
    let queue = RetryQueue::new(Arc::new(MockRetryProcessor::new()), Duration::ZERO);
    let processor = RetryProcessor::new(repository.clone(), resolver, Arc::new(runner))
        .with_events(queue.event_sender());
    queue.set_processor(Arc::new(processor)).await;

    let mut events = queue.subscribe();
    let batch = queue
        .add_batch_retry_job(BatchRetryRequest::original(image_ids.clone()))
        .await
        .unwrap();
    assert_eq!(batch.queued_jobs, 3);
    queue.wait_until_idle().await;

    let mut completed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RetryEvent::JobCompleted { image_id, outcome, .. } = event {
            assert!(outcome.success, "{:?}", outcome.error);
            completed.push(image_id);
        }
    }
    assert_eq!(completed, image_ids);

    for id in image_ids {
        let image = repository.get_image(id).await.unwrap().unwrap();
        assert_eq!(image.qc_status, QcStatus::Approved);
        let final_path = image.final_image_path.unwrap();
        assert!(final_path.starts_with(&defaults.output_directory));
        assert!(final_path.exists());
    }
}

#[tokio::test]
async fn test_trim_failure_policy() {
    let dir = TempDir::new().unwrap();
    let defaults = PathDefaults::under(dir.path());
    let repository = sqlite(&dir).await;
    let runner = PostProcessingRunner::new(
        repository.clone(),
        Arc::new(MockTransformer::new().failing_on(PipelineStage::Trim)),
        defaults.clone(),
    );

    let settings = ProcessingSettings {
        trim_transparent_background: true,
        ..Default::default()
    };

    for (fail_options, expect_success) in [
        (FailOptions::default(), true),
        (FailOptions::hard_fail_on([PipelineStage::Trim]), false),
    ] {
        let source = defaults.temp_directory.join(format!("{}.png", Uuid::new_v4()));
        write_test_png(&source).await.unwrap();
        let mut image = GeneratedImage::new(Uuid::new_v4(), "a lighthouse");
        image.temp_image_path = Some(source.clone());
        repository.insert_image(&image).await.unwrap();

        let outcome = runner
            .run(PostProcessRequest {
                image,
                source_path: source.clone(),
                settings: settings.clone(),
                include_metadata: false,
                job_configuration: JobConfiguration::default(),
                use_original_settings: false,
                fail_options,
            })
            .await;

        assert_eq!(outcome.success, expect_success);
        if expect_success {
            let stem = source.file_stem().unwrap();
            let expected = defaults.output_directory.join(stem).with_extension("png");
            assert_eq!(outcome.processed_image_path, Some(expected));
        } else {
            assert_eq!(outcome.qc_reason.as_deref(), Some("processing_failed:trim"));
        }
    }
}

#[tokio::test]
async fn test_replay_keeps_original_settings_snapshot() {
    let dir = TempDir::new().unwrap();
    let defaults = PathDefaults::under(dir.path());
    let repository = sqlite(&dir).await;

    let source = defaults.temp_directory.join("replay.png");
    write_test_png(&source).await.unwrap();
    let snapshot = r#"{"imageEnhancement":true,"sharpening":3}"#.to_string();
    let mut image = GeneratedImage::new(Uuid::new_v4(), "a bridge");
    image.qc_status = QcStatus::QcFailed;
    image.temp_image_path = Some(source);
    image.processing_settings = Some(snapshot.clone());
    repository.insert_image(&image).await.unwrap();

    let resolver = ConfigResolver::new(repository.clone(), defaults.clone(), Duration::from_millis(5));
    let runner = PostProcessingRunner::new(repository.clone(), Arc::new(RasterTransformer::new()), defaults);
    let queue = RetryQueue::new(
        Arc::new(RetryProcessor::new(repository.clone(), resolver, Arc::new(runner))),
        Duration::ZERO,
    );

    queue
        .add_batch_retry_job(BatchRetryRequest::original(vec![image.id]))
        .await
        .unwrap();
    queue.wait_until_idle().await;

    let stored = repository.get_image(image.id).await.unwrap().unwrap();
    assert_eq!(stored.qc_status, QcStatus::Approved);
    assert_eq!(stored.processing_settings, Some(snapshot));
}

#[tokio::test]
async fn test_missing_configuration_resolves_to_fallback() {
    let dir = TempDir::new().unwrap();
    let repository = sqlite(&dir).await;
    let execution = JobExecution::start(Some(Uuid::new_v4()), None, None);
    repository.insert_execution(&execution).await.unwrap();
    let image = GeneratedImage::new(execution.id, "prompt");

    let resolver = ConfigResolver::new(
        repository.clone(),
        PathDefaults::under(dir.path()),
        Duration::from_millis(5),
    );

    let config = resolver.get_original_job_configuration(&image).await;
    assert_eq!(config, resolver.get_fallback_configuration());
}

#[tokio::test]
async fn test_bulk_rerun_refused_while_selected_job_runs() {
    let dir = TempDir::new().unwrap();
    let repository = sqlite(&dir).await;
    let engine = JobEngine::new(
        Arc::new(MockParameterGenerator::new()),
        Arc::new(MockImageGenerator::new()),
    )
    .with_path_defaults(PathDefaults::under(dir.path()));
    let service = JobService::new(repository.clone(), engine);
    let coordinator = RerunCoordinator::new(service, RerunQueue::new(), Arc::new(MemorySecretStore::new()));

    let mut ids = Vec::new();
    for status in [ExecutionStatus::Completed, ExecutionStatus::Running, ExecutionStatus::Failed] {
        let saved = SavedConfiguration::new("saved", job_config(1, 1));
        repository.save_configuration(&saved).await.unwrap();
        let mut execution = JobExecution::start(Some(saved.id), None, None);
        execution.status = status;
        repository.insert_execution(&execution).await.unwrap();
        ids.push(execution.id);
    }

    let response = coordinator.bulk_rerun_job_executions(&ids).await.unwrap();

    assert!(!response.success);
    assert_eq!(response.queued, 0);
    assert!(coordinator.queue().is_empty());
    assert_eq!(repository.list_executions(10).await.unwrap().len(), 3);
}
