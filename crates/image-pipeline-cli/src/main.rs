//! Command-line interface for the image pipeline

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use image_pipeline_core::clients::{
    CommandImageGenerator, EnvSecretStore, PromptFileParameterGenerator, SecretStore,
};
use image_pipeline_core::logging::init_logging_with;
use image_pipeline_core::transform::RasterTransformer;
use image_pipeline_core::{
    version, AppConfig, BatchRetryRequest, ConfigManager, ConfigResolver, DatabaseConfig,
    ExecutionId, FailOptions, JobConfiguration, JobEngine, JobEvent, JobService, JobUpdate, PathDefaults,
    PipelineStage, PostProcessingRunner, ProcessingSettings, Repository, RerunCoordinator,
    RerunQueue, RetryEvent, RetryProcessor, RetryQueue, SqliteRepository, StartOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "image-pipeline")]
#[command(about = "Run, retry and rerun AI image generation jobs")]
#[command(version = version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a generation job from a job configuration file (JSON or TOML)
    Run {
        /// Job configuration file
        #[arg(short, long)]
        job: PathBuf,

        /// Label recorded on the execution
        #[arg(short, long)]
        label: Option<String>,

        /// Override the number of generations
        #[arg(long)]
        count: Option<u32>,

        /// Override the variations per generation
        #[arg(long)]
        variations: Option<u32>,
    },

    /// List recent job executions
    History {
        /// Maximum number of executions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one execution and its images
    Status {
        /// Execution id
        execution_id: Uuid,
    },

    /// Reprocess images through the post-processing pipeline
    Retry {
        /// Image ids, processed in the given order
        #[arg(required = true)]
        image_ids: Vec<Uuid>,

        /// Processing settings file (JSON) to use instead of the originals
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Regenerate metadata
        #[arg(long)]
        include_metadata: bool,

        /// Stages that must fail the retry instead of being skipped
        #[arg(long, value_delimiter = ',')]
        hard_fail: Vec<String>,
    },

    /// Rerun past executions from their saved configurations
    Rerun {
        /// Execution ids; more than one runs them one after another
        #[arg(required = true)]
        execution_ids: Vec<Uuid>,
    },

    /// Show version, platform and configuration details
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => ConfigManager::default_config_path()?,
    };
    let manager = ConfigManager::load_layered(config_path)?;
    let mut app = manager.config().clone();
    if cli.verbose {
        app.logging.level = "debug".to_string();
    }
    let _log_guard = init_logging_with(&app.logging)?;

    info!("Image Pipeline CLI v{} starting", version());

    match cli.command {
        Commands::Run {
            job,
            label,
            count,
            variations,
        } => run_job(&app, &job, label, count, variations).await,
        Commands::History { limit, json } => history(&app, limit, json).await,
        Commands::Status { execution_id } => status(&app, execution_id).await,
        Commands::Retry {
            image_ids,
            settings,
            include_metadata,
            hard_fail,
        } => retry(&app, image_ids, settings, include_metadata, hard_fail).await,
        Commands::Rerun { execution_ids } => rerun(&app, execution_ids).await,
        Commands::Info => {
            print_info(&app, manager.config_path());
            Ok(())
        }
    }
}

async fn open_repository(app: &AppConfig) -> Result<Arc<SqliteRepository>> {
    let repository = SqliteRepository::connect(DatabaseConfig::with_url(&app.storage.database_url))
        .await
        .with_context(|| format!("Failed to open database {}", app.storage.database_url))?;
    Ok(Arc::new(repository))
}

fn job_service(app: &AppConfig, repository: Arc<SqliteRepository>) -> Result<JobService> {
    let command = app
        .generation
        .command
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .context("No generator command configured; set generation.command in the config file")?;

    let engine = JobEngine::new(
        Arc::new(PromptFileParameterGenerator::new()),
        Arc::new(CommandImageGenerator::from_command_line(command)?),
    )
    .with_path_defaults(PathDefaults::from(&app.storage));

    Ok(JobService::new(repository, engine))
}

fn read_job_configuration(path: &Path) -> Result<JobConfiguration> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job configuration {}", path.display()))?;

    let config = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&text)?,
        _ => serde_json::from_str(&text)?,
    };
    Ok(config)
}

/// Refuse to start while another process has a job running against the same database
async fn ensure_no_running_job(repository: &dyn Repository) -> Result<()> {
    if let Some(running) = repository.running_execution().await? {
        bail!(
            "Execution {} ({}) is already running",
            running.id,
            running.display_label()
        );
    }
    Ok(())
}

/// Print job updates until the terminal event; returns whether it was seen
async fn print_updates(mut updates: broadcast::Receiver<JobUpdate>) -> bool {
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Progress output fell behind, skipped {} update(s)", skipped);
                continue;
            }
            Err(RecvError::Closed) => return false,
        };

        match update.event {
            JobEvent::Progress { percent, message, .. } => println!("[{:>5.1}%] {}", percent, message),
            JobEvent::ImageGenerated { image } => println!("  image {} ({})", image.id, image.qc_status),
            JobEvent::Error { generation, message } => match generation {
                Some(generation) => println!("  generation {} failed: {}", generation, message),
                None => println!("  error: {}", message),
            },
            JobEvent::JobComplete { .. } => return true,
        }
    }
}

async fn run_job(
    app: &AppConfig,
    job: &Path,
    label: Option<String>,
    count: Option<u32>,
    variations: Option<u32>,
) -> Result<()> {
    let mut config = read_job_configuration(job)?;
    if let Some(count) = count {
        config.parameters.count = count;
    }
    if let Some(variations) = variations {
        config.parameters.variations = variations;
    }
    if config.parameters.polling_timeout_secs == 0 {
        config.parameters.polling_timeout_secs = app.generation.polling_timeout_secs;
    }
    let config = config.with_credentials(EnvSecretStore.api_keys());

    let repository = open_repository(app).await?;
    ensure_no_running_job(repository.as_ref()).await?;
    let service = job_service(app, repository)?;

    let printer = tokio::spawn(print_updates(service.subscribe()));

    let stopper = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current generation");
            if let Err(e) = stopper.stop_job().await {
                warn!("Failed to stop job: {}", e);
            }
        }
    });

    let response = service
        .start_job(config, StartOptions { configuration_id: None, label })
        .await?;
    let _ = printer.await;

    println!(
        "Execution {} {:?}: {} succeeded, {} failed, {} total",
        response.execution_id,
        response.result.status,
        response.result.successful_images,
        response.result.failed_images,
        response.result.total_images
    );
    if let Some(error) = &response.result.error {
        println!("Error: {}", error);
    }
    Ok(())
}

async fn history(app: &AppConfig, limit: usize, json: bool) -> Result<()> {
    let repository = open_repository(app).await?;
    let executions = repository.list_executions(limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!("No job executions recorded");
        return Ok(());
    }

    for execution in executions {
        println!(
            "{}  {:<9}  {:>3}/{:<3}  {}  {}",
            execution.id,
            execution.status.as_str(),
            execution.successful_images,
            execution.total_images,
            execution.started_at.format("%Y-%m-%d %H:%M"),
            execution.display_label()
        );
    }
    Ok(())
}

async fn status(app: &AppConfig, execution_id: ExecutionId) -> Result<()> {
    let repository = open_repository(app).await?;
    let Some(execution) = repository.get_execution(execution_id).await? else {
        bail!("Execution {} not found", execution_id);
    };

    println!("Execution {} ({})", execution.id, execution.display_label());
    println!("  status:  {}", execution.status.as_str());
    println!(
        "  images:  {} succeeded, {} failed, {} total",
        execution.successful_images, execution.failed_images, execution.total_images
    );
    if let Some(error) = &execution.error_message {
        println!("  error:   {}", error);
    }

    for image in repository.images_for_execution(execution.id).await? {
        let path = image
            .final_image_path
            .as_ref()
            .or(image.temp_image_path.as_ref())
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  {:<12}  {}  {}",
            image.id,
            image.qc_status.as_str(),
            image.qc_reason.as_deref().unwrap_or(""),
            path
        );
    }
    Ok(())
}

fn parse_fail_options(stages: &[String]) -> Result<FailOptions> {
    if stages.is_empty() {
        return Ok(FailOptions::default());
    }

    let steps = stages
        .iter()
        .map(|tag| PipelineStage::parse(tag).with_context(|| format!("Unknown pipeline stage '{}'", tag)))
        .collect::<Result<Vec<_>>>()?;
    Ok(FailOptions::hard_fail_on(steps))
}

async fn retry(
    app: &AppConfig,
    image_ids: Vec<Uuid>,
    settings: Option<PathBuf>,
    include_metadata: bool,
    hard_fail: Vec<String>,
) -> Result<()> {
    let modified_settings = match settings {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings {}", path.display()))?;
            Some(serde_json::from_str::<ProcessingSettings>(&text)?)
        }
        None => None,
    };
    let fail_options = parse_fail_options(&hard_fail)?;

    let repository = open_repository(app).await?;
    let defaults = PathDefaults::from(&app.storage);
    let resolver = ConfigResolver::new(repository.clone(), defaults.clone(), app.queue.lookup_retry_delay());
    let runner = PostProcessingRunner::new(repository.clone(), Arc::new(RasterTransformer::new()), defaults)
        .with_secret_store(Arc::new(EnvSecretStore));
    let processor = RetryProcessor::new(repository.clone(), resolver, Arc::new(runner));
    let queue = RetryQueue::new(Arc::new(processor), app.queue.progress_delay());

    let mut events = queue.subscribe();
    let response = queue
        .add_batch_retry_job(BatchRetryRequest {
            use_original_settings: modified_settings.is_none(),
            image_ids,
            modified_settings,
            include_metadata,
            fail_options,
        })
        .await?;
    println!("Queued {} retry job(s)", response.queued_jobs);

    queue.wait_until_idle().await;

    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            RetryEvent::JobCompleted { image_id, outcome, .. } => match outcome.processed_image_path {
                Some(path) => println!("  {} approved: {}", image_id, path.display()),
                None => println!("  {} approved", image_id),
            },
            RetryEvent::JobError { image_id, error, .. } => {
                failures += 1;
                println!("  {} failed: {}", image_id, error);
            }
            _ => {}
        }
    }

    if failures > 0 {
        bail!("{} retry job(s) failed", failures);
    }
    Ok(())
}

async fn rerun(app: &AppConfig, execution_ids: Vec<Uuid>) -> Result<()> {
    let repository = open_repository(app).await?;
    let service = job_service(app, repository)?;
    let coordinator = RerunCoordinator::new(service, RerunQueue::new(), Arc::new(EnvSecretStore));

    if let [execution_id] = execution_ids.as_slice() {
        let response = coordinator.rerun_job_execution(*execution_id).await?;
        println!("Started {} as execution {}", response.label, response.execution_id);
    } else {
        let response = coordinator.bulk_rerun_job_executions(&execution_ids).await?;
        for failure in &response.failed_jobs {
            println!("  {} skipped: {}", failure.execution_id, failure.reason);
        }
        if !response.success {
            bail!("{}", response.message);
        }
        println!("{}", response.message);
    }

    coordinator.wait_for_completion().await;
    println!("All reruns finished");
    Ok(())
}

fn print_info(app: &AppConfig, config_path: &Path) {
    println!("Image Pipeline v{}", version());
    println!("Job orchestration and retry engine for AI image generation");
    println!("\nSystem Information:");
    println!("  Platform: {}", std::env::consts::OS);
    println!("  Architecture: {}", std::env::consts::ARCH);
    println!("\nConfiguration:");
    println!("  Config file: {}", config_path.display());
    println!("  Database: {}", app.storage.database_url);
    println!("  Output directory: {}", app.storage.output_directory.display());
    println!("  Temp directory: {}", app.storage.temp_directory.display());
    println!(
        "  Generator command: {}",
        app.generation.command.as_deref().unwrap_or("(not configured)")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use image_pipeline_core::events::JobPhase;
    use image_pipeline_core::{ExecutionStatus, JobExecution, JobOutcomeStatus, MemoryRepository};

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["image-pipeline", "info"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_retry_parsing() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "image-pipeline",
            "retry",
            &id.to_string(),
            "--hard-fail",
            "trim,convert",
        ])
        .unwrap();

        match cli.command {
            Commands::Retry { image_ids, hard_fail, .. } => {
                assert_eq!(image_ids, vec![id]);
                let options = parse_fail_options(&hard_fail).unwrap();
                assert!(options.is_hard(PipelineStage::Trim));
                assert!(options.is_hard(PipelineStage::Convert));
                assert!(!options.is_hard(PipelineStage::Metadata));
            }
            _ => panic!("expected retry command"),
        }
    }

    #[test]
    fn test_unknown_stage_is_rejected() {
        assert!(parse_fail_options(&["sparkle".to_string()]).is_err());
    }

    #[test]
    fn test_read_job_configuration_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, r#"{"parameters":{"count":3},"processing":{"removeBg":true}}"#).unwrap();

        let config = read_job_configuration(&path).unwrap();
        assert_eq!(config.parameters.count, 3);
        assert!(config.processing.remove_bg);
    }

    #[tokio::test]
    async fn test_running_execution_blocks_new_run() {
        let repository = MemoryRepository::new();
        ensure_no_running_job(&repository).await.unwrap();

        let mut finished = JobExecution::start(None, Some("Done".to_string()), None);
        finished.status = ExecutionStatus::Completed;
        repository.insert_execution(&finished).await.unwrap();
        ensure_no_running_job(&repository).await.unwrap();

        let running = JobExecution::start(None, Some("Nightly".to_string()), None);
        repository.insert_execution(&running).await.unwrap();
        let error = ensure_no_running_job(&repository).await.unwrap_err();
        assert!(error.to_string().contains("Nightly"));
        assert!(error.to_string().contains("already running"));
    }

    #[tokio::test]
    async fn test_printer_survives_lagging_behind() {
        let execution_id = Uuid::new_v4();
        let update = |event| JobUpdate {
            execution_id,
            timestamp: chrono::Utc::now(),
            event,
        };

        let (sender, receiver) = broadcast::channel(2);
        for step in 0..5 {
            sender
                .send(update(JobEvent::Progress {
                    phase: JobPhase::ImageGeneration,
                    percent: step as f32 * 10.0,
                    generation: Some(1),
                    message: format!("step {}", step),
                }))
                .unwrap();
        }
        sender
            .send(update(JobEvent::JobComplete {
                status: JobOutcomeStatus::Completed,
                total_images: 1,
                successful_images: 1,
                failed_images: 0,
                message: None,
            }))
            .unwrap();

        assert!(print_updates(receiver).await);
    }
}
