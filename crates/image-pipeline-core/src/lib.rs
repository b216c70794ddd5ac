//! # Image Pipeline Core
//!
//! Job orchestration and retry engine for an AI image production pipeline:
//! running generation jobs, recording their executions, reprocessing failed
//! images through a staged post-processing pipeline and rerunning past jobs.

pub mod clients;
pub mod config;
pub mod config_resolver;
pub mod database;
pub mod engine;
pub mod error;
pub mod events;
pub mod job_service;
pub mod logging;
pub mod mocks;
pub mod models;
pub mod post_processing;
pub mod progress;
pub mod queue;
pub mod repository;
pub mod rerun;
pub mod retry_processor;
pub mod transform;
pub mod utils;

// Re-export commonly used types
pub use config::{AppConfig, ConfigManager, PathDefaults};
pub use config_resolver::ConfigResolver;
pub use database::{DatabaseConfig, SqliteRepository};
pub use engine::{JobEngine, JobOutcomeStatus, JobResult};
pub use error::*;
pub use events::{JobEvent, JobUpdate, RetryEvent};
pub use job_service::{JobService, StartJobResponse, StartOptions};
pub use models::*;
pub use post_processing::{PostProcessOutcome, PostProcessRequest, PostProcessingRunner};
pub use queue::{BatchRetryRequest, RetryJobProcessor, RetryQueue};
pub use repository::{MemoryRepository, Repository};
pub use rerun::{RerunCoordinator, RerunQueue};
pub use retry_processor::RetryProcessor;

/// Initialize the image pipeline core library
pub async fn init() -> Result<()> {
    logging::init_logging()?;

    tracing::info!("Image Pipeline Core initialized successfully");
    Ok(())
}

/// Get the version of the image pipeline core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init() {
        let result = init().await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_version() {
        let version = version();
        assert!(!version.is_empty());
    }
}
