//! Persistence boundary for executions, configurations and images

use crate::error::{ProcessingError, Result};
use crate::models::{
    ConfigurationId, ExecutionId, ExecutionStatus, GeneratedImage, ImageId, JobExecution, QcStatus,
    SavedConfiguration,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Storage for the records the pipeline reads and mutates.
///
/// Lookups by id may briefly miss a record that was just written; callers that
/// care retry once after a short delay.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn insert_execution(&self, execution: &JobExecution) -> Result<()>;
    async fn update_execution(&self, execution: &JobExecution) -> Result<()>;
    async fn get_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>>;
    /// Most recent first
    async fn list_executions(&self, limit: usize) -> Result<Vec<JobExecution>>;
    async fn running_execution(&self) -> Result<Option<JobExecution>>;

    async fn save_configuration(&self, configuration: &SavedConfiguration) -> Result<()>;
    async fn get_configuration(&self, id: ConfigurationId) -> Result<Option<SavedConfiguration>>;

    async fn insert_image(&self, image: &GeneratedImage) -> Result<()>;
    async fn update_image(&self, image: &GeneratedImage) -> Result<()>;
    async fn get_image(&self, id: ImageId) -> Result<Option<GeneratedImage>>;
    async fn images_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<GeneratedImage>>;
    async fn update_image_status(
        &self,
        id: ImageId,
        status: QcStatus,
        reason: Option<&str>,
    ) -> Result<()>;
}

/// In-process repository
#[derive(Debug, Default, Clone)]
pub struct MemoryRepository {
    executions: Arc<RwLock<Vec<JobExecution>>>,
    configurations: Arc<RwLock<HashMap<ConfigurationId, SavedConfiguration>>>,
    images: Arc<RwLock<Vec<GeneratedImage>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_execution(&self, execution: &JobExecution) -> Result<()> {
        let mut executions = self.executions.write().await;
        if executions.iter().any(|e| e.id == execution.id) {
            return Err(ProcessingError::InvalidInput {
                message: format!("Execution {} already exists", execution.id),
            });
        }
        executions.push(execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &JobExecution) -> Result<()> {
        let mut executions = self.executions.write().await;
        let slot = executions
            .iter_mut()
            .find(|e| e.id == execution.id)
            .ok_or_else(|| ProcessingError::NotFound {
                entity: "execution",
                id: execution.id.to_string(),
            })?;
        *slot = execution.clone();
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>> {
        let executions = self.executions.read().await;
        Ok(executions.iter().find(|e| e.id == id).cloned())
    }

    async fn list_executions(&self, limit: usize) -> Result<Vec<JobExecution>> {
        let executions = self.executions.read().await;
        Ok(executions.iter().rev().take(limit).cloned().collect())
    }

    async fn running_execution(&self) -> Result<Option<JobExecution>> {
        let executions = self.executions.read().await;
        Ok(executions
            .iter()
            .rev()
            .find(|e| e.status == ExecutionStatus::Running)
            .cloned())
    }

    async fn save_configuration(&self, configuration: &SavedConfiguration) -> Result<()> {
        let mut configurations = self.configurations.write().await;
        configurations.insert(configuration.id, configuration.clone());
        Ok(())
    }

    async fn get_configuration(&self, id: ConfigurationId) -> Result<Option<SavedConfiguration>> {
        let configurations = self.configurations.read().await;
        Ok(configurations.get(&id).cloned())
    }

    async fn insert_image(&self, image: &GeneratedImage) -> Result<()> {
        let mut images = self.images.write().await;
        images.push(image.clone());
        Ok(())
    }

    async fn update_image(&self, image: &GeneratedImage) -> Result<()> {
        let mut images = self.images.write().await;
        let slot = images
            .iter_mut()
            .find(|i| i.id == image.id)
            .ok_or_else(|| ProcessingError::NotFound {
                entity: "image",
                id: image.id.to_string(),
            })?;
        *slot = image.clone();
        Ok(())
    }

    async fn get_image(&self, id: ImageId) -> Result<Option<GeneratedImage>> {
        let images = self.images.read().await;
        Ok(images.iter().find(|i| i.id == id).cloned())
    }

    async fn images_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<GeneratedImage>> {
        let images = self.images.read().await;
        Ok(images
            .iter()
            .filter(|i| i.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn update_image_status(
        &self,
        id: ImageId,
        status: QcStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut images = self.images.write().await;
        let image = images
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| ProcessingError::NotFound {
                entity: "image",
                id: id.to_string(),
            })?;
        image.qc_status = status;
        image.qc_reason = reason.map(str::to_string);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobConfiguration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_execution_crud() {
        let repo = MemoryRepository::new();
        let mut execution = JobExecution::start(None, Some("first".to_string()), None);
        repo.insert_execution(&execution).await.unwrap();
        assert!(repo.insert_execution(&execution).await.is_err());

        assert_eq!(
            repo.running_execution().await.unwrap().map(|e| e.id),
            Some(execution.id)
        );

        execution.status = ExecutionStatus::Completed;
        repo.update_execution(&execution).await.unwrap();
        assert!(repo.running_execution().await.unwrap().is_none());

        let loaded = repo.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let repo = MemoryRepository::new();
        let mut ids = Vec::new();
        for i in 0..3 {
            let execution = JobExecution::start(None, Some(format!("job {}", i)), None);
            ids.push(execution.id);
            repo.insert_execution(&execution).await.unwrap();
        }

        let history = repo.list_executions(2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, ids[2]);
        assert_eq!(history[1].id, ids[1]);
    }

    #[tokio::test]
    async fn test_image_status_update() {
        let repo = MemoryRepository::new();
        let image = GeneratedImage::new(Uuid::new_v4(), "prompt");
        repo.insert_image(&image).await.unwrap();

        repo.update_image_status(image.id, QcStatus::RetryFailed, Some("processing_failed:trim"))
            .await
            .unwrap();

        let loaded = repo.get_image(image.id).await.unwrap().unwrap();
        assert_eq!(loaded.qc_status, QcStatus::RetryFailed);
        assert_eq!(loaded.qc_reason.as_deref(), Some("processing_failed:trim"));

        let missing = repo
            .update_image_status(Uuid::new_v4(), QcStatus::Approved, None)
            .await;
        assert!(matches!(missing, Err(ProcessingError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_configuration_lookup() {
        let repo = MemoryRepository::new();
        let saved = SavedConfiguration::new("default", JobConfiguration::default());
        repo.save_configuration(&saved).await.unwrap();

        assert!(repo.get_configuration(saved.id).await.unwrap().is_some());
        assert!(repo.get_configuration(Uuid::new_v4()).await.unwrap().is_none());
    }
}
