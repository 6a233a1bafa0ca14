// src/handlers/mod.rs
pub mod backup;
pub mod command;
pub mod initialize;

use async_trait::async_trait;

use crate::job::{BackupOptions, BackupSummary, DateRange};

/// Backs up one project. May fan out internally; partial failure is reported
/// through the summary, total failure through `Err`.
#[async_trait]
pub trait ProjectBackup: Send + Sync {
    async fn backup_project(
        &self,
        project_id: &str,
        options: &BackupOptions,
    ) -> anyhow::Result<BackupSummary>;
}

/// Discovers projects in a date range and enqueues their backups.
#[async_trait]
pub trait ProjectInitializer: Send + Sync {
    async fn initialize_projects(&self, range: &DateRange) -> anyhow::Result<()>;
}
