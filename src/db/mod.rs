//! Persistence seam for the monitoring core.
//!
//! The core only needs a handful of reads and writes against host services
//! and the event log; everything else (host CRUD, users, preferences) lives
//! behind the admin surface.

pub mod enums;
pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use enums::ServiceStatus;
use models::{EventRecord, ServiceDescriptor, StatusCounts};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Host service not found: {0}")]
    NotFound(i32),
    #[error("Invalid stored value: {0}")]
    InvalidData(String),
    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MonitorRepository: Send + Sync {
    /// Active host services on active hosts, ordered by host then service name.
    async fn get_services_to_monitor(&self) -> Result<Vec<ServiceDescriptor>, RepositoryError>;

    async fn get_service_by_id(&self, id: i32) -> Result<ServiceDescriptor, RepositoryError>;

    async fn update_service_status(
        &self,
        id: i32,
        status: ServiceStatus,
        message: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Status counts over active host services.
    async fn get_status_counts(&self) -> Result<StatusCounts, RepositoryError>;

    async fn insert_event(&self, event: &EventRecord) -> Result<(), RepositoryError>;
}
