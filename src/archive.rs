//! Latency archival of HTTP probe timings into a document store.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::db::models::ServiceDescriptor;
use crate::monitoring::probes::PhaseTimings;

pub const COMPUTE_TIMES_COLLECTION: &str = "compute-times";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("Document store rejected {collection}/{id}: {reason}")]
    Rejected {
        collection: String,
        id: String,
        reason: String,
    },
}

#[async_trait]
pub trait DocumentIndexer: Send + Sync {
    async fn index(
        &self,
        collection: &str,
        id: &str,
        document: serde_json::Value,
    ) -> Result<(), ArchiveError>;
}

/// One HTTP probe's phase breakdown, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingBreakdown {
    pub id: Uuid,
    pub service_id: i32,
    pub host_id: i32,
    pub host_name: String,
    pub url: String,
    pub dns: Option<f64>,
    pub connect: Option<f64>,
    pub tls_handshake: Option<f64>,
    pub first_byte: Option<f64>,
    pub total: Option<f64>,
    pub response_status: Option<u16>,
    pub created_at: DateTime<Utc>,
}

impl TimingBreakdown {
    pub fn new(service: &ServiceDescriptor, timings: &PhaseTimings, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_id: service.id,
            host_id: service.host_id,
            host_name: service.host_name.clone(),
            url: service.host_url.clone(),
            dns: timings.dns_ms,
            connect: timings.connect_ms,
            tls_handshake: timings.tls_handshake_ms,
            first_byte: timings.first_byte_ms,
            total: timings.total_ms,
            response_status: timings.response_status,
            created_at,
        }
    }

    pub async fn archive(&self, indexer: &dyn DocumentIndexer) -> Result<(), ArchiveError> {
        let document = serde_json::to_value(self)?;
        indexer
            .index(COMPUTE_TIMES_COLLECTION, &self.id.to_string(), document)
            .await
    }
}

/// Elasticsearch-compatible indexer: `PUT {base}/{collection}/_doc/{id}`.
pub struct HttpDocumentIndexer {
    client: Client,
    base_url: String,
}

impl HttpDocumentIndexer {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl DocumentIndexer for HttpDocumentIndexer {
    async fn index(
        &self,
        collection: &str,
        id: &str,
        document: serde_json::Value,
    ) -> Result<(), ArchiveError> {
        let url = format!("{}/{}/_doc/{}", self.base_url, collection, id);
        let response = self.client.put(&url).json(&document).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(ArchiveError::Rejected {
                collection: collection.to_string(),
                id: id.to_string(),
                reason: format!("{status}: {body}"),
            });
        }
        debug!(collection, id, "Document indexed.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::enums::{IntervalUnit, ServiceStatus};
    use crate::db::models::IntervalSpec;
    use crate::test_support::HttpStub;

    fn service() -> ServiceDescriptor {
        ServiceDescriptor {
            id: 3,
            host_id: 1,
            host_name: "api".to_string(),
            host_url: "https://api.example.com".to_string(),
            service_type_id: 2,
            service_name: "HTTPS".to_string(),
            icon: String::new(),
            active: true,
            schedule: IntervalSpec::new(30, IntervalUnit::Seconds),
            status: ServiceStatus::Healthy,
            last_message: String::new(),
            last_check: None,
        }
    }

    #[tokio::test]
    async fn test_breakdown_is_put_into_compute_times() {
        let stub = HttpStub::spawn("201 Created", "{}").await;
        let indexer = HttpDocumentIndexer::new(Client::new(), &format!("{}/", stub.url));
        let timings = PhaseTimings {
            dns_ms: Some(1.5),
            connect_ms: Some(2.0),
            tls_handshake_ms: None,
            first_byte_ms: Some(10.0),
            total_ms: Some(12.5),
            response_status: Some(200),
        };
        let breakdown = TimingBreakdown::new(&service(), &timings, Utc::now());

        breakdown.archive(&indexer).await.unwrap();

        let request = &stub.requests()[0];
        let expected = format!("PUT /compute-times/_doc/{} ", breakdown.id);
        assert!(request.starts_with(&expected), "got {request}");
        assert!(request.contains("\"tls_handshake\":null"));
        assert!(request.contains("\"response_status\":200"));
    }

    #[tokio::test]
    async fn test_store_rejection_is_reported() {
        let stub = HttpStub::spawn("400 Bad Request", "mapping error").await;
        let indexer = HttpDocumentIndexer::new(Client::new(), &stub.url);
        let result = indexer
            .index(COMPUTE_TIMES_COLLECTION, "abc", serde_json::json!({"total": 1.0}))
            .await;
        match result {
            Err(ArchiveError::Rejected { id, reason, .. }) => {
                assert_eq!(id, "abc");
                assert!(reason.contains("mapping error"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
