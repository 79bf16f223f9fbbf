use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::enums::ServiceStatus;
use super::models::{EventRecord, ServiceDescriptor, StatusCounts};
use super::{MonitorRepository, RepositoryError};

#[derive(Default)]
struct MemoryState {
    services: BTreeMap<i32, ServiceDescriptor>,
    events: Vec<EventRecord>,
}

/// Process-local repository used for `--demo` runs and tests.
///
/// Status writes can be made to fail on demand to exercise the
/// persistence-failure path.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<MemoryState>,
    fail_status_writes: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_services(services: impl IntoIterator<Item = ServiceDescriptor>) -> Self {
        let repo = Self::new();
        for service in services {
            repo.upsert_service(service);
        }
        repo
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert_service(&self, service: ServiceDescriptor) {
        self.state().services.insert(service.id, service);
    }

    pub fn service(&self, id: i32) -> Option<ServiceDescriptor> {
        self.state().services.get(&id).cloned()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.state().events.clone()
    }

    pub fn events_for(&self, service_id: i32) -> Vec<EventRecord> {
        self.state()
            .events
            .iter()
            .filter(|e| e.service_id == service_id)
            .cloned()
            .collect()
    }

    pub fn set_fail_status_writes(&self, fail: bool) {
        self.fail_status_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MonitorRepository for InMemoryRepository {
    async fn get_services_to_monitor(&self) -> Result<Vec<ServiceDescriptor>, RepositoryError> {
        let mut services: Vec<ServiceDescriptor> = self
            .state()
            .services
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect();
        services.sort_by(|a, b| {
            a.host_name
                .cmp(&b.host_name)
                .then_with(|| a.service_name.cmp(&b.service_name))
        });
        Ok(services)
    }

    async fn get_service_by_id(&self, id: i32) -> Result<ServiceDescriptor, RepositoryError> {
        self.service(id).ok_or(RepositoryError::NotFound(id))
    }

    async fn update_service_status(
        &self,
        id: i32,
        status: ServiceStatus,
        message: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        if self.fail_status_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable(
                "status writes are disabled".to_string(),
            ));
        }
        let mut state = self.state();
        let service = state
            .services
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound(id))?;
        service.status = status;
        service.last_message = message.to_string();
        service.last_check = Some(checked_at);
        Ok(())
    }

    async fn get_status_counts(&self) -> Result<StatusCounts, RepositoryError> {
        let mut counts = StatusCounts::default();
        for service in self.state().services.values().filter(|s| s.active) {
            counts.record(service.status);
        }
        Ok(counts)
    }

    async fn insert_event(&self, event: &EventRecord) -> Result<(), RepositoryError> {
        self.state().events.push(event.clone());
        Ok(())
    }
}
