use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::scheduler::{JobCallback, JobFuture, JobId, Scheduler, SchedulerError};
use crate::db::models::IntervalSpec;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Monitoring is not live; service {0} was not registered")]
    NotLive(i32),
    #[error("Scheduler rejected the job: {0}")]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEntry {
    pub service_id: i32,
    pub job_id: JobId,
    pub interval: IntervalSpec,
}

/// Maps service ids to their scheduled jobs. The map is the only shared
/// mutable in-memory state of the monitor.
///
/// Every service also owns a run guard that outlives its jobs. A replacement
/// job waits on it, so a run left over from the previous job never overlaps
/// the first run of the new one.
#[derive(Clone)]
pub struct MonitorRegistry {
    scheduler: Scheduler,
    entries: Arc<Mutex<HashMap<i32, MonitorEntry>>>,
    run_guards: Arc<Mutex<HashMap<i32, Arc<Mutex<()>>>>>,
}

impl MonitorRegistry {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            entries: Arc::new(Mutex::new(HashMap::new())),
            run_guards: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Schedules `callback` for the service. An existing job for the same id is
    /// removed first so a service never has two jobs.
    pub async fn register(
        &self,
        service_id: i32,
        interval: IntervalSpec,
        callback: JobCallback,
    ) -> Result<JobId, RegistryError> {
        let mut entries = self.entries.lock().await;
        if !self.scheduler.is_running() {
            return Err(RegistryError::NotLive(service_id));
        }

        let callback = self.guarded(service_id, callback).await;
        if let Some(previous) = entries.remove(&service_id) {
            self.scheduler.remove_job(previous.job_id);
            debug!(service_id, job_id = %previous.job_id, "Replaced existing monitor job.");
        }

        let job_id = self.scheduler.add_job(&interval.cron_expression(), callback)?;
        entries.insert(
            service_id,
            MonitorEntry {
                service_id,
                job_id,
                interval,
            },
        );
        info!(service_id, job_id = %job_id, schedule = %interval.schedule_text(), "Service registered for monitoring.");
        Ok(job_id)
    }

    async fn guarded(&self, service_id: i32, callback: JobCallback) -> JobCallback {
        let guard = self
            .run_guards
            .lock()
            .await
            .entry(service_id)
            .or_default()
            .clone();
        Arc::new(move || -> JobFuture {
            let guard = guard.clone();
            let run = callback();
            Box::pin(async move {
                let _running = guard.lock().await;
                run.await;
            })
        })
    }

    /// Returns the removed entry, or `None` if the service was not registered.
    pub async fn unregister(&self, service_id: i32) -> Option<MonitorEntry> {
        let removed = self.entries.lock().await.remove(&service_id);
        if let Some(entry) = &removed {
            self.scheduler.remove_job(entry.job_id);
            info!(service_id, job_id = %entry.job_id, "Service unregistered from monitoring.");
        }
        removed
    }

    pub async fn lookup(&self, service_id: i32) -> Option<JobId> {
        self.entries.lock().await.get(&service_id).map(|e| e.job_id)
    }

    pub async fn entry(&self, service_id: i32) -> Option<MonitorEntry> {
        self.entries.lock().await.get(&service_id).cloned()
    }

    pub async fn entries(&self) -> Vec<MonitorEntry> {
        let mut entries: Vec<MonitorEntry> = self.entries.lock().await.values().cloned().collect();
        entries.sort_by_key(|e| e.service_id);
        entries
    }

    pub async fn clear_all(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        for (_, entry) in entries.drain() {
            self.scheduler.remove_job(entry.job_id);
        }
        if count > 0 {
            info!(removed = count, "Cleared all monitor jobs.");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::enums::IntervalUnit;
    use chrono::FixedOffset;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn noop() -> JobCallback {
        Arc::new(|| -> JobFuture { Box::pin(async {}) })
    }

    fn live_registry() -> MonitorRegistry {
        let scheduler = Scheduler::new(FixedOffset::east_opt(0).unwrap());
        scheduler.start();
        MonitorRegistry::new(scheduler)
    }

    #[tokio::test]
    async fn test_register_rejected_when_not_live() {
        let registry = MonitorRegistry::new(Scheduler::new(FixedOffset::east_opt(0).unwrap()));
        let result = registry
            .register(1, IntervalSpec::new(5, IntervalUnit::Minutes), noop())
            .await;
        assert_eq!(result, Err(RegistryError::NotLive(1)));
        assert!(registry.lookup(1).await.is_none());
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = live_registry();
        let job = registry
            .register(7, IntervalSpec::new(1, IntervalUnit::Days), noop())
            .await
            .unwrap();

        assert_eq!(registry.lookup(7).await, Some(job));
        let entry = registry.entry(7).await.unwrap();
        assert_eq!(entry.interval.cron_expression(), "@every 24h");
        assert_eq!(registry.scheduler().len(), 1);
    }

    #[tokio::test]
    async fn test_reregister_replaces_previous_job() {
        let registry = live_registry();
        let first = registry
            .register(3, IntervalSpec::new(1, IntervalUnit::Minutes), noop())
            .await
            .unwrap();
        let second = registry
            .register(3, IntervalSpec::new(2, IntervalUnit::Minutes), noop())
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(registry.lookup(3).await, Some(second));
        assert_eq!(registry.scheduler().len(), 1);
        assert!(registry.scheduler().entry(first).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_stops_future_runs() {
        let registry = live_registry();
        let runs = Arc::new(AtomicUsize::new(0));
        let callback: JobCallback = {
            let runs = runs.clone();
            Arc::new(move || -> JobFuture {
                let runs = runs.clone();
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            })
        };
        registry
            .register(9, IntervalSpec::new(1, IntervalUnit::Seconds), callback)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert!(registry.unregister(9).await.is_some());
        assert!(registry.unregister(9).await.is_none());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_interval_leaves_service_unregistered() {
        let registry = live_registry();
        let result = registry
            .register(4, IntervalSpec::new(0, IntervalUnit::Seconds), noop())
            .await;
        assert!(matches!(result, Err(RegistryError::Scheduler(_))));
        assert!(registry.lookup(4).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_job_waits_for_previous_run() {
        let registry = live_registry();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let slow = || -> JobCallback {
            let (in_flight, max_in_flight, runs) =
                (in_flight.clone(), max_in_flight.clone(), runs.clone());
            Arc::new(move || -> JobFuture {
                let (in_flight, max_in_flight, runs) =
                    (in_flight.clone(), max_in_flight.clone(), runs.clone());
                Box::pin(async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(8)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            })
        };

        registry
            .register(40, IntervalSpec::new(10, IntervalUnit::Seconds), slow())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(in_flight.load(Ordering::SeqCst), 1);

        registry
            .register(40, IntervalSpec::new(1, IntervalUnit::Seconds), slow())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_register_after_scheduler_stop_leaves_no_entry() {
        let registry = live_registry();
        registry.scheduler().stop();
        let result = registry
            .register(5, IntervalSpec::new(1, IntervalUnit::Minutes), noop())
            .await;
        assert_eq!(result, Err(RegistryError::NotLive(5)));
        assert!(registry.entries().await.is_empty());
        assert!(registry.scheduler().is_empty());
    }

    #[tokio::test]
    async fn test_clear_all_removes_every_job() {
        let registry = live_registry();
        for id in 1..=3 {
            registry
                .register(id, IntervalSpec::new(id as u32, IntervalUnit::Hours), noop())
                .await
                .unwrap();
        }
        assert_eq!(registry.entries().await.len(), 3);
        assert_eq!(registry.clear_all().await, 3);
        assert!(registry.entries().await.is_empty());
        assert!(registry.scheduler().is_empty());
    }
}
