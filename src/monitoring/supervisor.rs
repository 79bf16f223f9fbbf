//! Monitoring lifecycle and the check pipeline.
//!
//! A check loads the service, probes it, runs the pure transition and then
//! executes the side effects it asks for. Scheduled and manual checks share the
//! same path.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::context::MonitorContext;
use super::probes::{ProbeError, ProbeOutcome};
use super::registry::{MonitorRegistry, RegistryError};
use super::scheduler::{JobCallback, JobFuture, JobId, Scheduler};
use super::transition::{transition, ProbeResult, SideEffect, Transition};
use crate::archive::TimingBreakdown;
use crate::db::enums::ServiceStatus;
use crate::db::models::{EventRecord, IntervalSpec, ServiceDescriptor};
use crate::db::RepositoryError;
use crate::notifications::fanout::format_run_time;
use crate::notifications::service::StatusAlert;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for MonitoringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitoringState::Stopped => "stopped",
            MonitoringState::Starting => "starting",
            MonitoringState::Running => "running",
            MonitoringState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Cannot {operation} monitoring while it is {state}")]
    InvalidState {
        operation: &'static str,
        state: MonitoringState,
    },
    #[error("Monitoring is switched off")]
    NotLive,
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Result of an on-demand check, shaped for the admin UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualCheckResponse {
    pub ok: bool,
    pub message: String,
    pub service_id: i32,
    pub host_service_id: i32,
    pub host_id: i32,
    pub old_status: String,
    pub new_status: String,
    pub last_check: Option<DateTime<Utc>>,
}

impl ManualCheckResponse {
    fn failed(host_service_id: i32, message: String) -> Self {
        Self {
            ok: false,
            message,
            service_id: 0,
            host_service_id,
            host_id: 0,
            old_status: String::new(),
            new_status: String::new(),
            last_check: None,
        }
    }
}

/// One row of the schedule listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntryView {
    pub service_id: i32,
    pub host_name: String,
    pub service_name: String,
    pub next_run: Option<DateTime<FixedOffset>>,
    pub last_run: Option<DateTime<FixedOffset>>,
    pub schedule_text: String,
}

impl ScheduleEntryView {
    pub fn next_run_text(&self) -> String {
        format_run_time(self.next_run)
    }

    pub fn last_run_text(&self) -> String {
        format_run_time(self.last_run)
    }
}

pub struct Supervisor {
    context: MonitorContext,
    registry: MonitorRegistry,
    state: Mutex<MonitoringState>,
    live: AtomicBool,
    weak_self: Weak<Supervisor>,
}

impl Supervisor {
    pub fn new(context: MonitorContext) -> Arc<Self> {
        let registry = MonitorRegistry::new(Scheduler::new(context.timezone));
        let live = AtomicBool::new(context.monitoring_live);
        Arc::new_cyclic(|weak_self| Self {
            context,
            registry,
            state: Mutex::new(MonitoringState::Stopped),
            live,
            weak_self: weak_self.clone(),
        })
    }

    pub fn registry(&self) -> &MonitorRegistry {
        &self.registry
    }

    pub async fn state(&self) -> MonitoringState {
        *self.state.lock().await
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn transition_state(
        &self,
        operation: &'static str,
        from: MonitoringState,
        to: MonitoringState,
    ) -> Result<(), MonitorError> {
        let mut state = self.state.lock().await;
        if *state != from {
            return Err(MonitorError::InvalidState {
                operation,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    async fn set_state(&self, to: MonitoringState) {
        *self.state.lock().await = to;
    }

    /// Starts the scheduler and registers every active service. Returns how
    /// many services were scheduled.
    pub async fn start(&self) -> Result<usize, MonitorError> {
        if !self.is_live() {
            return Err(MonitorError::NotLive);
        }
        self.transition_state("start", MonitoringState::Stopped, MonitoringState::Starting)
            .await?;
        self.registry.scheduler().start();

        let services = match self.context.repository.get_services_to_monitor().await {
            Ok(services) => services,
            Err(e) => {
                error!(error = %e, "Failed to load services to monitor.");
                Vec::new()
            }
        };

        let mut scheduled = Vec::with_capacity(services.len());
        for service in services {
            match self
                .registry
                .register(service.id, service.schedule, self.check_job(service.id))
                .await
            {
                Ok(job_id) => scheduled.push((service, job_id)),
                Err(e) => {
                    warn!(service_id = service.id, error = %e, "Failed to schedule service; leaving it unregistered.");
                }
            }
        }

        self.context.fanout.app_starting().await;
        for (service, job_id) in &scheduled {
            let view = self.schedule_view(service, Some(*job_id), None);
            self.context
                .fanout
                .next_run(&view, &format!("Monitoring {}", service.service_name))
                .await;
        }

        self.set_state(MonitoringState::Running).await;
        info!(services = scheduled.len(), "Monitoring started.");
        Ok(scheduled.len())
    }

    /// Drops every job and stops the scheduler. Checks already running finish.
    pub async fn stop(&self) -> Result<(), MonitorError> {
        self.transition_state("stop", MonitoringState::Running, MonitoringState::Stopping)
            .await?;
        self.registry.scheduler().stop();
        self.registry.clear_all().await;
        self.context.fanout.app_stopping().await;
        self.set_state(MonitoringState::Stopped).await;
        info!("Monitoring stopped.");
        Ok(())
    }

    /// Flips the runtime `monitoring_live` preference, starting or stopping
    /// monitoring to match.
    pub async fn set_monitoring_live(&self, live: bool) -> Result<(), MonitorError> {
        self.live.store(live, Ordering::SeqCst);
        let state = self.state().await;
        match (live, state) {
            (true, MonitoringState::Stopped) => self.start().await.map(|_| ()),
            (false, MonitoringState::Running) => self.stop().await,
            _ => Ok(()),
        }
    }

    /// Schedules a (re)activated service and announces it as pending. Only
    /// allowed while monitoring is running.
    pub async fn register_service(
        &self,
        service_id: i32,
        interval: IntervalSpec,
    ) -> Result<JobId, MonitorError> {
        let job_id = {
            let state = self.state.lock().await;
            if *state != MonitoringState::Running {
                return Err(MonitorError::InvalidState {
                    operation: "register",
                    state: *state,
                });
            }
            self.registry
                .register(service_id, interval, self.check_job(service_id))
                .await?
        };

        match self.context.repository.get_service_by_id(service_id).await {
            Ok(service) => {
                let mut view = self.schedule_view(&service, Some(job_id), None);
                view.schedule_text = interval.schedule_text();
                self.context
                    .fanout
                    .schedule_changed(&view, ServiceStatus::Pending.as_str())
                    .await;
                let announce = Transition {
                    service_id,
                    previous: service.status,
                    new_status: ServiceStatus::Pending,
                    message: service.last_message.clone(),
                    changed: service.status != ServiceStatus::Pending,
                    notify_worthy: false,
                };
                self.context
                    .fanout
                    .status_changed(&service, &announce, Utc::now())
                    .await;
            }
            Err(e) => {
                warn!(service_id, error = %e, "Registered service could not be loaded for announcement.");
            }
        }
        Ok(job_id)
    }

    /// Removes a service from the schedule. A no-op if it was not scheduled.
    pub async fn unregister_service(&self, service_id: i32) -> bool {
        let Some(entry) = self.registry.unregister(service_id).await else {
            return false;
        };
        self.context.fanout.schedule_item_removed(service_id).await;

        match self.context.repository.get_service_by_id(service_id).await {
            Ok(service) => {
                let mut view = self.schedule_view(&service, None, None);
                view.schedule_text = entry.interval.schedule_text();
                self.context
                    .fanout
                    .schedule_changed(&view, "Removed from schedule")
                    .await;
            }
            Err(e) => {
                warn!(service_id, error = %e, "Unregistered service could not be loaded for announcement.");
            }
        }
        true
    }

    /// Probes a service now, outside the scheduler.
    pub async fn manual_check(&self, service_id: i32) -> ManualCheckResponse {
        let service = match self.context.repository.get_service_by_id(service_id).await {
            Ok(service) => service,
            Err(e) => {
                warn!(service_id, error = %e, "Manual check failed to load service.");
                return ManualCheckResponse::failed(service_id, e.to_string());
            }
        };

        match self.run_check(&service).await {
            Some((transition, checked_at)) => ManualCheckResponse {
                ok: true,
                message: transition.message,
                service_id: service.service_type_id,
                host_service_id: service.id,
                host_id: service.host_id,
                old_status: transition.previous.to_string(),
                new_status: transition.new_status.to_string(),
                last_check: Some(checked_at),
            },
            None => ManualCheckResponse {
                ok: true,
                message: service.last_message.clone(),
                service_id: service.service_type_id,
                host_service_id: service.id,
                host_id: service.host_id,
                old_status: service.status.to_string(),
                new_status: service.status.to_string(),
                last_check: service.last_check,
            },
        }
    }

    /// Job body for a scheduled service.
    pub async fn scheduled_check(&self, service_id: i32) {
        let service = match self.context.repository.get_service_by_id(service_id).await {
            Ok(service) => service,
            Err(e) => {
                warn!(service_id, error = %e, "Scheduled check failed to load service.");
                return;
            }
        };

        let Some((transition, checked_at)) = self.run_check(&service).await else {
            return;
        };

        let job_id = self.registry.lookup(service_id).await;
        let view = self.schedule_view(&service, job_id, Some(checked_at));
        self.context
            .fanout
            .schedule_changed(&view, &transition.message)
            .await;
    }

    /// Registered services, sorted by host name.
    pub async fn list_schedule_entries(&self) -> Result<Vec<ScheduleEntryView>, MonitorError> {
        let mut views = Vec::new();
        for entry in self.registry.entries().await {
            match self.context.repository.get_service_by_id(entry.service_id).await {
                Ok(service) => {
                    let mut view = self.schedule_view(&service, Some(entry.job_id), None);
                    view.schedule_text = entry.interval.schedule_text();
                    views.push(view);
                }
                Err(RepositoryError::NotFound(id)) => {
                    debug!(service_id = id, "Scheduled service no longer exists; skipping.");
                }
                Err(e) => return Err(e.into()),
            }
        }
        views.sort_by(|a, b| {
            a.host_name
                .cmp(&b.host_name)
                .then_with(|| a.service_id.cmp(&b.service_id))
        });
        Ok(views)
    }

    fn check_job(&self, service_id: i32) -> JobCallback {
        let supervisor = self.weak_self.clone();
        Arc::new(move || -> JobFuture {
            let supervisor = supervisor.clone();
            Box::pin(async move {
                if let Some(supervisor) = supervisor.upgrade() {
                    supervisor.scheduled_check(service_id).await;
                }
            })
        })
    }

    fn schedule_view(
        &self,
        service: &ServiceDescriptor,
        job_id: Option<JobId>,
        checked_at: Option<DateTime<Utc>>,
    ) -> ScheduleEntryView {
        let times = job_id
            .and_then(|id| self.registry.scheduler().entry(id))
            .unwrap_or_default();
        let last_check = checked_at.or(service.last_check);
        ScheduleEntryView {
            service_id: service.id,
            host_name: service.host_name.clone(),
            service_name: service.service_name.clone(),
            next_run: times.next,
            last_run: last_check
                .map(|t| t.with_timezone(&self.context.timezone))
                .or(times.prev),
            schedule_text: service.schedule.schedule_text(),
        }
    }

    /// Probe, decide, apply. `None` when the service kind has no probe, in
    /// which case nothing is recorded.
    async fn run_check(&self, service: &ServiceDescriptor) -> Option<(Transition, DateTime<Utc>)> {
        let Some(kind) = service.kind() else {
            debug!(service_id = service.id, service_type_id = service.service_type_id, "No probe for service kind; skipping.");
            return None;
        };

        let outcome = match self.context.prober.probe(kind, &service.host_url).await {
            Ok(outcome) => outcome,
            Err(e) => probe_error_outcome(service, e),
        };
        let checked_at = Utc::now();

        if let (Some(indexer), Some(timings)) = (&self.context.indexer, &outcome.timings) {
            let breakdown = TimingBreakdown::new(service, timings, checked_at);
            if let Err(e) = breakdown.archive(indexer.as_ref()).await {
                warn!(service_id = service.id, error = %e, "Failed to archive probe timings.");
            }
        }

        let result = ProbeResult {
            status: outcome.status,
            message: outcome.message,
        };
        let transition = transition(service.status, service.id, result);
        debug!(
            service_id = service.id,
            previous = %transition.previous,
            new_status = %transition.new_status,
            changed = transition.changed,
            "Check completed."
        );
        self.apply(service, &transition, checked_at).await;
        Some((transition, checked_at))
    }

    async fn apply(&self, service: &ServiceDescriptor, transition: &Transition, checked_at: DateTime<Utc>) {
        let ctx = &self.context;
        for effect in transition.side_effects(&ctx.alert_policy) {
            match effect {
                SideEffect::Persist => {
                    if let Err(e) = ctx
                        .repository
                        .update_service_status(service.id, transition.new_status, &transition.message, checked_at)
                        .await
                    {
                        error!(service_id = service.id, error = %e, "Failed to persist service status.");
                    }
                }
                SideEffect::LogEvent => {
                    let event = EventRecord {
                        service_id: service.id,
                        host_id: service.host_id,
                        event_type: transition.new_status,
                        service_name: service.service_name.clone(),
                        host_name: service.host_name.clone(),
                        message: transition.message.clone(),
                        created_at: checked_at,
                    };
                    if let Err(e) = ctx.repository.insert_event(&event).await {
                        error!(service_id = service.id, error = %e, "Failed to record event.");
                    }
                }
                SideEffect::PublishStatusChange => {
                    ctx.fanout.status_changed(service, transition, checked_at).await;
                }
                SideEffect::RefreshCounts => match ctx.repository.get_status_counts().await {
                    Ok(counts) => ctx.fanout.counts_changed(&counts).await,
                    Err(e) => {
                        warn!(error = %e, "Failed to refresh status counts.");
                    }
                },
                SideEffect::Alert(channel) => {
                    let alert = StatusAlert {
                        service_name: service.service_name.clone(),
                        host_name: service.host_name.clone(),
                        old_status: transition.previous.to_string(),
                        new_status: transition.new_status.to_string(),
                        message: transition.message.clone(),
                        checked_at: format_run_time(Some(checked_at.with_timezone(&ctx.timezone))),
                    };
                    ctx.alerts.dispatch_best_effort(channel, &alert).await;
                }
            }
        }
    }
}

fn probe_error_outcome(service: &ServiceDescriptor, err: ProbeError) -> ProbeOutcome {
    let message = match &err {
        ProbeError::CertificateUnavailable { host, reason } => {
            format!("could not retrieve certificate for {host}: {reason}")
        }
        other => other.to_string(),
    };
    warn!(service_id = service.id, target = %service.host_url, error = %err, "Probe failed.");
    ProbeOutcome::new(ServiceStatus::Problem, message)
}
