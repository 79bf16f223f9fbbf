//! Best-effort dashboard events. Publish failures are logged and swallowed;
//! they never fail a check.
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use tracing::warn;

use super::publisher::{
    EventPublisher, Payload, EVENT_APP_STARTING, EVENT_APP_STOPPING, EVENT_COUNT_CHANGED,
    EVENT_NEXT_RUN, EVENT_SCHEDULE_CHANGED, EVENT_SCHEDULE_ITEM_REMOVED, EVENT_STATUS_CHANGED,
    PUBLIC_CHANNEL,
};
use crate::db::models::{ServiceDescriptor, StatusCounts};
use crate::monitoring::supervisor::ScheduleEntryView;
use crate::monitoring::transition::Transition;

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const PENDING_TIME: &str = "Pending...";

pub fn format_run_time(time: Option<DateTime<FixedOffset>>) -> String {
    time.map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| PENDING_TIME.to_string())
}

fn payload<const N: usize>(pairs: [(&str, String); N]) -> Payload {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

#[derive(Clone)]
pub struct NotificationFanout {
    publisher: Arc<dyn EventPublisher>,
    timezone: FixedOffset,
}

impl NotificationFanout {
    pub fn new(publisher: Arc<dyn EventPublisher>, timezone: FixedOffset) -> Self {
        Self { publisher, timezone }
    }

    async fn publish(&self, event: &str, payload: Payload) {
        if let Err(e) = self.publisher.publish(PUBLIC_CHANNEL, event, payload).await {
            warn!(event, error = %e, "Failed to publish event.");
        }
    }

    pub async fn status_changed(
        &self,
        service: &ServiceDescriptor,
        transition: &Transition,
        checked_at: DateTime<Utc>,
    ) {
        let status = transition.new_status.as_str();
        let data = payload([
            ("host_id", service.host_id.to_string()),
            ("host_service_id", service.id.to_string()),
            ("service_name", service.service_name.clone()),
            ("host_name", service.host_name.clone()),
            ("icon", service.icon.clone()),
            ("old_status", transition.previous.as_str().to_string()),
            ("status", status.to_string()),
            ("message", format!("{} is {}", service.service_name, status)),
            (
                "last_check",
                format_run_time(Some(checked_at.with_timezone(&self.timezone))),
            ),
        ]);
        self.publish(EVENT_STATUS_CHANGED, data).await;
    }

    pub async fn counts_changed(&self, counts: &StatusCounts) {
        let data = payload([
            ("pending_count", counts.pending.to_string()),
            ("healthy_count", counts.healthy.to_string()),
            ("warning_count", counts.warning.to_string()),
            ("problem_count", counts.problem.to_string()),
        ]);
        self.publish(EVENT_COUNT_CHANGED, data).await;
    }

    pub async fn schedule_changed(&self, view: &ScheduleEntryView, message: &str) {
        self.publish(EVENT_SCHEDULE_CHANGED, schedule_payload(view, message))
            .await;
    }

    /// Startup announcement: `next-run-event` followed by `schedule-changed-event`.
    pub async fn next_run(&self, view: &ScheduleEntryView, message: &str) {
        self.publish(EVENT_NEXT_RUN, schedule_payload(view, message)).await;
        self.schedule_changed(view, message).await;
    }

    pub async fn schedule_item_removed(&self, service_id: i32) {
        self.publish(
            EVENT_SCHEDULE_ITEM_REMOVED,
            payload([("host_service_id", service_id.to_string())]),
        )
        .await;
    }

    pub async fn app_starting(&self) {
        self.publish(EVENT_APP_STARTING, payload([("message", "Monitoring started".to_string())]))
            .await;
    }

    pub async fn app_stopping(&self) {
        self.publish(EVENT_APP_STOPPING, payload([("message", "Monitoring stopped".to_string())]))
            .await;
    }
}

fn schedule_payload(view: &ScheduleEntryView, message: &str) -> Payload {
    payload([
        ("host_service_id", view.service_id.to_string()),
        ("message", message.to_string()),
        ("next_run", format_run_time(view.next_run)),
        ("last_run", format_run_time(view.last_run)),
        ("host", view.host_name.clone()),
        ("service", view.service_name.clone()),
        ("schedule", view.schedule_text.clone()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::enums::{IntervalUnit, ServiceStatus};
    use crate::db::models::IntervalSpec;
    use crate::test_support::RecordingPublisher;
    use chrono::TimeZone;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn view() -> ScheduleEntryView {
        ScheduleEntryView {
            service_id: 12,
            host_name: "web-1".to_string(),
            service_name: "HTTPS".to_string(),
            next_run: None,
            last_run: Some(utc().with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap()),
            schedule_text: "@every 3m".to_string(),
        }
    }

    #[test]
    fn test_format_run_time_pending() {
        assert_eq!(format_run_time(None), "Pending...");
        let t = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 2, 3, 4, 5)
            .unwrap();
        assert_eq!(format_run_time(Some(t)), "2024-01-02 03:04:05");
    }

    #[tokio::test]
    async fn test_schedule_changed_payload() {
        let publisher = Arc::new(RecordingPublisher::default());
        let fanout = NotificationFanout::new(publisher.clone(), utc());
        fanout.schedule_changed(&view(), "Monitoring HTTPS").await;

        let events = publisher.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.channel, PUBLIC_CHANNEL);
        assert_eq!(event.event, EVENT_SCHEDULE_CHANGED);
        assert_eq!(event.payload["host_service_id"], "12");
        assert_eq!(event.payload["next_run"], "Pending...");
        assert_eq!(event.payload["last_run"], "2024-03-01 08:30:00");
        assert_eq!(event.payload["schedule"], "@every 3m");
    }

    #[tokio::test]
    async fn test_next_run_emits_both_events() {
        let publisher = Arc::new(RecordingPublisher::default());
        let fanout = NotificationFanout::new(publisher.clone(), utc());
        fanout.next_run(&view(), "Monitoring HTTPS").await;

        let names: Vec<String> = publisher.events().into_iter().map(|e| e.event).collect();
        assert_eq!(names, vec![EVENT_NEXT_RUN, EVENT_SCHEDULE_CHANGED]);
    }

    #[tokio::test]
    async fn test_status_changed_payload() {
        let publisher = Arc::new(RecordingPublisher::default());
        let fanout = NotificationFanout::new(publisher.clone(), FixedOffset::east_opt(3600).unwrap());
        let service = ServiceDescriptor {
            id: 5,
            host_id: 2,
            host_name: "db-1".to_string(),
            host_url: "http://db-1".to_string(),
            service_type_id: 1,
            service_name: "HTTP".to_string(),
            icon: "fas fa-server".to_string(),
            active: true,
            schedule: IntervalSpec::new(1, IntervalUnit::Minutes),
            status: ServiceStatus::Healthy,
            last_message: String::new(),
            last_check: None,
        };
        let transition = Transition {
            service_id: 5,
            previous: ServiceStatus::Healthy,
            new_status: ServiceStatus::Problem,
            message: "500 Internal Server Error".to_string(),
            changed: true,
            notify_worthy: true,
        };
        let checked_at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        fanout.status_changed(&service, &transition, checked_at).await;

        let event = &publisher.named(EVENT_STATUS_CHANGED)[0];
        assert_eq!(event.payload["old_status"], "healthy");
        assert_eq!(event.payload["status"], "problem");
        assert_eq!(event.payload["message"], "HTTP is problem");
        assert_eq!(event.payload["last_check"], "2024-06-01 13:00:00");
    }

    #[tokio::test]
    async fn test_publish_failures_are_swallowed() {
        let publisher = Arc::new(RecordingPublisher::failing());
        let fanout = NotificationFanout::new(publisher.clone(), utc());
        fanout.app_starting().await;
        fanout.counts_changed(&StatusCounts::default()).await;
        assert!(publisher.events().is_empty());
    }
}
