use std::sync::Arc;

use chrono::FixedOffset;

use super::probes::ServiceProber;
use super::transition::AlertPolicy;
use crate::archive::DocumentIndexer;
use crate::db::MonitorRepository;
use crate::notifications::fanout::NotificationFanout;
use crate::notifications::publisher::EventPublisher;
use crate::notifications::service::AlertService;

/// Everything a check needs, built once at startup and shared by `Arc`.
pub struct MonitorContext {
    pub repository: Arc<dyn MonitorRepository>,
    pub prober: Arc<dyn ServiceProber>,
    pub fanout: NotificationFanout,
    pub alerts: AlertService,
    pub alert_policy: AlertPolicy,
    pub indexer: Option<Arc<dyn DocumentIndexer>>,
    pub timezone: FixedOffset,
    pub monitoring_live: bool,
}

impl MonitorContext {
    pub fn new(
        repository: Arc<dyn MonitorRepository>,
        prober: Arc<dyn ServiceProber>,
        publisher: Arc<dyn EventPublisher>,
        alerts: AlertService,
        timezone: FixedOffset,
    ) -> Self {
        Self {
            repository,
            prober,
            fanout: NotificationFanout::new(publisher, timezone),
            alerts,
            alert_policy: AlertPolicy::default(),
            indexer: None,
            timezone,
            monitoring_live: true,
        }
    }

    pub fn with_alert_policy(mut self, policy: AlertPolicy) -> Self {
        self.alert_policy = policy;
        self
    }

    pub fn with_indexer(mut self, indexer: Option<Arc<dyn DocumentIndexer>>) -> Self {
        self.indexer = indexer;
        self
    }

    pub fn with_monitoring_live(mut self, live: bool) -> Self {
        self.monitoring_live = live;
        self
    }
}
