use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{IntervalUnit, ServiceKind, ServiceStatus};

/// How often a service is checked, as declared by the operator: `(number, unit)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSpec {
    pub number: u32,
    pub unit: IntervalUnit,
}

impl IntervalSpec {
    pub fn new(number: u32, unit: IntervalUnit) -> Self {
        Self { number, unit }
    }

    /// The schedule as the operator declared it, e.g. `@every 2d`.
    pub fn schedule_text(&self) -> String {
        format!("@every {}{}", self.number, self.unit)
    }

    /// The expression handed to the scheduler. Days are not understood by the
    /// scheduler, so `Nd` becomes `(N*24)h`.
    pub fn cron_expression(&self) -> String {
        match self.unit {
            IntervalUnit::Days => format!("@every {}h", self.number.saturating_mul(24)),
            unit => format!("@every {}{}", self.number, unit),
        }
    }
}

/// A host service as read from the repository, joined with its host and
/// service type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub id: i32,
    pub host_id: i32,
    pub host_name: String,
    pub host_url: String,
    /// Raw service type id from the `services` table.
    pub service_type_id: i32,
    pub service_name: String,
    pub icon: String,
    pub active: bool,
    pub schedule: IntervalSpec,
    pub status: ServiceStatus,
    pub last_message: String,
    pub last_check: Option<DateTime<Utc>>,
}

impl ServiceDescriptor {
    pub fn kind(&self) -> Option<ServiceKind> {
        ServiceKind::from_id(self.service_type_id)
    }
}

/// Append-only log line written after every completed probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub service_id: i32,
    pub host_id: i32,
    pub event_type: ServiceStatus,
    pub service_name: String,
    pub host_name: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub healthy: i64,
    pub warning: i64,
    pub problem: i64,
}

impl StatusCounts {
    pub fn record(&mut self, status: ServiceStatus) {
        match status {
            ServiceStatus::Pending => self.pending += 1,
            ServiceStatus::Healthy => self.healthy += 1,
            ServiceStatus::Warning => self.warning += 1,
            ServiceStatus::Problem => self.problem += 1,
        }
    }
}
