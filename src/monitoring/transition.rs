//! Status transition rules.
//!
//! A transition is a pure decision: given what a service was and what a probe
//! just found, work out the new status and which side effects are owed. The
//! supervisor executes the effects.
use serde::Serialize;

use crate::db::enums::ServiceStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub status: ServiceStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub service_id: i32,
    pub previous: ServiceStatus,
    pub new_status: ServiceStatus,
    pub message: String,
    pub changed: bool,
    /// A change away from a settled status. Leaving `Pending` is only the
    /// service coming online and never raises an alert.
    pub notify_worthy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertChannel {
    Email,
    Sms,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertPolicy {
    pub email_enabled: bool,
    pub sms_enabled: bool,
}

impl AlertPolicy {
    pub fn enabled_channels(&self) -> impl Iterator<Item = AlertChannel> {
        [
            (self.email_enabled, AlertChannel::Email),
            (self.sms_enabled, AlertChannel::Sms),
        ]
        .into_iter()
        .filter_map(|(enabled, channel)| enabled.then_some(channel))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Store status, message and `last_check = now`.
    Persist,
    /// Append an event record.
    LogEvent,
    PublishStatusChange,
    /// Recompute aggregate counts and publish them.
    RefreshCounts,
    Alert(AlertChannel),
}

pub fn transition(previous: ServiceStatus, service_id: i32, result: ProbeResult) -> Transition {
    let changed = result.status != previous;
    Transition {
        service_id,
        previous,
        new_status: result.status,
        message: result.message,
        changed,
        notify_worthy: changed && previous != ServiceStatus::Pending,
    }
}

impl Transition {
    /// Effects in execution order. Persisting and logging happen on every
    /// probe; the rest only when the status changed.
    pub fn side_effects(&self, policy: &AlertPolicy) -> Vec<SideEffect> {
        let mut effects = vec![SideEffect::Persist, SideEffect::LogEvent];
        if self.changed {
            effects.push(SideEffect::PublishStatusChange);
            effects.push(SideEffect::RefreshCounts);
        }
        if self.notify_worthy {
            effects.extend(policy.enabled_channels().map(SideEffect::Alert));
        }
        effects
    }
}
