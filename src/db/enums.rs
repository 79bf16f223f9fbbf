use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unrecognised {kind} value: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Health of a monitored service. Every service starts out `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Pending,
    Healthy,
    Warning,
    Problem,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Pending => "pending",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Warning => "warning",
            ServiceStatus::Problem => "problem",
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ServiceStatus::Pending),
            "healthy" => Ok(ServiceStatus::Healthy),
            "warning" => Ok(ServiceStatus::Warning),
            "problem" => Ok(ServiceStatus::Problem),
            _ => Err(ParseEnumError::new("service status", s)),
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The protocol a service is probed with.
///
/// Stored in the `services` table as small integer ids; ids outside this set
/// have no probe and are treated as unknown by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Http,
    Https,
    TlsCertificate,
}

impl ServiceKind {
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(ServiceKind::Http),
            2 => Some(ServiceKind::Https),
            3 => Some(ServiceKind::TlsCertificate),
            _ => None,
        }
    }

    pub fn id(&self) -> i32 {
        match self {
            ServiceKind::Http => 1,
            ServiceKind::Https => 2,
            ServiceKind::TlsCertificate => 3,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            ServiceKind::Http => "http",
            ServiceKind::Https | ServiceKind::TlsCertificate => "https",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntervalUnit {
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "m")]
    Minutes,
    #[serde(rename = "h")]
    Hours,
    #[serde(rename = "d")]
    Days,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Seconds => "s",
            IntervalUnit::Minutes => "m",
            IntervalUnit::Hours => "h",
            IntervalUnit::Days => "d",
        }
    }
}

impl FromStr for IntervalUnit {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s" => Ok(IntervalUnit::Seconds),
            "m" => Ok(IntervalUnit::Minutes),
            "h" => Ok(IntervalUnit::Hours),
            "d" => Ok(IntervalUnit::Days),
            _ => Err(ParseEnumError::new("interval unit", s)),
        }
    }
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
