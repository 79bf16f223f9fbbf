pub mod context;
pub mod probes;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
pub mod transition;

pub use context::MonitorContext;
pub use supervisor::{ManualCheckResponse, MonitorError, MonitoringState, ScheduleEntryView, Supervisor};
