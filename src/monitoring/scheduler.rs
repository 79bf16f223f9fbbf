//! Interval scheduler for recurring checks.
//!
//! Each job gets its own ticker task. A tick spawns the job on a fresh task and
//! waits for it, so a job never overlaps itself; ticks that come due while it
//! is still running are skipped. Jobs for different services run in parallel.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type JobCallback = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Invalid schedule expression '{0}'")]
    InvalidExpression(String),
}

/// Opaque handle of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A parsed `@every <n><s|m|h>` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    period: Duration,
    expression: String,
}

impl Schedule {
    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl FromStr for Schedule {
    type Err = SchedulerError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let invalid = || SchedulerError::InvalidExpression(expr.to_string());
        let spec = expr.trim().strip_prefix("@every ").ok_or_else(invalid)?.trim();
        if spec.len() < 2 || !spec.is_char_boundary(spec.len() - 1) {
            return Err(invalid());
        }
        let (number, unit) = spec.split_at(spec.len() - 1);
        let number: u64 = number.parse().map_err(|_| invalid())?;
        if number == 0 {
            return Err(invalid());
        }
        let seconds = match unit {
            "s" => Some(number),
            "m" => number.checked_mul(60),
            "h" => number.checked_mul(60 * 60),
            _ => None,
        }
        .ok_or_else(invalid)?;

        // Periods must fit both the display clock and the tick clock.
        let period = Duration::from_secs(seconds);
        let step = chrono::Duration::from_std(period).map_err(|_| invalid())?;
        if Utc::now().checked_add_signed(step).is_none()
            || Instant::now().checked_add(period).is_none()
        {
            return Err(invalid());
        }

        Ok(Schedule {
            period,
            expression: expr.trim().to_string(),
        })
    }
}

/// Last and next run of a job, in the scheduler's display zone. `None` until
/// known.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryTimes {
    pub next: Option<DateTime<FixedOffset>>,
    pub prev: Option<DateTime<FixedOffset>>,
}

struct JobEntry {
    schedule: Schedule,
    callback: JobCallback,
    times: Arc<Mutex<EntryTimes>>,
    ticker: Option<JoinHandle<()>>,
}

impl JobEntry {
    fn cancel(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    running: bool,
    next_id: u64,
    jobs: HashMap<JobId, JobEntry>,
}

#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
    timezone: FixedOffset,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    pub fn new(timezone: FixedOffset) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState::default())),
            timezone,
        }
    }

    pub fn timezone(&self) -> FixedOffset {
        self.timezone
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn len(&self) -> usize {
        lock(&self.state).jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a recurring job. It starts ticking immediately if the scheduler is
    /// running, otherwise on the next `start()`.
    pub fn add_job(&self, expression: &str, callback: JobCallback) -> Result<JobId, SchedulerError> {
        let schedule: Schedule = expression.parse()?;
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = JobId(state.next_id);

        let mut entry = JobEntry {
            schedule,
            callback,
            times: Arc::new(Mutex::new(EntryTimes::default())),
            ticker: None,
        };
        if state.running {
            entry.ticker = Some(self.spawn_ticker(id, &entry));
        }
        debug!(job_id = %id, expression = %entry.schedule.expression(), "Job added.");
        state.jobs.insert(id, entry);
        Ok(id)
    }

    /// Removes a job so it never ticks again. A run already in progress is
    /// left to finish.
    pub fn remove_job(&self, id: JobId) -> bool {
        let removed = lock(&self.state).jobs.remove(&id);
        match removed {
            Some(mut entry) => {
                entry.cancel();
                debug!(job_id = %id, "Job removed.");
                true
            }
            None => false,
        }
    }

    pub fn entry(&self, id: JobId) -> Option<EntryTimes> {
        let state = lock(&self.state);
        state.jobs.get(&id).map(|entry| lock(&entry.times).clone())
    }

    pub fn start(&self) {
        let mut state = lock(&self.state);
        if state.running {
            return;
        }
        state.running = true;
        let ids: Vec<JobId> = state.jobs.keys().copied().collect();
        for id in ids {
            if let Some(entry) = state.jobs.get(&id) {
                let ticker = self.spawn_ticker(id, entry);
                if let Some(entry) = state.jobs.get_mut(&id) {
                    entry.ticker = Some(ticker);
                }
            }
        }
        info!(jobs = state.jobs.len(), "Scheduler started.");
    }

    /// Stops ticking and drops every job. In-flight runs are not interrupted.
    pub fn stop(&self) {
        let mut state = lock(&self.state);
        state.running = false;
        let removed = state.jobs.len();
        for (_, mut entry) in state.jobs.drain() {
            entry.cancel();
        }
        info!(removed_jobs = removed, "Scheduler stopped.");
    }

    fn spawn_ticker(&self, id: JobId, entry: &JobEntry) -> JoinHandle<()> {
        let period = entry.schedule.period();
        let callback = entry.callback.clone();
        let times = entry.times.clone();
        let timezone = self.timezone;
        let step = chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero());
        let next_after = move |from: DateTime<Utc>| {
            from.checked_add_signed(step)
                .map(|next| next.with_timezone(&timezone))
        };

        lock(&times).next = next_after(Utc::now());

        tokio::spawn(async move {
            let first = Instant::now().checked_add(period).unwrap_or_else(Instant::now);
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                {
                    let mut times = lock(&times);
                    times.prev = Some(now.with_timezone(&timezone));
                    times.next = next_after(now);
                }

                match tokio::spawn(callback()).await {
                    Ok(()) => {}
                    Err(e) if e.is_panic() => {
                        error!(job_id = %id, "Scheduled job panicked; the scheduler keeps running.");
                    }
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "Scheduled job was cancelled.");
                    }
                }
            }
        })
    }
}
