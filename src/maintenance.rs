//! Scheduled maintenance trigger.
//!
//! Fires the data refresh and stale-file cleanup jobs on their cron cadence and
//! hands them to the worker queue. No business logic lives here.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Sundays, Wednesdays and Saturdays at 02:00 (every third weekday counting
/// from Sunday), so the cadence does not depend on month length.
pub const REFRESH_CRON: &str = "0 0 2 * * Sun,Wed,Sat *";
/// Sundays at 03:00.
pub const CLEANUP_CRON: &str = "0 0 3 * * Sun *";

pub const REFRESH_JOB: &str = "update-parsed-data-every-3-days";
pub const CLEANUP_JOB: &str = "cleanup-old-files-weekly";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceJobSpec {
    pub name: String,
    /// 7-field cron: sec min hour day month dow year.
    pub cadence: String,
    pub task: String,
}

/// The two jobs this service schedules, with optional cadence overrides.
pub fn job_table(refresh_cron: Option<&str>, cleanup_cron: Option<&str>) -> Vec<MaintenanceJobSpec> {
    vec![
        MaintenanceJobSpec {
            name: REFRESH_JOB.to_string(),
            cadence: refresh_cron.unwrap_or(REFRESH_CRON).to_string(),
            task: "multiparser.update_parsed_data_periodic".to_string(),
        },
        MaintenanceJobSpec {
            name: CLEANUP_JOB.to_string(),
            cadence: cleanup_cron.unwrap_or(CLEANUP_CRON).to_string(),
            task: "multiparser.cleanup_old_files".to_string(),
        },
    ]
}

/// What lands on the work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceJob {
    pub name: String,
    pub task: String,
    /// The fire time this submission stands for.
    pub scheduled_for: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    Full,
    Closed,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Full => write!(f, "job queue is full"),
            QueueError::Closed => write!(f, "job queue is closed"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Accepts job submissions without blocking the caller.
pub trait JobQueue: Send + Sync {
    fn submit(&self, job: MaintenanceJob) -> Result<(), QueueError>;
}

/// Bounded channel to the worker pool.
pub struct ChannelQueue {
    tx: mpsc::Sender<MaintenanceJob>,
}

impl ChannelQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MaintenanceJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl JobQueue for ChannelQueue {
    fn submit(&self, job: MaintenanceJob) -> Result<(), QueueError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct Entry {
    spec: MaintenanceJobSpec,
    schedule: Schedule,
    next_due: Option<DateTime<Utc>>,
}

/// Evaluates the job table against a clock.
///
/// Each job fires at most once per tick. After firing, the next due time is
/// the first occurrence after *now*, so occurrences missed while the process
/// was down or stalled are dropped rather than replayed.
pub struct MaintenanceTrigger<Q: JobQueue> {
    entries: Vec<Entry>,
    queue: Q,
    tz: Tz,
}

impl<Q: JobQueue> MaintenanceTrigger<Q> {
    pub fn new(
        specs: Vec<MaintenanceJobSpec>,
        queue: Q,
        tz: Tz,
        start: DateTime<Utc>,
    ) -> Result<Self, cron::error::Error> {
        let entries = specs
            .into_iter()
            .map(|spec| -> Result<Entry, cron::error::Error> {
                let schedule = Schedule::from_str(&spec.cadence)?;
                let next_due = next_after(&schedule, tz, start);
                Ok(Entry { spec, schedule, next_due })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries, queue, tz })
    }

    pub fn from_config(config: &Config, queue: Q, start: DateTime<Utc>) -> Result<Self, cron::error::Error> {
        let specs = job_table(config.refresh_cron.as_deref(), config.cleanup_cron.as_deref());
        Self::new(specs, queue, config.timezone, start)
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn next_due(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|e| e.spec.name == name)
            .and_then(|e| e.next_due)
    }

    /// Submit every job whose due time has passed. Returns how many were
    /// accepted by the queue.
    pub fn tick(&mut self, now: DateTime<Utc>) -> usize {
        let mut submitted = 0;
        for entry in &mut self.entries {
            let Some(due) = entry.next_due else { continue };
            if due > now {
                continue;
            }

            let job = MaintenanceJob {
                name: entry.spec.name.clone(),
                task: entry.spec.task.clone(),
                scheduled_for: due,
            };
            match self.queue.submit(job) {
                Ok(()) => {
                    info!("⏰ Enqueued {} ({}) due {}", entry.spec.name, entry.spec.task, due);
                    submitted += 1;
                }
                Err(e) => warn!("Failed to enqueue {}: {e}", entry.spec.name),
            }

            entry.next_due = next_after(&entry.schedule, self.tz, now);
            if let Some(next) = entry.next_due {
                debug!("{} next due {}", entry.spec.name, next);
            }
        }
        submitted
    }

    /// Tick every `period` on a background task until the handle is aborted.
    pub fn spawn<C>(mut self, clock: C, period: Duration) -> JoinHandle<()>
    where
        C: Clock + 'static,
        Q: 'static,
    {
        for entry in &self.entries {
            match entry.next_due {
                Some(due) => info!("Scheduled {} ({}), first run {}", entry.spec.name, entry.spec.cadence, due),
                None => warn!("{} ({}) never fires", entry.spec.name, entry.spec.cadence),
            }
        }

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.tick(clock.now());
            }
        })
    }
}

fn next_after(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
}
