//! Time and background jobs
//!
//! Components read time through [`Clock`] so deadlines, expiries and retry
//! backoff can be driven deterministically in tests. Periodic work is
//! expressed as [`ScheduledJob`]s; the [`Scheduler`] runs each on its own
//! tokio interval in production, and `run_due` lets tests tick them by hand.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info};

use crate::SettlementResult;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = *now + by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Unit of periodic background work
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &'static str;

    /// One pass; returns how many items were acted on
    async fn run(&self) -> SettlementResult<usize>;
}

struct JobEntry {
    job: Arc<dyn ScheduledJob>,
    interval: Duration,
}

/// Runs registered jobs on fixed intervals until shut down
pub struct Scheduler {
    jobs: Vec<JobEntry>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            shutdown,
            handles: Vec::new(),
        }
    }

    pub fn register(&mut self, job: Arc<dyn ScheduledJob>, interval: Duration) {
        info!("Registering job {} every {:?}", job.name(), interval);
        self.jobs.push(JobEntry { job, interval });
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|e| e.job.name()).collect()
    }

    /// Run every job once, in registration order
    pub async fn run_due(&self) -> Vec<(&'static str, SettlementResult<usize>)> {
        let mut results = Vec::with_capacity(self.jobs.len());
        for entry in &self.jobs {
            results.push((entry.job.name(), entry.job.run().await));
        }
        results
    }

    /// Spawn one tokio task per job
    pub fn start(&mut self) {
        for entry in &self.jobs {
            let job = entry.job.clone();
            let mut ticker = tokio::time::interval(entry.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut shutdown = self.shutdown.subscribe();

            self.handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match job.run().await {
                                Ok(0) => {}
                                Ok(n) => debug!("Job {} handled {} items", job.name(), n),
                                Err(e) => error!("Job {} failed: {}", job.name(), e),
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("Job {} stopped", job.name());
            }));
        }
        info!("Scheduler started with {} jobs", self.handles.len());
    }

    /// Signal every job loop to stop and wait for them
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("Scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
