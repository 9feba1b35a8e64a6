//! Per-subscription workers running sync cycles on a jittered interval.
//!
//! Each subscription gets one task. A worker sleeps for the interval plus a
//! random jitter, or until triggered, then runs a cycle. A trigger that
//! arrives while a cycle is running is remembered once, so any number of them
//! cause a single follow-up cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use permsync_shared::constants::{DEFAULT_SYNC_INTERVAL_SECS, DEFAULT_SYNC_JITTER_SECS};
use permsync_shared::SubscriptionId;

use crate::cycle::{CycleState, SyncEngine};
use crate::error::CycleError;
use crate::merge::RemovalReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub interval: Duration,
    /// Upper bound of the random delay added to each interval.
    pub jitter: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            jitter: Duration::from_secs(DEFAULT_SYNC_JITTER_SECS),
        }
    }
}

impl ScheduleConfig {
    fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.interval;
        }
        self.interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

struct Worker {
    /// Tells this worker apart from a later one started for the same id.
    serial: u64,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    state: watch::Receiver<CycleState>,
    handle: JoinHandle<()>,
}

type Workers = Arc<Mutex<HashMap<SubscriptionId, Worker>>>;

fn lock_workers(workers: &Workers) -> MutexGuard<'_, HashMap<SubscriptionId, Worker>> {
    workers.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    config: ScheduleConfig,
    workers: Workers,
    next_serial: AtomicU64,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, config: ScheduleConfig) -> Self {
        Self {
            engine,
            config,
            workers: Arc::new(Mutex::new(HashMap::new())),
            next_serial: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Start a worker for every stored subscription. Subscriptions not
    /// fetched within the last interval run right away.
    pub fn bootstrap(&self) -> Result<usize, CycleError> {
        let subs = self
            .engine
            .db()
            .lock()
            .map_err(|_| CycleError::Poisoned)?
            .list_subscriptions(None)?;

        let interval = chrono::Duration::from_std(self.config.interval)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let now = Utc::now();
        for sub in &subs {
            let due = sub.last_fetched_at.map_or(true, |at| now - at >= interval);
            self.start(sub.id, due);
        }

        info!(count = subs.len(), "Subscription workers started");
        Ok(subs.len())
    }

    /// Spawn the worker for `id` if it is not running. With `run_now` the
    /// first cycle starts immediately instead of after one interval.
    pub fn start(&self, id: SubscriptionId, run_now: bool) {
        let mut workers = self.workers();
        if let Some(worker) = workers.get(&id) {
            if run_now {
                worker.trigger.notify_one();
            }
            return;
        }

        let trigger = Arc::new(Notify::new());
        if run_now {
            trigger.notify_one();
        }
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(CycleState::Idle);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        // The worker deregisters itself on exit, which needs the map lock
        // held here, so it cannot run ahead of the insert below.
        let handle = tokio::spawn(run_worker(
            self.engine.clone(),
            id,
            self.config,
            trigger.clone(),
            cancel.clone(),
            state_tx,
            Deregister {
                workers: self.workers.clone(),
                serial,
            },
        ));

        workers.insert(
            id,
            Worker {
                serial,
                trigger,
                cancel,
                state: state_rx,
                handle,
            },
        );
    }

    /// Ask for a cycle as soon as possible. Returns `false` if `id` has no
    /// worker.
    pub fn trigger(&self, id: SubscriptionId) -> bool {
        match self.workers().get(&id) {
            Some(worker) => {
                worker.trigger.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn state(&self, id: SubscriptionId) -> Option<CycleState> {
        self.workers().get(&id).map(|w| *w.state.borrow())
    }

    /// Cancel `id`'s worker. An in-flight cycle is discarded at its next
    /// phase boundary.
    pub fn stop(&self, id: SubscriptionId) -> bool {
        match self.workers().remove(&id) {
            Some(worker) => {
                worker.cancel.cancel();
                debug!(subscription = %id, "Worker cancelled");
                true
            }
            None => false,
        }
    }

    /// Stop `id`'s worker, then delete the subscription.
    pub async fn remove(
        &self,
        id: SubscriptionId,
        remove_children: bool,
    ) -> Result<RemovalReport, CycleError> {
        self.stop(id);
        self.engine.remove(id, remove_children).await
    }

    /// Cancel every worker and wait for them to exit.
    pub async fn shutdown(&self) {
        let workers: Vec<Worker> = self.workers().drain().map(|(_, w)| w).collect();
        for worker in &workers {
            worker.cancel.cancel();
        }
        for worker in workers {
            let _ = worker.handle.await;
        }
        info!("Subscription workers stopped");
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Worker>> {
        lock_workers(&self.workers)
    }
}

/// Removes an exited worker's entry, unless it was already replaced.
struct Deregister {
    workers: Workers,
    serial: u64,
}

impl Deregister {
    fn run(self, id: SubscriptionId) {
        let mut workers = lock_workers(&self.workers);
        if workers.get(&id).is_some_and(|w| w.serial == self.serial) {
            workers.remove(&id);
        }
    }
}

async fn run_worker(
    engine: Arc<SyncEngine>,
    id: SubscriptionId,
    config: ScheduleConfig,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    state: watch::Sender<CycleState>,
    deregister: Deregister,
) {
    debug!(subscription = %id, "Worker started");

    loop {
        let delay = config.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = trigger.notified() => debug!(subscription = %id, "Sync triggered"),
            _ = tokio::time::sleep(delay) => {}
        }

        match engine.run_cycle(id, &cancel, &state).await {
            Err(CycleError::SubscriptionGone(_)) => {
                info!(subscription = %id, "Subscription gone, worker exiting");
                break;
            }
            Err(CycleError::Cancelled) => break,
            _ => {}
        }
    }

    deregister.run(id);
    debug!(subscription = %id, "Worker stopped");
}
