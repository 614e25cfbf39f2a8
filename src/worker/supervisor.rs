//! Worker pool supervisor.
//!
//! Spawns the fixed set of workers, runs one watcher task per slot, restarts
//! crashed workers in place with exponential backoff, and tears everything
//! down on shutdown.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::RestartPolicy;
use super::channel::DEFAULT_MAX_FRAME_BYTES;
use super::dispatch::Dispatcher;
use super::pool::{PoolStats, Shared, WorkerInfo};
use super::signals::TerminationReason;
use super::spawn::{WorkerCommand, kill_process_group, spawn_worker};
use crate::error::Result;

/// Default time a request waits for an idle worker.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for one request/response exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker processes to spawn.
    pub worker_count: usize,
    /// How each worker is launched.
    pub command: WorkerCommand,
    /// Restart backoff for crashed workers.
    pub restart: RestartPolicy,
    /// How long a request waits for an idle worker. Zero fails immediately.
    pub acquire_timeout: Duration,
    /// Deadline for one exchange; `None` waits forever.
    pub exchange_timeout: Option<Duration>,
    /// Largest accepted response line.
    pub max_frame_bytes: usize,
}

impl WorkerPoolConfig {
    /// Pool of `worker_count` workers running `command`, with default timeouts.
    pub fn new(worker_count: usize, command: WorkerCommand) -> Self {
        Self {
            worker_count,
            command,
            restart: RestartPolicy::default(),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            exchange_timeout: Some(DEFAULT_EXCHANGE_TIMEOUT),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Owner of the worker pool.
pub struct Supervisor {
    shared: Arc<Shared>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    acquire_timeout: Duration,
    exchange_timeout: Option<Duration>,
}

impl Supervisor {
    /// Spawn all workers and start watching them.
    ///
    /// Workers are spawned one after another. If any spawn fails, the ones
    /// already running are killed and reaped and the error is returned.
    #[instrument(level = "debug", skip(config), fields(workers = config.worker_count))]
    pub async fn start(config: WorkerPoolConfig) -> Result<Self> {
        let shared = Arc::new(Shared::new(
            config.worker_count,
            config.command,
            config.restart,
            config.max_frame_bytes,
        ));

        let mut spawned = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            match spawn_worker(id, &shared.command, shared.max_frame_bytes).await {
                Ok(worker) => spawned.push(worker),
                Err(e) => {
                    for mut worker in spawned {
                        kill_process_group(worker.pid, &mut worker.child);
                        let _ = worker.child.wait().await;
                    }
                    return Err(e);
                }
            }
        }

        let mut watchers = Vec::with_capacity(spawned.len());
        for (id, worker) in spawned.into_iter().enumerate() {
            let Some((kill, generation)) = shared.install(id, worker.pid, worker.channel, false)
            else {
                continue;
            };
            let incarnation = Incarnation {
                child: worker.child,
                pid: worker.pid,
                kill,
                generation,
            };
            watchers.push(tokio::spawn(watch(shared.clone(), id, incarnation)));
        }

        if config.worker_count == 0 {
            warn!("Worker pool is empty; every request will fail");
        }
        info!(
            workers = config.worker_count,
            runtime = %shared.command.runtime.display(),
            entry = %shared.command.entry_point.display(),
            "Worker pool started"
        );

        Ok(Self {
            shared,
            watchers: Mutex::new(watchers),
            acquire_timeout: config.acquire_timeout,
            exchange_timeout: config.exchange_timeout,
        })
    }

    /// A handle for submitting requests to the pool.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.shared.clone(),
            self.acquire_timeout,
            self.exchange_timeout,
        )
    }

    /// Snapshot of every slot.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.shared.workers()
    }

    /// Pool-wide counters.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Kill every worker and wait for all watchers to reap their processes.
    ///
    /// Requests in flight fail with a channel-closed error. Calling this more
    /// than once is harmless.
    pub async fn shutdown(&self) {
        let kills = self.begin_shutdown();
        debug!(live = kills.len(), "Stopping worker pool");

        let watchers = std::mem::take(
            &mut *self
                .watchers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in watchers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker watcher panicked");
            }
        }
        info!("Worker pool stopped");
    }

    /// Flip into shutdown state and trip every live worker's kill switch.
    fn begin_shutdown(&self) -> Vec<Arc<Notify>> {
        let kills: Vec<Arc<Notify>> = {
            let mut table = self.shared.lock();
            table.shutting_down = true;
            table.idle.clear();
            table
                .slots
                .iter()
                .filter(|slot| slot.pid.is_some())
                .map(|slot| slot.kill.clone())
                .collect()
        };
        self.shared.shutdown_tx.send_replace(true);
        for kill in &kills {
            kill.notify_one();
        }
        self.shared.available.notify_waiters();
        kills
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Watchers kill their process groups on their own; children also have
        // kill_on_drop set in case the runtime goes away first.
        self.begin_shutdown();
    }
}

/// A running process in a slot, as seen by its watcher.
struct Incarnation {
    child: Child,
    pid: u32,
    kill: Arc<Notify>,
    generation: u64,
}

/// Watch slot `id` until shutdown, restarting its worker whenever it exits.
#[instrument(level = "debug", skip(shared, current), fields(worker = id))]
async fn watch(shared: Arc<Shared>, id: usize, mut current: Incarnation) {
    let policy = shared.policy.clone();
    let mut attempt: u32 = 0;

    loop {
        let status = tokio::select! {
            status = current.child.wait() => status,
            _ = current.kill.notified() => {
                kill_process_group(current.pid, &mut current.child);
                current.child.wait().await
            }
        };
        let reason = status
            .map(TerminationReason::from)
            .unwrap_or(TerminationReason::Unknown);
        let uptime = shared.mark_exited(id, current.generation);

        if shared.is_shutting_down() {
            debug!(pid = current.pid, %reason, "Worker stopped");
            return;
        }
        if policy.is_stable(uptime) {
            attempt = 0;
        }
        if reason.is_success() {
            info!(pid = current.pid, ?uptime, "Worker exited cleanly");
        } else {
            warn!(pid = current.pid, %reason, ?uptime, "Worker exited");
        }

        current = loop {
            attempt += 1;
            if !policy.allows(attempt) {
                shared.mark_failed(id);
                error!(
                    attempts = attempt - 1,
                    "Worker failed permanently: restart attempts exhausted"
                );
                return;
            }

            let delay = policy.delay_for_attempt(attempt);
            debug!(attempt, ?delay, "Restarting worker after backoff");
            if !sleep_unless_shutdown(&shared, delay).await {
                return;
            }

            shared.mark_starting(id);
            let mut worker = match spawn_worker(id, &shared.command, shared.max_frame_bytes).await
            {
                Ok(worker) => worker,
                Err(e) => {
                    warn!(attempt, error = %e, "Worker restart failed");
                    shared.mark_spawn_failed(id);
                    continue;
                }
            };

            match shared.install(id, worker.pid, worker.channel, true) {
                Some((kill, generation)) => {
                    info!(pid = worker.pid, attempt, "Worker restarted");
                    break Incarnation {
                        child: worker.child,
                        pid: worker.pid,
                        kill,
                        generation,
                    };
                }
                None => {
                    kill_process_group(worker.pid, &mut worker.child);
                    let _ = worker.child.wait().await;
                    return;
                }
            }
        };
    }
}

/// Sleep for `delay`. Returns `false` if shutdown began first.
async fn sleep_unless_shutdown(shared: &Shared, delay: Duration) -> bool {
    let mut rx = shared.shutdown_tx.subscribe();
    let stopping = async move {
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    };
    tokio::select! {
        _ = tokio::time::sleep(delay) => !shared.is_shutting_down(),
        _ = stopping => false,
    }
}
