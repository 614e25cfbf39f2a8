//! Worker state table shared by the supervisor, its watchers and the dispatcher.
//!
//! All slot bookkeeping happens under one coarse `std::sync::Mutex`. The lock is
//! never held across an `.await`; callers copy out what they need, drop the
//! guard, then signal.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, watch};

use super::backoff::RestartPolicy;
use super::channel::WorkerChannel;
use super::spawn::WorkerCommand;

/// Lifecycle state of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Being spawned (initially or as a replacement).
    Starting,
    /// Waiting in the idle queue.
    Idle,
    /// Serving a request.
    Busy,
    /// Process has terminated or was retired; a replacement may follow.
    Exited,
    /// Restart attempts exhausted. Never dispatched to again.
    Failed,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Exited => "exited",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: usize,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
    pub restart_count: u64,
    pub exchanges: u64,
}

/// Pool-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub starting: usize,
    pub idle: usize,
    pub busy: usize,
    pub exited: usize,
    pub failed: usize,
    pub restarts: u64,
    pub exchanges: u64,
}

/// One entry of the pool, identified by its index.
///
/// `generation` increases with every successful spawn so that late updates from
/// a previous incarnation (a lease finishing after its worker died) are ignored.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) state: WorkerState,
    pub(crate) generation: u64,
    pub(crate) pid: Option<u32>,
    pub(crate) created_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    pub(crate) channel: Option<WorkerChannel>,
    /// Kill switch for the current incarnation, observed by its watcher.
    pub(crate) kill: Arc<Notify>,
    pub(crate) restarts: u64,
    pub(crate) exchanges: u64,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: WorkerState::Starting,
            generation: 0,
            pid: None,
            created_at: None,
            started: None,
            channel: None,
            kill: Arc::new(Notify::new()),
            restarts: 0,
            exchanges: 0,
        }
    }

    fn info(&self, id: usize) -> WorkerInfo {
        WorkerInfo {
            id,
            state: self.state,
            pid: self.pid,
            created_at: self.created_at,
            restart_count: self.restarts,
            exchanges: self.exchanges,
        }
    }
}

#[derive(Debug)]
pub(crate) struct PoolTable {
    pub(crate) slots: Vec<Slot>,
    /// FIFO of idle slot ids. May hold stale ids; claimers re-check the state.
    pub(crate) idle: VecDeque<usize>,
    pub(crate) shutting_down: bool,
}

/// Result of a non-blocking attempt to take an idle worker.
pub(crate) enum Claim {
    /// Worker `id` moved to Busy; its channel is handed over.
    Leased {
        id: usize,
        generation: u64,
        kill: Arc<Notify>,
        channel: WorkerChannel,
    },
    /// Nothing is Idle but some worker is Busy; waiting may help.
    Wait,
    /// No worker is Idle or Busy.
    Empty,
    ShuttingDown,
}

/// State shared between the supervisor, watchers and dispatchers.
#[derive(Debug)]
pub(crate) struct Shared {
    table: Mutex<PoolTable>,
    /// Woken whenever a worker may have become claimable (or the pool emptied).
    pub(crate) available: Notify,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) command: WorkerCommand,
    pub(crate) policy: RestartPolicy,
    pub(crate) max_frame_bytes: usize,
}

impl Shared {
    pub(crate) fn new(
        worker_count: usize,
        command: WorkerCommand,
        policy: RestartPolicy,
        max_frame_bytes: usize,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            table: Mutex::new(PoolTable {
                slots: (0..worker_count).map(|_| Slot::new()).collect(),
                idle: VecDeque::with_capacity(worker_count),
                shutting_down: false,
            }),
            available: Notify::new(),
            shutdown_tx,
            command,
            policy,
            max_frame_bytes,
        }
    }

    /// Lock the table. A panic while holding the lock cannot leave a slot
    /// half-updated in a way later readers rely on, so poisoning is ignored.
    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Put a freshly spawned worker into slot `id` as Idle.
    ///
    /// Returns the kill switch and generation for the new incarnation, or
    /// `None` (handing the channel back to be dropped) if the pool is shutting
    /// down.
    pub(crate) fn install(
        &self,
        id: usize,
        pid: u32,
        channel: WorkerChannel,
        is_restart: bool,
    ) -> Option<(Arc<Notify>, u64)> {
        let installed = {
            let mut table = self.lock();
            if table.shutting_down {
                None
            } else {
                let slot = &mut table.slots[id];
                slot.generation += 1;
                slot.state = WorkerState::Idle;
                slot.pid = Some(pid);
                slot.created_at = Some(Utc::now());
                slot.started = Some(Instant::now());
                slot.channel = Some(channel);
                slot.kill = Arc::new(Notify::new());
                if is_restart {
                    slot.restarts += 1;
                }
                let installed = (slot.kill.clone(), slot.generation);
                table.idle.retain(|&i| i != id);
                table.idle.push_back(id);
                Some(installed)
            }
        };
        if installed.is_some() {
            self.available.notify_waiters();
        }
        installed
    }

    /// Record that incarnation `generation` of slot `id` has been reaped.
    ///
    /// Returns how long it was up.
    pub(crate) fn mark_exited(&self, id: usize, generation: u64) -> Duration {
        let uptime = {
            let mut table = self.lock();
            let slot = &mut table.slots[id];
            if slot.generation != generation {
                return Duration::ZERO;
            }
            slot.state = WorkerState::Exited;
            slot.pid = None;
            slot.channel = None;
            let uptime = slot.started.take().map(|s| s.elapsed()).unwrap_or_default();
            table.idle.retain(|&i| i != id);
            uptime
        };
        self.available.notify_waiters();
        uptime
    }

    pub(crate) fn mark_starting(&self, id: usize) {
        self.lock().slots[id].state = WorkerState::Starting;
    }

    /// A restart attempt could not spawn a process; the slot stays down.
    pub(crate) fn mark_spawn_failed(&self, id: usize) {
        self.lock().slots[id].state = WorkerState::Exited;
    }

    pub(crate) fn mark_failed(&self, id: usize) {
        self.lock().slots[id].state = WorkerState::Failed;
        self.available.notify_waiters();
    }

    /// Try to take the worker at the front of the idle queue.
    pub(crate) fn try_claim(&self) -> Claim {
        let mut table = self.lock();
        if table.shutting_down {
            return Claim::ShuttingDown;
        }
        while let Some(id) = table.idle.pop_front() {
            let slot = &mut table.slots[id];
            if slot.state != WorkerState::Idle {
                continue;
            }
            let Some(channel) = slot.channel.take() else {
                continue;
            };
            slot.state = WorkerState::Busy;
            return Claim::Leased {
                id,
                generation: slot.generation,
                kill: slot.kill.clone(),
                channel,
            };
        }
        if table.slots.iter().any(|s| s.state == WorkerState::Busy) {
            Claim::Wait
        } else {
            Claim::Empty
        }
    }

    /// Return a worker after a successful exchange.
    ///
    /// If the incarnation changed meanwhile, or the pool is shutting down, the
    /// channel is dropped instead.
    pub(crate) fn release(&self, id: usize, generation: u64, channel: WorkerChannel) {
        {
            let mut table = self.lock();
            let shutting_down = table.shutting_down;
            let slot = &mut table.slots[id];
            if slot.generation != generation {
                return;
            }
            slot.exchanges += 1;
            if shutting_down || slot.state != WorkerState::Busy {
                return;
            }
            slot.state = WorkerState::Idle;
            slot.channel = Some(channel);
            table.idle.push_back(id);
        }
        self.available.notify_waiters();
    }

    /// Mark a worker dead after a failed or abandoned exchange and trip its kill switch.
    pub(crate) fn retire(&self, id: usize, generation: u64, kill: &Notify) {
        {
            let mut table = self.lock();
            let slot = &mut table.slots[id];
            if slot.generation == generation && slot.state == WorkerState::Busy {
                slot.state = WorkerState::Exited;
            }
        }
        kill.notify_one();
        self.available.notify_waiters();
    }

    pub(crate) fn workers(&self) -> Vec<WorkerInfo> {
        let table = self.lock();
        table
            .slots
            .iter()
            .enumerate()
            .map(|(id, slot)| slot.info(id))
            .collect()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let table = self.lock();
        let mut stats = PoolStats {
            total: table.slots.len(),
            ..Default::default()
        };
        for slot in &table.slots {
            match slot.state {
                WorkerState::Starting => stats.starting += 1,
                WorkerState::Idle => stats.idle += 1,
                WorkerState::Busy => stats.busy += 1,
                WorkerState::Exited => stats.exited += 1,
                WorkerState::Failed => stats.failed += 1,
            }
            stats.restarts += slot.restarts;
            stats.exchanges += slot.exchanges;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn shared(n: usize) -> Shared {
        Shared::new(
            n,
            WorkerCommand::new("/bin/sh", "worker.sh"),
            RestartPolicy::default(),
            1024,
        )
    }

    fn channel(id: usize) -> WorkerChannel {
        let (a, _) = duplex(64);
        let (_, b) = duplex(64);
        WorkerChannel::new(id, a, b, 1024)
    }

    #[test]
    fn test_new_pool_is_empty() {
        let shared = shared(3);
        let stats = shared.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.starting, 3);
        assert!(matches!(shared.try_claim(), Claim::Empty));
    }

    #[test]
    fn test_claim_is_fifo() {
        let shared = shared(3);
        for id in [2, 0, 1] {
            shared.install(id, 100 + id as u32, channel(id), false).unwrap();
        }
        let order: Vec<usize> = (0..3)
            .map(|_| match shared.try_claim() {
                Claim::Leased { id, .. } => id,
                _ => panic!("expected a lease"),
            })
            .collect();
        assert_eq!(order, [2, 0, 1]);
        assert!(matches!(shared.try_claim(), Claim::Wait));
    }

    #[test]
    fn test_release_requeues_at_back() {
        let shared = shared(2);
        shared.install(0, 10, channel(0), false).unwrap();
        shared.install(1, 11, channel(1), false).unwrap();

        let Claim::Leased {
            id,
            generation,
            channel,
            ..
        } = shared.try_claim()
        else {
            panic!("expected a lease");
        };
        assert_eq!(id, 0);
        shared.release(id, generation, channel);

        match shared.try_claim() {
            Claim::Leased { id, .. } => assert_eq!(id, 1),
            _ => panic!("expected a lease"),
        }
        let info = &shared.workers()[0];
        assert_eq!(info.state, WorkerState::Idle);
        assert_eq!(info.exchanges, 1);
    }

    #[test]
    fn test_stale_release_is_ignored() {
        let shared = shared(1);
        shared.install(0, 10, channel(0), false).unwrap();
        let Claim::Leased {
            generation,
            channel: old,
            ..
        } = shared.try_claim()
        else {
            panic!("expected a lease");
        };

        // Worker dies and is replaced while the lease is outstanding.
        shared.mark_exited(0, generation);
        shared.install(0, 11, channel(0), true).unwrap();
        shared.release(0, generation, old);

        let info = &shared.workers()[0];
        assert_eq!(info.pid, Some(11));
        assert_eq!(info.restart_count, 1);
        assert_eq!(info.exchanges, 0);
        assert!(matches!(shared.try_claim(), Claim::Leased { .. }));
        assert!(matches!(shared.try_claim(), Claim::Wait));
    }

    #[test]
    fn test_retire_marks_exited() {
        let shared = shared(1);
        shared.install(0, 10, channel(0), false).unwrap();
        let Claim::Leased {
            generation, kill, ..
        } = shared.try_claim()
        else {
            panic!("expected a lease");
        };
        shared.retire(0, generation, &kill);
        assert_eq!(shared.workers()[0].state, WorkerState::Exited);
        assert!(matches!(shared.try_claim(), Claim::Empty));
    }

    #[test]
    fn test_install_refused_during_shutdown() {
        let shared = shared(1);
        shared.lock().shutting_down = true;
        assert!(shared.install(0, 10, channel(0), false).is_none());
        assert!(matches!(shared.try_claim(), Claim::ShuttingDown));
    }

    #[test]
    fn test_failed_slot_counts() {
        let shared = shared(2);
        shared.install(0, 10, channel(0), false).unwrap();
        shared.mark_failed(1);
        let stats = shared.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_worker_info_serializes_camel_case() {
        let shared = shared(1);
        let json = serde_json::to_value(&shared.workers()[0]).unwrap();
        assert_eq!(json["state"], "starting");
        assert!(json.get("restartCount").is_some());
        assert!(json.get("createdAt").is_some());
    }
}
