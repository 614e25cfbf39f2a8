//! Request dispatch onto idle workers.
//!
//! A request claims the worker at the front of the idle queue, takes its
//! channel for the duration of one exchange, and hands it back afterwards.
//! Because the channel is moved out of the pool while in use, a second
//! request can never write to the same worker mid-turn.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{trace, warn};

use super::channel::WorkerChannel;
use super::pool::{Claim, Shared};
use super::protocol::{RequestEnvelope, ResponseEnvelope};
use crate::error::{Result, TuskError};

/// Cheap, cloneable handle for sending requests to the pool.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    acquire_timeout: Duration,
    exchange_timeout: Option<Duration>,
}

impl Dispatcher {
    pub(crate) fn new(
        shared: Arc<Shared>,
        acquire_timeout: Duration,
        exchange_timeout: Option<Duration>,
    ) -> Self {
        Self {
            shared,
            acquire_timeout,
            exchange_timeout,
        }
    }

    /// Run one request on an idle worker and return its response.
    ///
    /// Fails immediately with [`TuskError::NoWorkers`] when no worker is Idle or
    /// Busy, and with [`TuskError::PoolSaturated`] when none frees up within the
    /// acquire timeout. A failed exchange retires the worker; the supervisor
    /// replaces it.
    pub async fn handle_request(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope> {
        let mut lease = self.acquire().await?;
        trace!(worker = lease.id, method = %request.method, url = %request.url, "Dispatching");

        let result = match self.exchange_timeout {
            Some(after) => tokio::time::timeout(after, lease.exchange(request))
                .await
                .unwrap_or_else(|_| Err(TuskError::Timeout { id: lease.id, after })),
            None => lease.exchange(request).await,
        };

        match result {
            Ok(response) => {
                lease.release();
                Ok(response)
            }
            Err(e) if e.is_worker_fatal() => {
                warn!(worker = lease.id, error = %e, "Exchange failed, retiring worker");
                lease.retire();
                Err(e)
            }
            Err(e) => {
                lease.release();
                Err(e)
            }
        }
    }

    /// Wait for an idle worker, up to the acquire timeout.
    async fn acquire(&self) -> Result<WorkerLease> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            // Register interest before looking, so a release between the check
            // and the wait is not missed.
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.shared.try_claim() {
                Claim::Leased {
                    id,
                    generation,
                    kill,
                    channel,
                } => {
                    return Ok(WorkerLease {
                        shared: self.shared.clone(),
                        id,
                        generation,
                        kill,
                        channel: Some(channel),
                    });
                }
                Claim::Empty => return Err(TuskError::NoWorkers),
                Claim::ShuttingDown => return Err(TuskError::ShuttingDown),
                Claim::Wait => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TuskError::PoolSaturated(self.acquire_timeout));
            }
        }
    }
}

/// Exclusive claim on one Busy worker.
///
/// Dropping a lease that still holds its channel (for example when the request
/// task is cancelled mid-exchange) retires the worker, since the stream may be
/// left halfway through a frame.
struct WorkerLease {
    shared: Arc<Shared>,
    id: usize,
    generation: u64,
    kill: Arc<Notify>,
    channel: Option<WorkerChannel>,
}

impl WorkerLease {
    async fn exchange(&mut self, request: &RequestEnvelope) -> Result<ResponseEnvelope> {
        let channel = self
            .channel
            .as_mut()
            .ok_or(TuskError::ChannelClosed { id: self.id })?;
        channel.exchange(request).await
    }

    fn release(mut self) {
        if let Some(channel) = self.channel.take() {
            self.shared.release(self.id, self.generation, channel);
        }
    }

    fn retire(mut self) {
        self.channel = None;
        self.shared.retire(self.id, self.generation, &self.kill);
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.channel.take().is_some() {
            self.shared.retire(self.id, self.generation, &self.kill);
        }
    }
}
