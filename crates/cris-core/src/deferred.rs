//! Background executor.
//!
//! Submissions are handed over a bounded channel to one draining task that
//! keeps them in a min-heap keyed by due time. Due commands run on their own
//! task (bounded by a semaphore) through the same [`CommandProcessor`] as
//! inline requests:
//! - a plain submission captures the caller's context, refreshes its
//!   identity through the [`IdentityProvider`] at dequeue time and runs the
//!   whole pipeline again
//! - an inline handoff resumes after an incoming phase that already passed
//!
//! The awaiting [`DeferredHandle`] receives the envelope exactly once;
//! listeners are notified after every completion.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::auth::IdentityProvider;
use crate::command::Command;
use crate::config::BackgroundConfig;
use crate::context::CallContext;
use crate::envelope::ExecutedCommand;
use crate::error::{CrisError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::processor::{CommandProcessor, IncomingValidation};

const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Notification sent after a background command completed.
#[derive(Debug, Clone)]
pub struct DeferredCommandExecuted {
    pub id: Uuid,
    pub command: Arc<Command>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub executed_at: DateTime<Utc>,
    pub success: bool,
    pub correlation_id: String,
}

/// Receives [`DeferredCommandExecuted`] notifications. Best effort: a
/// failing listener is logged and the others still run.
#[async_trait]
pub trait DeferredCommandListener: Send + Sync {
    async fn on_executed(&self, event: &DeferredCommandExecuted) -> anyhow::Result<()>;
}

struct DeferredRequest {
    id: Uuid,
    command: Arc<Command>,
    context: CallContext,
    execute_at: Option<DateTime<Utc>>,
    resume: Option<IncomingValidation>,
    reply: oneshot::Sender<ExecutedCommand>,
}

/// Cloneable entry point of the queue.
#[derive(Clone)]
pub struct BackgroundSubmitter {
    tx: mpsc::Sender<DeferredRequest>,
    capacity: usize,
}

impl std::fmt::Debug for BackgroundSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundSubmitter")
            .field("capacity", &self.capacity)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl BackgroundSubmitter {
    /// Queue `command` under the frozen `captured` context.
    ///
    /// The identity is re-validated and both validation phases run again at
    /// dequeue time. With `execute_at`, the command runs strictly after it.
    pub fn submit(
        &self,
        command: Arc<Command>,
        mut captured: CallContext,
        issuer: Option<String>,
        execute_at: Option<DateTime<Utc>>,
    ) -> Result<DeferredHandle> {
        if issuer.is_some() {
            captured.issuer = issuer;
        }
        self.enqueue(command, captured, execute_at, None)
    }

    /// Continue an inline run whose incoming phase passed.
    pub(crate) fn handoff(
        &self,
        command: Arc<Command>,
        context: CallContext,
        incoming: IncomingValidation,
    ) -> Result<DeferredHandle> {
        self.enqueue(command, context, None, Some(incoming))
    }

    fn enqueue(
        &self,
        command: Arc<Command>,
        context: CallContext,
        execute_at: Option<DateTime<Utc>>,
        resume: Option<IncomingValidation>,
    ) -> Result<DeferredHandle> {
        let id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        let name = command.name().to_string();
        let request = DeferredRequest {
            id,
            command,
            context,
            execute_at,
            resume,
            reply,
        };
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CrisError::QueueFull {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => CrisError::ExecutorStopped,
        })?;
        obs::emit_deferred_submitted(&name, &id, execute_at);
        Ok(DeferredHandle { id, rx })
    }
}

/// Awaitable result of a submission.
#[derive(Debug)]
pub struct DeferredHandle {
    id: Uuid,
    rx: oneshot::Receiver<ExecutedCommand>,
}

impl DeferredHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn executed_command(self) -> Result<ExecutedCommand> {
        self.rx.await.map_err(|_| CrisError::ExecutorStopped)
    }

    /// Wait until `cancelled` completes. Giving up does not retract the work.
    pub async fn wait_until<F>(self, cancelled: F) -> Result<ExecutedCommand>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            received = self.rx => received.map_err(|_| CrisError::ExecutorStopped),
            _ = cancelled => Err(CrisError::WaitCancelled),
        }
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<ExecutedCommand> {
        self.wait_until(tokio::time::sleep(timeout)).await
    }
}

struct Scheduled {
    due: Instant,
    seq: u64,
    request: DeferredRequest,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Owns the draining task.
pub struct BackgroundExecutor {
    submitter: BackgroundSubmitter,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl BackgroundExecutor {
    /// Spawn the draining task. Must be called inside a Tokio runtime.
    pub fn start(
        processor: Arc<CommandProcessor>,
        identity: Arc<dyn IdentityProvider>,
        config: &BackgroundConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let submitter = BackgroundSubmitter {
            tx,
            capacity: config.queue_capacity,
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            processor,
            identity,
            submitter: submitter.clone(),
            rx,
            shutdown: shutdown_rx,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            pending: BinaryHeap::new(),
            seq: 0,
            running: JoinSet::new(),
        };
        let worker = tokio::spawn(worker.run());
        Self {
            submitter,
            shutdown,
            worker,
        }
    }

    pub fn submitter(&self) -> &BackgroundSubmitter {
        &self.submitter
    }

    /// Stop accepting work, drop pending submissions and wait for running
    /// commands to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.worker.await {
            error!(error = %e, "background worker ended abnormally");
        }
    }
}

struct Worker {
    processor: Arc<CommandProcessor>,
    identity: Arc<dyn IdentityProvider>,
    submitter: BackgroundSubmitter,
    rx: mpsc::Receiver<DeferredRequest>,
    shutdown: watch::Receiver<bool>,
    permits: Arc<Semaphore>,
    pending: BinaryHeap<Reverse<Scheduled>>,
    seq: u64,
    running: JoinSet<()>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let next_due = self.pending.peek().map(|Reverse(s)| s.due);
            let sleep = tokio::time::sleep_until(next_due.unwrap_or_else(|| Instant::now() + IDLE_WAIT));
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                received = self.rx.recv() => match received {
                    Some(request) => self.schedule(request),
                    None => break,
                },
                _ = sleep, if next_due.is_some() => self.dispatch_due(),
                Some(joined) = self.running.join_next(), if !self.running.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "deferred command task failed");
                    }
                }
            }
        }

        self.rx.close();
        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "background executor stopped with pending commands");
        }
        self.pending.clear();
        while let Some(joined) = self.running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "deferred command task failed");
            }
        }
        debug!("background executor stopped");
    }

    fn schedule(&mut self, request: DeferredRequest) {
        let delay = request
            .execute_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        self.seq += 1;
        self.pending.push(Reverse(Scheduled {
            due: Instant::now() + delay,
            seq: self.seq,
            request,
        }));
    }

    fn dispatch_due(&mut self) {
        let now = Instant::now();
        while self.pending.peek().is_some_and(|Reverse(s)| s.due <= now) {
            let Some(Reverse(scheduled)) = self.pending.pop() else {
                break;
            };
            let task = DeferredTask {
                processor: Arc::clone(&self.processor),
                identity: Arc::clone(&self.identity),
                submitter: self.submitter.clone(),
                permits: Arc::clone(&self.permits),
                request: scheduled.request,
            };
            self.running.spawn(task.run());
        }
    }
}

struct DeferredTask {
    processor: Arc<CommandProcessor>,
    identity: Arc<dyn IdentityProvider>,
    submitter: BackgroundSubmitter,
    permits: Arc<Semaphore>,
    request: DeferredRequest,
}

impl DeferredTask {
    async fn run(self) {
        let Ok(_permit) = self.permits.acquire_owned().await else {
            return;
        };
        let DeferredRequest {
            id,
            command,
            mut context,
            execute_at,
            resume,
            reply,
        } = self.request;

        // Wall clock may lag the monotonic deadline slightly.
        if let Some(rest) = execute_at.and_then(|at| (at - Utc::now()).to_std().ok()) {
            tokio::time::sleep(rest).await;
        }

        let executed = match resume {
            Some(incoming) => {
                self.processor
                    .complete(command, &context, incoming, Some(&self.submitter), true)
                    .await
            }
            None => {
                context.auth = self.identity.revalidate(&context.auth).await;
                self.processor
                    .process(command, &context, Some(&self.submitter), true)
                    .await
            }
        };

        METRICS.inc_deferred_executed();
        let event = DeferredCommandExecuted {
            id,
            command: Arc::clone(&executed.command),
            scheduled_for: execute_at,
            executed_at: Utc::now(),
            success: executed.is_success(),
            correlation_id: executed.correlation_id.clone(),
        };
        obs::emit_deferred_completed(event.command.name(), &id, event.success);

        if reply.send(executed).is_err() {
            debug!(deferred_id = %id, "waiter gave up before completion");
        }
        for listener in self.processor.registry().listeners() {
            if let Err(e) = listener.on_executed(&event).await {
                warn!(deferred_id = %id, error = %e, "deferred listener failed");
            }
        }
    }
}
