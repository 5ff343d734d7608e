//! Background execution of deferred operations.
//!
//! A generic [`BackgroundWorker<R>`] drains tasks from an mpsc channel into a
//! [`BackgroundRunnable`], with a periodic tick and a graceful stop. The
//! [`OperationRunner`] runnable drives each [`OperationJob`] through the
//! operation lifecycle and sweeps overdue operations on every tick.
//!
//! Stopping never strands an operation: jobs still queued in the channel are
//! failed with `UNAVAILABLE`, running jobs are cancelled, and jobs that
//! ignore cancellation past the grace period are aborted and failed too.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use forrst_core::{ErrorCode, ErrorInfo, Operation, OperationId, OperationStatus};
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::config::DispatchConfig;
use super::operation::{
    update_operation, CancellationRegistry, JobContext, OperationJob, OperationRepository,
    ProgressReporter, UpdateError,
};

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Handles a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called on every tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Receives each task still queued when the worker stops, before
    /// [`shutdown`](Self::shutdown). Default drops it.
    async fn abandon(&mut self, _task: Self::Task) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Background task loop fed by a bounded mpsc channel.
///
/// The spawned loop:
/// 1. hands each received task to [`BackgroundRunnable::run`],
/// 2. calls [`BackgroundRunnable::on_tick`] at the configured interval,
/// 3. once stopped, closes the channel, hands every task left in it to
///    [`BackgroundRunnable::abandon`], then calls
///    [`BackgroundRunnable::shutdown`].
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Starts the loop with a channel of `capacity` pending tasks.
    #[must_use]
    pub fn start(mut runnable: R, tick_interval_ms: u64, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(capacity.max(1));
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut tick_interval =
                tokio::time::interval(Duration::from_millis(tick_interval_ms.max(1)));
            // The first tick completes immediately.
            tick_interval.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = tick_interval.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            rx.close();
            while let Ok(t) = rx.try_recv() {
                runnable.abandon(t).await;
            }
            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submits a task, waiting for channel space.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// A sender for producers that outlive this handle's borrow. `None` once
    /// stopped.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::Sender<R::Task>> {
        self.tx.clone()
    }

    /// Stops the loop and waits for [`BackgroundRunnable::shutdown`] to
    /// finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// OperationExecutor
// ---------------------------------------------------------------------------

/// Accepts deferred jobs on behalf of the execution engine.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Queues `job` without waiting for it to run.
    ///
    /// # Errors
    ///
    /// Fails when the executor is stopped or saturated; the engine then
    /// marks the operation failed.
    async fn submit(&self, job: OperationJob) -> anyhow::Result<()>;
}

/// [`OperationExecutor`] in front of a [`BackgroundWorker<OperationRunner>`].
///
/// Never waits for channel space: a full queue is reported immediately.
#[derive(Debug, Clone)]
pub struct WorkerExecutor {
    tx: mpsc::Sender<OperationJob>,
}

impl WorkerExecutor {
    #[must_use]
    pub fn new(tx: mpsc::Sender<OperationJob>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl OperationExecutor for WorkerExecutor {
    async fn submit(&self, job: OperationJob) -> anyhow::Result<()> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow::anyhow!("operation queue is full"),
            mpsc::error::TrySendError::Closed(_) => anyhow::anyhow!("operation worker stopped"),
        })
    }
}

// ---------------------------------------------------------------------------
// OperationRunner
// ---------------------------------------------------------------------------

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs [`OperationJob`]s concurrently and expires overdue operations.
pub struct OperationRunner {
    repository: Arc<dyn OperationRepository>,
    cancellations: Arc<CancellationRegistry>,
    sweep_batch: usize,
    shutdown_timeout: Duration,
    tasks: JoinSet<()>,
    /// Ids of spawned jobs that have not returned yet.
    in_flight: Arc<DashSet<OperationId>>,
}

impl OperationRunner {
    #[must_use]
    pub fn new(
        repository: Arc<dyn OperationRepository>,
        cancellations: Arc<CancellationRegistry>,
        sweep_batch: usize,
    ) -> Self {
        Self {
            repository,
            cancellations,
            sweep_batch: sweep_batch.max(1),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            tasks: JoinSet::new(),
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// How long [`shutdown`](BackgroundRunnable::shutdown) waits for
    /// cancelled jobs before aborting them.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Jobs currently executing.
    #[must_use]
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Moves up to one batch of overdue operations to `expired` and fires
    /// their tokens. Returns how many were expired.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let overdue = match self.repository.expired(now, self.sweep_batch).await {
            Ok(overdue) => overdue,
            Err(e) => {
                warn!(error = %e, "expiry sweep failed");
                return 0;
            }
        };

        let mut expired = 0;
        for mut operation in overdue {
            let expected = operation.status;
            if operation.transition_to(OperationStatus::Expired, now).is_err() {
                continue;
            }
            match self.repository.persist(&operation, expected).await {
                Ok(()) => {
                    self.cancellations.cancel(&operation.id);
                    info!(operation_id = %operation.id, function = %operation.function, "operation expired");
                    expired += 1;
                }
                Err(e) => debug!(operation_id = %operation.id, error = %e, "expiry lost race"),
            }
        }
        expired
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "operation task aborted");
            }
        }
    }
}

/// Fails `id` with `UNAVAILABLE`, routing a queued operation through
/// `processing` first.
async fn fail_unavailable(
    repository: &dyn OperationRepository,
    id: &OperationId,
    message: &str,
) -> Result<Operation, UpdateError> {
    let info = ErrorInfo::new(ErrorCode::Unavailable, message);
    update_operation(repository, id, move |op| {
        let now = Utc::now();
        if op.status == OperationStatus::Queued {
            op.transition_to(OperationStatus::Processing, now)?;
        }
        op.fail(vec![info], now)
    })
    .await
}

/// Drives one job from `queued` to a terminal status.
async fn execute(
    repository: Arc<dyn OperationRepository>,
    cancellations: Arc<CancellationRegistry>,
    job: OperationJob,
) {
    let OperationJob {
        operation_id: id,
        function,
        arguments,
        context,
    } = job;
    let token = cancellations.register(&id);

    if let Err(e) = update_operation(repository.as_ref(), &id, |op| {
        op.transition_to(OperationStatus::Processing, Utc::now())
    })
    .await
    {
        debug!(operation_id = %id, error = %e, "operation not started");
        cancellations.remove(&id);
        return;
    }
    debug!(operation_id = %id, "operation started");

    let job_ctx = JobContext::new(
        id.clone(),
        context,
        ProgressReporter::new(Arc::clone(&repository), id.clone()),
        token,
    );
    let outcome = AssertUnwindSafe(function.run(arguments, job_ctx))
        .catch_unwind()
        .await;

    let finished = match outcome {
        Ok(Ok(value)) => {
            update_operation(repository.as_ref(), &id, move |op| {
                op.complete(value, Utc::now())
            })
            .await
        }
        Ok(Err(err)) => {
            let info = err.to_error_info();
            update_operation(repository.as_ref(), &id, move |op| {
                op.fail(vec![info], Utc::now())
            })
            .await
        }
        Err(_) => {
            error!(operation_id = %id, "async function panicked");
            update_operation(repository.as_ref(), &id, |op| {
                op.fail(vec![ErrorInfo::internal()], Utc::now())
            })
            .await
        }
    };
    match finished {
        Ok(operation) => info!(operation_id = %id, status = %operation.status, "operation finished"),
        // Cancelled or expired while running.
        Err(e) => debug!(operation_id = %id, error = %e, "operation result discarded"),
    }
    cancellations.remove(&id);
}

#[async_trait]
impl BackgroundRunnable for OperationRunner {
    type Task = OperationJob;

    async fn run(&mut self, job: OperationJob) {
        self.reap_finished();
        let id = job.operation_id.clone();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.insert(id.clone());
        let run = execute(
            Arc::clone(&self.repository),
            Arc::clone(&self.cancellations),
            job,
        );
        self.tasks.spawn(async move {
            run.await;
            in_flight.remove(&id);
        });
    }

    async fn on_tick(&mut self) {
        self.reap_finished();
        self.sweep_expired().await;
    }

    async fn abandon(&mut self, job: OperationJob) {
        let id = job.operation_id;
        let abandoned = fail_unavailable(
            self.repository.as_ref(),
            &id,
            "Operation worker stopped before the job ran",
        )
        .await;
        match abandoned {
            Ok(_) => info!(operation_id = %id, "queued operation abandoned"),
            Err(e) => debug!(operation_id = %id, error = %e, "queued operation already settled"),
        }
    }

    async fn shutdown(&mut self) {
        let running = self.tasks.len();
        self.cancellations.cancel_all();

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                stuck = self.tasks.len(),
                "operations ignored cancellation; aborting"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}

            let stuck: Vec<OperationId> =
                self.in_flight.iter().map(|id| id.key().clone()).collect();
            for id in stuck {
                self.in_flight.remove(&id);
                if let Err(e) = fail_unavailable(
                    self.repository.as_ref(),
                    &id,
                    "Operation aborted at shutdown",
                )
                .await
                {
                    debug!(operation_id = %id, error = %e, "aborted operation already settled");
                }
            }
        }
        info!(running, drained, "operation worker stopped");
    }
}

/// Starts the operation worker described by `config` and returns it with an
/// executor feeding it.
///
/// # Errors
///
/// Fails if the worker loop is not accepting tasks right after start.
pub fn spawn_operation_worker(
    repository: Arc<dyn OperationRepository>,
    cancellations: Arc<CancellationRegistry>,
    config: &DispatchConfig,
) -> anyhow::Result<(BackgroundWorker<OperationRunner>, WorkerExecutor)> {
    let runner = OperationRunner::new(repository, cancellations, config.operation_sweep_batch)
        .with_shutdown_timeout(Duration::from_millis(config.worker_shutdown_timeout_ms));
    let worker = BackgroundWorker::start(
        runner,
        config.operation_sweep_interval_ms,
        config.worker_channel_capacity,
    );
    let executor = worker
        .sender()
        .map(WorkerExecutor::new)
        .ok_or_else(|| anyhow::anyhow!("operation worker is not running"))?;
    Ok((worker, executor))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
