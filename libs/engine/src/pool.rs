//! Bounded-concurrency workflow backed by a worker pool
//!
//! A single service collection is not safe for concurrent execution, so
//! the pooling workflow runs each message through a private deep clone
//! held by a pool-owned [`Worker`]. Concurrency is capped by a semaphore
//! with `pool_size` permits; a worker whose service chain fails is
//! destroyed rather than returned, on the assumption that its internal
//! state may be corrupt.
//!
//! Shutdown blocks new submissions behind a fairness gate, drains
//! in-flight tasks with a bounded wait, forcibly cancels stragglers, and
//! routes every cancelled message to failure handling. Nothing is
//! silently dropped.

use crate::collection::ServiceList;
use crate::context::Envelope;
use crate::error::EngineError;
use crate::events::{EventAggregator, NoOpAggregator};
use crate::handler::{ErrorHandler, FailureDigest, StandardErrorHandler};
use crate::lifecycle::{self, Component, ComponentState};
use crate::service::Service;
use crate::workflow::{
    run_pipeline, PipelineContext, Workflow, WorkflowConfig, WorkflowObserver,
};
use crate::MessageProducer;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;

/// Worker pool bounds and waits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on concurrently borrowed workers
    pub pool_size: usize,
    /// Workers started eagerly during pool population
    pub min_idle: usize,
    /// Idle workers kept alive; returned workers beyond this are destroyed
    pub max_idle: usize,
    /// Bound on startup population; past it the pool starts partial
    pub init_wait: Duration,
    /// Bound on the shutdown drain; past it in-flight tasks are cancelled
    pub shutdown_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            min_idle: 1,
            max_idle: 10,
            init_wait: Duration::from_secs(60),
            shutdown_wait: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Enforce `min_idle <= max_idle <= pool_size`, correcting downward
    /// with a warning rather than failing
    pub fn normalized(&self) -> Self {
        let mut corrected = self.clone();
        if corrected.pool_size == 0 {
            tracing::warn!("pool_size 0 corrected to 1");
            corrected.pool_size = 1;
        }
        if corrected.max_idle > corrected.pool_size {
            tracing::warn!(
                max_idle = corrected.max_idle,
                pool_size = corrected.pool_size,
                "max_idle exceeds pool_size, clamping"
            );
            corrected.max_idle = corrected.pool_size;
        }
        if corrected.min_idle > corrected.max_idle {
            tracing::warn!(
                min_idle = corrected.min_idle,
                max_idle = corrected.max_idle,
                "min_idle exceeds max_idle, clamping"
            );
            corrected.min_idle = corrected.max_idle;
        }
        corrected
    }
}

/// A pool-owned service collection clone with its own lifecycle
#[derive(Debug)]
struct Worker {
    id: usize,
    services: Box<dyn Service>,
}

impl Worker {
    async fn start(id: usize, mut services: Box<dyn Service>) -> Result<Self, EngineError> {
        lifecycle::request_start(services.as_mut()).await?;
        tracing::debug!(worker = id, "worker started");
        Ok(Self { id, services })
    }

    async fn destroy(mut self) {
        lifecycle::request_close(self.services.as_mut()).await;
        tracing::debug!(worker = self.id, "worker destroyed");
    }
}

/// Fixed-size pool of workers; borrows block while all permits are out
#[derive(Debug)]
pub(crate) struct WorkerPool {
    prototype: Box<dyn Service>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Worker>>,
    next_id: AtomicUsize,
}

impl WorkerPool {
    fn new(prototype: Box<dyn Service>, config: PoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.pool_size));
        Self {
            prototype,
            config,
            semaphore,
            idle: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Start `min_idle` workers in parallel; a worker that is not ready
    /// within `init_wait` is abandoned and the pool starts partial
    async fn populate(self: &Arc<Self>) {
        let target = self.config.min_idle;
        if target == 0 {
            return;
        }
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Worker>(target);
        for _ in 0..target {
            let services = self.prototype.clone_service();
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let tx = tx.clone();
            tokio::spawn(async move {
                match Worker::start(id, services).await {
                    Ok(worker) => {
                        if let Err(rejected) = tx.send(worker).await {
                            // Population already timed out.
                            rejected.0.destroy().await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(worker = id, error = %e, "worker failed to start during population");
                    }
                }
            });
        }
        drop(tx);

        let deadline = tokio::time::Instant::now() + self.config.init_wait;
        let mut ready = 0usize;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(worker)) => {
                    self.idle.lock().push(worker);
                    ready += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(ready, target, "pool population timed out, starting partial");
                    break;
                }
            }
        }
        tracing::info!(ready, target, pool_size = self.config.pool_size, "worker pool populated");
    }

    /// Borrow a worker, blocking while `pool_size` are already out
    async fn borrow(self: &Arc<Self>) -> Result<WorkerGuard, EngineError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        let idle_worker = self.idle.lock().pop();
        let worker = match idle_worker {
            Some(worker) => worker,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                Worker::start(id, self.prototype.clone_service()).await?
            }
        };
        Ok(WorkerGuard {
            worker: Some(worker),
            pool: self.clone(),
            _permit: permit,
        })
    }

    /// Returns the worker unless the idle shelf is full
    fn shelve(&self, worker: Worker) -> Option<Worker> {
        let mut idle = self.idle.lock();
        if idle.len() >= self.config.max_idle {
            Some(worker)
        } else {
            idle.push(worker);
            None
        }
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Refuse further borrows and close every idle worker
    ///
    /// Workers are independent, so teardown order does not matter and
    /// runs concurrently.
    async fn close(&self) {
        self.semaphore.close();
        let workers: Vec<Worker> = self.idle.lock().drain(..).collect();
        futures::future::join_all(workers.into_iter().map(Worker::destroy)).await;
    }
}

/// RAII borrow of a pool worker
///
/// Call [`release`](Self::release) after a clean run or
/// [`invalidate`](Self::invalidate) after a service failure. A guard
/// dropped without either (a cancelled task) destroys its worker in the
/// background; the permit is freed either way.
struct WorkerGuard {
    worker: Option<Worker>,
    pool: Arc<WorkerPool>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl WorkerGuard {
    fn services(&mut self) -> &mut dyn Service {
        // Invariant: worker is only taken by release/invalidate, which
        // both consume the guard.
        self.worker
            .as_mut()
            .map(|w| w.services.as_mut())
            .unwrap_or_else(|| unreachable!("worker taken from live guard"))
    }

    async fn release(mut self) {
        if let Some(worker) = self.worker.take() {
            if let Some(excess) = self.pool.shelve(worker) {
                excess.destroy().await;
            }
        }
    }

    async fn invalidate(mut self) {
        if let Some(worker) = self.worker.take() {
            tracing::warn!(worker = worker.id, "invalidating worker after service failure");
            worker.destroy().await;
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            tokio::spawn(worker.destroy());
        }
    }
}

/// Workflow that processes up to `pool_size` messages concurrently, each
/// on a private clone of the configured service collection
#[derive(Debug)]
pub struct PoolingWorkflow {
    config: WorkflowConfig,
    pool_config: PoolConfig,
    services: ServiceList,
    producer: Arc<dyn MessageProducer>,
    error_handler: Arc<dyn ErrorHandler>,
    aggregator: Arc<dyn EventAggregator>,
    observers: Vec<Arc<dyn WorkflowObserver>>,
    channel_available: Arc<AtomicBool>,
    state: ComponentState,
    pool: Option<Arc<WorkerPool>>,
    /// Fairness gate: shutdown write-locks it to block new submissions
    accepting: Arc<RwLock<bool>>,
    tasks: JoinSet<()>,
    in_flight: Arc<DashMap<u64, Envelope>>,
    task_seq: AtomicU64,
}

impl PoolingWorkflow {
    pub fn new(
        config: WorkflowConfig,
        pool_config: PoolConfig,
        services: ServiceList,
        producer: Arc<dyn MessageProducer>,
    ) -> Self {
        let handler = StandardErrorHandler::new(
            format!("{}-error-handler", config.id),
            Arc::new(FailureDigest::default()),
        );
        Self {
            config,
            pool_config,
            services,
            producer,
            error_handler: Arc::new(handler),
            aggregator: Arc::new(NoOpAggregator),
            observers: Vec::new(),
            channel_available: Arc::new(AtomicBool::new(true)),
            state: ComponentState::Closed,
            pool: None,
            accepting: Arc::new(RwLock::new(false)),
            tasks: JoinSet::new(),
            in_flight: Arc::new(DashMap::new()),
            task_seq: AtomicU64::new(0),
        }
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn EventAggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn add_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Shared flag the owning channel flips to mark this workflow
    /// (un)available
    pub fn availability_flag(&self) -> Arc<AtomicBool> {
        self.channel_available.clone()
    }

    fn pipeline_context(&self) -> PipelineContext {
        PipelineContext {
            workflow_id: self.config.id.clone(),
            channel_id: self.config.channel_id.clone(),
            producer: self.producer.clone(),
            error_handler: self.error_handler.clone(),
            aggregator: self.aggregator.clone(),
            observers: self.observers.clone(),
            channel_available: self.channel_available.clone(),
        }
    }

    async fn reject(&self, mut envelope: Envelope, error: EngineError) {
        envelope.context.set_workflow_id(&self.config.id);
        envelope.context.record_failure(error, &self.config.id);
        self.error_handler.handle(envelope).await;
    }
}

#[async_trait]
impl Component for PoolingWorkflow {
    fn name(&self) -> &str {
        &self.config.id
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn set_state(&mut self, state: ComponentState) {
        self.state = state;
    }

    async fn init(&mut self) -> Result<(), EngineError> {
        self.config.validate()?;
        self.pool_config = self.pool_config.normalized();
        lifecycle::request_init(&mut self.services).await
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        // One canonical clone seeds the pool; the configured collection
        // itself never processes a message.
        let prototype = self.services.clone_service();
        let pool = Arc::new(WorkerPool::new(prototype, self.pool_config.clone()));
        pool.populate().await;
        self.pool = Some(pool);
        self.error_handler.activate().await;
        *self.accepting.write().await = true;
        Ok(())
    }

    async fn stop(&mut self) {
        *self.accepting.write().await = false;

        let deadline = tokio::time::Instant::now() + self.pool_config.shutdown_wait;
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        workflow = %self.config.id,
                        remaining = self.tasks.len(),
                        "shutdown drain timed out, cancelling in-flight tasks"
                    );
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        // Completed tasks removed their own tracking entries; whatever is
        // left was cancelled mid-flight and must still reach a verdict.
        // The verdict is shared across clones, so a task aborted inside
        // its error handler already counts as decided.
        let stranded: Vec<u64> = self.in_flight.iter().map(|e| *e.key()).collect();
        for token in stranded {
            if let Some((_, envelope)) = self.in_flight.remove(&token) {
                if envelope.context.is_failed() {
                    continue;
                }
                self.reject(envelope, EngineError::PoolExhausted(self.pool_config.shutdown_wait))
                    .await;
            }
        }

        self.error_handler.shutdown().await;
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
    }

    async fn close(&mut self) {
        lifecycle::request_close(&mut self.services).await;
    }
}

#[async_trait]
impl Workflow for PoolingWorkflow {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn on_message(&mut self, envelope: Envelope) {
        // Opportunistically reap finished tasks so the set stays small.
        while self.tasks.try_join_next().is_some() {}

        let accepting = { *self.accepting.read().await };
        let pool = match (&self.pool, accepting) {
            (Some(pool), true) => pool.clone(),
            _ => {
                self.reject(envelope, EngineError::ShuttingDown).await;
                return;
            }
        };

        let ctx = self.pipeline_context();
        let token = self.task_seq.fetch_add(1, Ordering::SeqCst);
        self.in_flight.insert(token, envelope.clone());
        let in_flight = self.in_flight.clone();

        self.tasks.spawn(async move {
            match pool.borrow().await {
                Ok(mut guard) => {
                    let run = run_pipeline(&ctx, guard.services(), envelope).await;
                    // The pipeline reached a verdict; untrack before worker
                    // disposal so a cancellation there cannot fail the
                    // message a second time.
                    in_flight.remove(&token);
                    if run.service_failed {
                        guard.invalidate().await;
                    } else {
                        guard.release().await;
                    }
                }
                Err(error) => {
                    let mut envelope = envelope;
                    envelope.context.record_failure(error, &ctx.workflow_id);
                    ctx.error_handler.handle(envelope).await;
                    in_flight.remove(&token);
                }
            }
        });
    }
}
