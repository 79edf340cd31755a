//! Cross-thread work dispatcher.
//!
//! # Responsibilities
//! - Accept work from any thread for execution on the single owning thread
//! - Block synchronous callers until their work completes or times out
//! - Drain a bounded number of workloads per tick
//! - Drive coroutine workloads one step per tick
//!
//! # Design Decisions
//! - The owning thread is bound once and never changes
//! - Waiting on the owning thread for work only it can run is refused up
//!   front instead of deadlocking
//! - A timed-out workload still runs; its result is dropped
//! - Panics inside workloads are caught and reported as faults

use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use thiserror::Error;

use crate::config::DispatchConfig;
use crate::dispatch::workload::{
    Coroutine, Step, WorkBody, WorkValue, Workload, WorkloadFault,
};
use crate::error::catch_panic;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::BoxError;

/// Callback receiving faults from workloads nobody is waiting on.
pub type AsyncErrorHandler = Arc<dyn Fn(&WorkloadFault) + Send + Sync>;

/// Errors returned to callers of the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Called from the owning thread, which would wait on itself.
    #[error("cannot wait on the owning thread from the owning thread")]
    DeadlockGuard,

    #[error("workload did not complete within {0:?}")]
    Timeout(Duration),

    /// The dispatcher dropped the workload without running it.
    #[error("workload was dropped before it completed")]
    Disconnected,

    /// The workload itself failed; the original error is preserved.
    #[error(transparent)]
    Workload(BoxError),

    #[error("workload panicked: {0}")]
    Panicked(String),

    #[error("workload returned a value of an unexpected type")]
    TypeMismatch,

    #[error("owning thread is already bound to another thread")]
    AlreadyBound,
}

impl DispatchError {
    /// The workload's own error, if that is what failed.
    pub fn into_workload_error(self) -> Option<BoxError> {
        match self {
            DispatchError::Workload(e) => Some(e),
            _ => None,
        }
    }
}

/// Runs work submitted from any thread on one owning thread.
pub struct WorkDispatcher {
    config: DispatchConfig,
    owner: OnceLock<ThreadId>,
    queue: Mutex<VecDeque<Workload>>,
    running: Mutex<Vec<Box<dyn Coroutine>>>,
    on_async_error: AsyncErrorHandler,
}

impl WorkDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            owner: OnceLock::new(),
            queue: Mutex::new(VecDeque::new()),
            running: Mutex::new(Vec::new()),
            on_async_error: Arc::new(|fault| {
                tracing::error!(error = %fault, "Async workload failed");
            }),
        }
    }

    /// Replace the handler for faults from asynchronous workloads.
    pub fn with_async_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&WorkloadFault) + Send + Sync + 'static,
    {
        self.on_async_error = Arc::new(handler);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Bind the calling thread as the owning thread.
    ///
    /// Binding the same thread again is a no-op.
    pub fn bind_owning_thread(&self) -> Result<(), DispatchError> {
        let current = thread::current().id();
        let owner = *self.owner.get_or_init(|| current);
        if owner == current {
            tracing::debug!(thread = ?current, "Work dispatcher bound to owning thread");
            Ok(())
        } else {
            Err(DispatchError::AlreadyBound)
        }
    }

    pub fn owning_thread(&self) -> Option<ThreadId> {
        self.owner.get().copied()
    }

    pub fn is_owning_thread(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    /// Append a workload to the queue.
    pub fn enqueue_workload(&self, workload: Workload) -> Result<(), DispatchError> {
        if self.is_owning_thread() {
            return Err(DispatchError::DeadlockGuard);
        }
        self.lock_queue().push_back(workload);
        Ok(())
    }

    pub fn has_workload(&self) -> bool {
        !self.lock_queue().is_empty()
    }

    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn dequeue_work(&self) -> Option<Workload> {
        self.lock_queue().pop_front()
    }

    /// Run `action` on the owning thread without waiting for it.
    ///
    /// Failures go to the async error handler.
    pub fn execute_async<F>(&self, action: F) -> Result<(), DispatchError>
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.enqueue_workload(Workload::action(action))
    }

    /// Start a coroutine on the owning thread. Its first step runs on the
    /// next tick, later steps on the ticks after.
    pub fn execute_async_coroutine<F, C>(&self, factory: F) -> Result<(), DispatchError>
    where
        F: FnOnce() -> C + Send + 'static,
        C: Coroutine + 'static,
    {
        self.enqueue_workload(Workload::coroutine(factory))
    }

    /// Run `f` on the owning thread and wait for its value, using the
    /// configured timeout.
    pub fn execute_sync<T, F>(&self, f: F) -> Result<T, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        self.execute_sync_timeout(f, self.config.sync_timeout())
    }

    /// Run `f` on the owning thread and wait up to `timeout` for its value.
    pub fn execute_sync_timeout<T, F>(&self, f: F, timeout: Duration) -> Result<T, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        if self.is_owning_thread() {
            return Err(DispatchError::DeadlockGuard);
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let action = Box::new(move || f().map(|value| Box::new(value) as WorkValue));
        self.enqueue_workload(Workload::returning(action, tx))?;

        match rx.recv_timeout(timeout) {
            Ok(Ok(value)) => value
                .downcast::<T>()
                .map(|value| *value)
                .map_err(|_| DispatchError::TypeMismatch),
            Ok(Err(WorkloadFault::Error(e))) => Err(DispatchError::Workload(e)),
            Ok(Err(WorkloadFault::Panicked(message))) => Err(DispatchError::Panicked(message)),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Synchronous workload timed out");
                Err(DispatchError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::Disconnected),
        }
    }

    /// One tick: resume running coroutines, then drain up to
    /// `max_workloads_per_tick` queued workloads.
    ///
    /// Returns the number of queued workloads processed. A limit of 0
    /// disables the tick entirely.
    pub fn do_update(&self) -> usize {
        let max = self.config.max_workloads_per_tick;
        if max == 0 {
            return 0;
        }

        self.resume_running();

        let mut processed = 0;
        while processed < max {
            let Some(workload) = self.dequeue_work() else {
                break;
            };
            self.run_workload(workload);
            processed += 1;
        }
        processed
    }

    /// Drive ticks on the calling thread until `shutdown` triggers.
    ///
    /// Binds the calling thread as owner if none is bound yet.
    pub fn run_until(&self, shutdown: &Shutdown) -> Result<(), DispatchError> {
        self.bind_owning_thread()?;
        tracing::info!(
            max_workloads_per_tick = self.config.max_workloads_per_tick,
            tick_interval_ms = self.config.tick_interval_ms,
            "Work dispatcher loop started"
        );

        while !shutdown.is_triggered() {
            let processed = self.do_update();
            if processed < self.config.max_workloads_per_tick || processed == 0 {
                thread::sleep(self.config.tick_interval());
            }
        }

        tracing::info!(pending = self.pending(), "Work dispatcher loop stopped");
        Ok(())
    }

    /// Number of coroutines waiting for another step.
    pub fn running_coroutines(&self) -> usize {
        self.running.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn run_workload(&self, workload: Workload) {
        let Workload { body, completion } = workload;
        match body {
            WorkBody::Action(action) => {
                let result = match catch_panic(action) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(WorkloadFault::Error(e)),
                    Err(message) => Err(WorkloadFault::Panicked(message)),
                };
                metrics::record_workload("action", outcome(&result));

                match completion {
                    // The receiver may have timed out and gone away.
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => {
                        if let Err(fault) = result {
                            self.report_async_fault(&fault);
                        }
                    }
                }
            }
            WorkBody::Coroutine(factory) => {
                let first = catch_panic(move || {
                    let mut coroutine = factory();
                    let step = coroutine.resume();
                    (coroutine, step)
                });
                match first {
                    Ok((coroutine, Step::Pending)) => {
                        metrics::record_workload("coroutine", "started");
                        if let Ok(mut running) = self.running.lock() {
                            running.push(coroutine);
                        }
                    }
                    Ok((_, Step::Done)) => metrics::record_workload("coroutine", "ok"),
                    Ok((_, Step::Failed(e))) => {
                        metrics::record_workload("coroutine", "error");
                        self.report_async_fault(&WorkloadFault::Error(e));
                    }
                    Err(message) => {
                        metrics::record_workload("coroutine", "panic");
                        self.report_async_fault(&WorkloadFault::Panicked(message));
                    }
                }
            }
        }
    }

    fn resume_running(&self) {
        let mut coroutines = match self.running.lock() {
            Ok(mut running) => std::mem::take(&mut *running),
            Err(_) => return,
        };
        if coroutines.is_empty() {
            return;
        }

        coroutines.retain_mut(|coroutine| match catch_panic(|| coroutine.resume()) {
            Ok(Step::Pending) => true,
            Ok(Step::Done) => {
                metrics::record_workload("coroutine", "ok");
                false
            }
            Ok(Step::Failed(e)) => {
                metrics::record_workload("coroutine", "error");
                tracing::warn!(error = %e, "Coroutine step failed");
                false
            }
            Err(message) => {
                metrics::record_workload("coroutine", "panic");
                tracing::warn!(panic = %message, "Coroutine step panicked");
                false
            }
        });

        if let Ok(mut running) = self.running.lock() {
            running.extend(coroutines);
        }
    }

    fn report_async_fault(&self, fault: &WorkloadFault) {
        let handler = Arc::clone(&self.on_async_error);
        if let Err(message) = catch_panic(|| handler(fault)) {
            tracing::error!(panic = %message, error = %fault, "Async error handler panicked");
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Workload>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn outcome(result: &Result<WorkValue, WorkloadFault>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(WorkloadFault::Error(_)) => "error",
        Err(WorkloadFault::Panicked(_)) => "panic",
    }
}

impl Default for WorkDispatcher {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}
