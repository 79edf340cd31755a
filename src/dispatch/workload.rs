//! Units of work queued for the owning thread.

use std::any::Any;
use std::sync::mpsc::SyncSender;

use thiserror::Error;

use crate::BoxError;

/// Type-erased workload return value.
pub type WorkValue = Box<dyn Any + Send>;

/// One-shot action run on the owning thread.
pub type Action = Box<dyn FnOnce() -> Result<WorkValue, BoxError> + Send>;

/// Produces the step machine for a coroutine workload.
pub type CoroutineFactory = Box<dyn FnOnce() -> Box<dyn Coroutine> + Send>;

pub(crate) type Completion = SyncSender<Result<WorkValue, WorkloadFault>>;

/// Result of resuming a coroutine once.
#[derive(Debug)]
pub enum Step {
    /// More work remains; resume again on a later tick.
    Pending,
    Done,
    Failed(BoxError),
}

/// A step machine driven one resumption per tick on the owning thread.
pub trait Coroutine: Send {
    fn resume(&mut self) -> Step;
}

impl<F> Coroutine for F
where
    F: FnMut() -> Step + Send,
{
    fn resume(&mut self) -> Step {
        self()
    }
}

/// Why a workload did not produce a value.
#[derive(Debug, Error)]
pub enum WorkloadFault {
    #[error(transparent)]
    Error(BoxError),

    #[error("workload panicked: {0}")]
    Panicked(String),
}

pub(crate) enum WorkBody {
    Action(Action),
    Coroutine(CoroutineFactory),
}

/// A queued unit of work.
///
/// Exactly one of action or coroutine factory is present. Workloads with a
/// completion channel are synchronous: their outcome goes back to the
/// waiting caller instead of the async error handler.
pub struct Workload {
    pub(crate) body: WorkBody,
    pub(crate) completion: Option<Completion>,
}

impl Workload {
    /// Fire-and-forget action.
    pub fn action<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        Self {
            body: WorkBody::Action(Box::new(move || f().map(|()| Box::new(()) as WorkValue))),
            completion: None,
        }
    }

    /// Coroutine started on the next tick and resumed on later ticks.
    pub fn coroutine<F, C>(factory: F) -> Self
    where
        F: FnOnce() -> C + Send + 'static,
        C: Coroutine + 'static,
    {
        Self {
            body: WorkBody::Coroutine(Box::new(move || Box::new(factory()) as Box<dyn Coroutine>)),
            completion: None,
        }
    }

    pub(crate) fn returning(action: Action, completion: Completion) -> Self {
        Self {
            body: WorkBody::Action(action),
            completion: Some(completion),
        }
    }

    /// True when a caller is blocked waiting for this workload.
    pub fn is_sync(&self) -> bool {
        self.completion.is_some()
    }

    pub fn kind(&self) -> &'static str {
        match self.body {
            WorkBody::Action(_) => "action",
            WorkBody::Coroutine(_) => "coroutine",
        }
    }
}

impl std::fmt::Debug for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workload")
            .field("kind", &self.kind())
            .field("sync", &self.is_sync())
            .finish()
    }
}
