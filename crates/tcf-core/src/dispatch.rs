//! Single-threaded dispatch executor.
//!
//! All protocol state is owned by one dedicated thread. Tasks may be queued
//! from any thread and run strictly one at a time, in the order queued.

use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    thread::{self, ThreadId},
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::CoreConfig;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Dispatch error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to start dispatch thread: {0}")]
    Spawn(String),
    #[error("Dispatch executor has shut down")]
    Shutdown,
    #[error("Dispatched task panicked: {0}")]
    Panicked(String),
}

/// Handle to the dispatch executor.
///
/// Cloning is cheap. The executor thread exits once every handle is dropped
/// and the queue has drained.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    sender: mpsc::UnboundedSender<Task>,
    thread_id: ThreadId,
}

impl Dispatcher {
    /// Start the dispatch thread.
    ///
    /// The thread drives a current-thread tokio runtime, so tasks may use
    /// `tokio::spawn` and tokio timers.
    ///
    /// # Errors
    /// Returns error if the runtime or the thread cannot be created.
    pub fn start(config: &CoreConfig) -> Result<Self, DispatchError> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DispatchError::Spawn(e.to_string()))?;

        let handle = thread::Builder::new()
            .name(config.dispatch_thread_name.clone())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(task) = receiver.recv().await {
                        if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                            error!("Dispatched task panicked: {}", panic_message(&*panic));
                        }
                    }
                });
                debug!("Dispatch executor stopped");
            })
            .map_err(|e| DispatchError::Spawn(e.to_string()))?;

        Ok(Self {
            sender,
            thread_id: handle.thread().id(),
        })
    }

    /// Whether the current thread is the dispatch thread.
    #[must_use]
    pub fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Queue a task to run later on the dispatch thread.
    pub fn invoke_later<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(Box::new(task)).is_err() {
            error!("Dispatch executor is gone, task dropped");
        }
    }

    /// Run `f` on the dispatch thread and block until it has run.
    ///
    /// Runs inline when already on the dispatch thread.
    ///
    /// # Errors
    /// Returns error if the task panicked or the executor is gone.
    pub fn invoke_and_wait<F, R>(&self, f: F) -> Result<R, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_dispatch_thread() {
            return Ok(f());
        }
        let rx = self.submit(f)?;
        futures::executor::block_on(rx).map_err(|_| DispatchError::Shutdown)?
    }

    /// Run `f` on the dispatch thread and await its result.
    ///
    /// # Errors
    /// Returns error if the task panicked or the executor is gone.
    pub async fn run<F, R>(&self, f: F) -> Result<R, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_dispatch_thread() {
            return Ok(f());
        }
        let rx = self.submit(f)?;
        rx.await.map_err(|_| DispatchError::Shutdown)?
    }

    fn submit<F, R>(
        &self,
        f: F,
    ) -> Result<oneshot::Receiver<Result<R, DispatchError>>, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Box::new(move || {
                let result = catch_unwind(AssertUnwindSafe(f))
                    .map_err(|panic| DispatchError::Panicked(panic_message(&*panic)));
                let _ = tx.send(result);
            }))
            .map_err(|_| DispatchError::Shutdown)?;
        Ok(rx)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
