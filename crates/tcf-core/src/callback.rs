//! Completion callbacks and result slots.

use std::sync::Arc;

use parking_lot::Mutex;

/// Completion callback of an asynchronous remote call.
///
/// Invoked exactly once, either with the result or with the error.
pub type Callback<T, E> = Box<dyn FnOnce(Result<T, E>) + Send + 'static>;

/// Box a closure as a [`Callback`].
pub fn callback<T, E, F>(f: F) -> Callback<T, E>
where
    F: FnOnce(Result<T, E>) + Send + 'static,
{
    Box::new(f)
}

/// Shared slot capturing whatever a callback delivered.
///
/// Blocking callers hand `outcome.callback()` to an adapted call and read
/// the slot after the call returns.
pub struct Outcome<T, E> {
    slot: Arc<Mutex<Option<Result<T, E>>>>,
}

impl<T, E> Clone for Outcome<T, E> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T, E> Default for Outcome<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Outcome<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Callback that stores its result into this slot.
    #[must_use]
    pub fn callback(&self) -> Callback<T, E> {
        let slot = Arc::clone(&self.slot);
        Box::new(move |result| {
            *slot.lock() = Some(result);
        })
    }

    /// Whether a result has been delivered and not yet taken.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Take the delivered result, if any.
    #[must_use]
    pub fn take(&self) -> Option<Result<T, E>> {
        self.slot.lock().take()
    }
}
