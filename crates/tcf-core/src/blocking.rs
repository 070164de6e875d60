//! Blocking call adapter.
//!
//! Lets a thread other than the dispatch thread invoke an asynchronous
//! service method and block until its completion callback has fired.

use std::time::Duration;

use tracing::{error, warn};

use crate::{Callback, DispatchError, Dispatcher, Rendezvous};

/// Default time a caller waits for the completion callback.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// How a service method is invoked through the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallMode {
    /// The method completes through a callback the caller waits for.
    pub proxy: bool,
    /// The method must be issued on the dispatch thread.
    pub dispatch: bool,
}

impl CallMode {
    pub const DIRECT: Self = Self {
        proxy: false,
        dispatch: false,
    };
    pub const PROXY: Self = Self {
        proxy: true,
        dispatch: false,
    };
    pub const DISPATCH: Self = Self {
        proxy: false,
        dispatch: true,
    };
    pub const PROXY_DISPATCH: Self = Self {
        proxy: true,
        dispatch: true,
    };
}

/// Describes which methods of a service are proxy and dispatch methods.
pub trait ProxyDescriptor: Send + Sync {
    /// Call mode of `method`.
    fn call_mode(&self, method: &str) -> CallMode;
}

/// Every method is asynchronous and issued on the dispatch thread.
///
/// This is the shape of protocol services.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllDispatched;

impl ProxyDescriptor for AllDispatched {
    fn call_mode(&self, _method: &str) -> CallMode {
        CallMode::PROXY_DISPATCH
    }
}

/// Static per-method table with a fallback for unlisted methods.
#[derive(Debug, Clone, Copy)]
pub struct MethodTable {
    entries: &'static [(&'static str, CallMode)],
    fallback: CallMode,
}

impl MethodTable {
    #[must_use]
    pub const fn new(entries: &'static [(&'static str, CallMode)], fallback: CallMode) -> Self {
        Self { entries, fallback }
    }
}

impl ProxyDescriptor for MethodTable {
    fn call_mode(&self, method: &str) -> CallMode {
        self.entries
            .iter()
            .find(|(name, _)| *name == method)
            .map_or(self.fallback, |(_, mode)| *mode)
    }
}

/// Blocking call error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockingCallError {
    #[error("Blocking call to '{0}' issued from the dispatch thread")]
    OnDispatchThread(String),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Invokes service methods on behalf of non-dispatch threads.
///
/// Service decorators hold one of these and route every method through
/// [`BlockingCall::invoke`], which is what makes the decorated service block.
#[derive(Debug, Clone)]
pub struct BlockingCall<D = AllDispatched> {
    dispatcher: Dispatcher,
    descriptor: D,
    timeout: Duration,
}

impl<D: ProxyDescriptor> BlockingCall<D> {
    /// Create an adapter using the default 60 second timeout.
    #[must_use]
    pub const fn new(dispatcher: Dispatcher, descriptor: D) -> Self {
        Self {
            dispatcher,
            descriptor,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the completion timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Invoke `method` with completion callback `done`.
    ///
    /// `call` performs the real invocation against the delegate. For proxy
    /// methods it receives an intercepting callback that forwards to `done`
    /// and then releases the caller; the caller blocks until then or until
    /// the timeout. On timeout the call returns normally and `done` may
    /// never see a result. Errors delivered to the callback pass through
    /// untouched.
    ///
    /// # Errors
    /// Returns error if called on the dispatch thread, or if `call` panicked
    /// while running there.
    pub fn invoke<T, E, F>(
        &self,
        method: &str,
        done: Callback<T, E>,
        call: F,
    ) -> Result<(), BlockingCallError>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce(Callback<T, E>) + Send + 'static,
    {
        self.check_thread(method)?;

        let mode = self.descriptor.call_mode(method);
        let rendezvous = mode.proxy.then(Rendezvous::new);
        let done = match &rendezvous {
            Some(r) => intercept(done, r.clone()),
            None => done,
        };

        if mode.dispatch {
            self.dispatcher.invoke_and_wait(move || call(done))?;
        } else {
            call(done);
        }

        if let Some(rendezvous) = rendezvous {
            if let Err(e) = rendezvous.wait(self.timeout) {
                warn!(method, "No reply: {e}");
            }
        }
        Ok(())
    }

    /// Invoke a method without a completion callback.
    ///
    /// # Errors
    /// Returns error if called on the dispatch thread, or if `call` panicked
    /// while running there.
    pub fn invoke_direct<R, F>(&self, method: &str, call: F) -> Result<R, BlockingCallError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.check_thread(method)?;
        if self.descriptor.call_mode(method).dispatch {
            Ok(self.dispatcher.invoke_and_wait(call)?)
        } else {
            Ok(call())
        }
    }

    fn check_thread(&self, method: &str) -> Result<(), BlockingCallError> {
        if self.dispatcher.is_dispatch_thread() {
            error!(method, "Blocking call issued from the dispatch thread");
            return Err(BlockingCallError::OnDispatchThread(method.to_string()));
        }
        Ok(())
    }
}

/// Releases the rendezvous when dropped, so a delegate that drops the
/// callback without calling it does not strand the waiter.
struct ArriveOnDrop(Rendezvous);

impl Drop for ArriveOnDrop {
    fn drop(&mut self) {
        self.0.arrive();
    }
}

fn intercept<T, E>(done: Callback<T, E>, rendezvous: Rendezvous) -> Callback<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let guard = ArriveOnDrop(rendezvous);
    Box::new(move |result| {
        done(result);
        drop(guard);
    })
}
