//! Blocking decorator for generic command services.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tracing::error;

use crate::{
    BlockingCall, Callback, CallMode, CommandError, Dispatcher, MethodTable, Outcome,
    RemoteService,
};

/// `name` is plain data; `command` completes through its callback and must
/// be issued on the dispatch thread.
pub const SERVICE_METHODS: MethodTable = MethodTable::new(
    &[("name", CallMode::DIRECT), ("command", CallMode::PROXY_DISPATCH)],
    CallMode::PROXY_DISPATCH,
);

/// No reply arrived before the timeout. Codes below zero are generated
/// locally, never by the agent.
pub const CODE_NO_REPLY: i32 = -1;
/// The command could not be issued.
pub const CODE_NOT_ISSUED: i32 = -2;

/// A [`RemoteService`] callable from any thread except the dispatch thread.
///
/// `command` blocks until the reply has been delivered to its callback.
#[derive(Clone)]
pub struct BlockingService {
    inner: Arc<dyn RemoteService>,
    name: String,
    adapter: BlockingCall<MethodTable>,
}

impl BlockingService {
    #[must_use]
    pub fn new(inner: Arc<dyn RemoteService>, dispatcher: Dispatcher) -> Self {
        let name = inner.name().to_string();
        Self {
            inner,
            name,
            adapter: BlockingCall::new(dispatcher, SERVICE_METHODS),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.adapter = self.adapter.with_timeout(timeout);
        self
    }

    /// Issue `command` and return its results.
    ///
    /// # Errors
    /// Returns the remote error, or a locally generated one if the command
    /// could not be issued or no reply arrived in time.
    pub fn call(&self, command: &str, args: Vec<Value>) -> Result<Vec<Value>, CommandError> {
        let outcome = Outcome::new();
        self.command(command, args, outcome.callback());
        outcome.take().unwrap_or_else(|| {
            Err(CommandError::new(
                &self.name,
                command,
                CODE_NO_REPLY,
                format!("no reply within {:?}", self.adapter.timeout()),
            ))
        })
    }
}

impl RemoteService for BlockingService {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, command: &str, args: Vec<Value>, done: Callback<Vec<Value>, CommandError>) {
        if self.adapter.dispatcher().is_dispatch_thread() {
            error!(
                service = %self.name,
                command,
                "Blocking command issued from the dispatch thread"
            );
            done(Err(CommandError::new(
                &self.name,
                command,
                CODE_NOT_ISSUED,
                "called on the dispatch thread",
            )));
            return;
        }
        let inner = Arc::clone(&self.inner);
        let name = command.to_string();
        if let Err(e) = self
            .adapter
            .invoke("command", done, move |done| inner.command(&name, args, done))
        {
            error!(service = %self.name, command, "Blocking command failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::{CoreConfig, ProxyDescriptor};

    struct Echo {
        dispatcher: Dispatcher,
        parked: Mutex<Vec<Callback<Vec<Value>, CommandError>>>,
    }

    impl RemoteService for Echo {
        fn name(&self) -> &str {
            "Diagnostics"
        }

        fn command(
            &self,
            command: &str,
            args: Vec<Value>,
            done: Callback<Vec<Value>, CommandError>,
        ) {
            assert!(self.dispatcher.is_dispatch_thread());
            match command {
                "echo" => self.dispatcher.invoke_later(move || done(Ok(args))),
                "fail" => {
                    let error = CommandError::new("Diagnostics", "fail", 7, "boom");
                    self.dispatcher.invoke_later(move || done(Err(error)));
                }
                _ => self.parked.lock().push(done),
            }
        }
    }

    fn service() -> BlockingService {
        let dispatcher = Dispatcher::start(&CoreConfig::default()).unwrap();
        let echo = Arc::new(Echo {
            dispatcher: dispatcher.clone(),
            parked: Mutex::new(Vec::new()),
        });
        BlockingService::new(echo, dispatcher)
    }

    #[test]
    fn test_method_table() {
        assert_eq!(SERVICE_METHODS.call_mode("name"), CallMode::DIRECT);
        assert_eq!(SERVICE_METHODS.call_mode("command"), CallMode::PROXY_DISPATCH);
        assert_eq!(SERVICE_METHODS.call_mode("other"), CallMode::PROXY_DISPATCH);
    }

    #[test]
    fn test_call_returns_reply() {
        let service = service();
        assert_eq!(service.name(), "Diagnostics");
        assert_eq!(
            service.call("echo", vec![json!("hi"), json!(2)]).unwrap(),
            vec![json!("hi"), json!(2)]
        );
        assert_eq!(
            service.call("fail", vec![]).unwrap_err(),
            CommandError::new("Diagnostics", "fail", 7, "boom")
        );
    }

    #[test]
    fn test_call_times_out() {
        let service = service().with_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = service.call("hang", vec![]).unwrap_err();
        assert_eq!(err.code, CODE_NO_REPLY);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_rejected_on_dispatch_thread() {
        let service = service();
        let dispatcher = service.adapter.dispatcher().clone();
        let err = dispatcher
            .invoke_and_wait(move || service.call("echo", vec![]))
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code, CODE_NOT_ISSUED);
    }
}
