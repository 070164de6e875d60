//! Generic command service that records every command it receives.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tcf_core::{Callback, CommandError, Dispatcher, RemoteService};

/// Records commands and replies with canned results or injected errors.
pub struct RecordingService {
    name: String,
    dispatcher: Dispatcher,
    commands: Mutex<Vec<(String, Vec<Value>)>>,
    responses: Mutex<HashMap<String, Vec<Value>>>,
    failures: Mutex<HashMap<String, (i32, String)>>,
}

impl RecordingService {
    #[must_use]
    pub fn new(name: impl Into<String>, dispatcher: Dispatcher) -> Self {
        Self {
            name: name.into(),
            dispatcher,
            commands: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Reply to `command` with `results`.
    pub fn respond(&self, command: &str, results: Vec<Value>) {
        self.responses.lock().insert(command.to_string(), results);
    }

    /// Make every call of `command` fail.
    pub fn fail_command(&self, command: &str, code: i32, message: &str) {
        self.failures
            .lock()
            .insert(command.to_string(), (code, message.to_string()));
    }

    /// Commands received so far, with their arguments.
    #[must_use]
    pub fn commands(&self) -> Vec<(String, Vec<Value>)> {
        self.commands.lock().clone()
    }

    /// Names of the commands received so far.
    #[must_use]
    pub fn command_names(&self) -> Vec<String> {
        self.commands.lock().iter().map(|(c, _)| c.clone()).collect()
    }
}

impl RemoteService for RecordingService {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, command: &str, args: Vec<Value>, done: Callback<Vec<Value>, CommandError>) {
        self.commands.lock().push((command.to_string(), args));

        let result = match self.failures.lock().get(command) {
            Some((code, message)) => Err(CommandError::new(&self.name, command, *code, message)),
            None => Ok(self
                .responses
                .lock()
                .get(command)
                .cloned()
                .unwrap_or_default()),
        };
        self.dispatcher.invoke_later(move || done(result));
    }
}
