//! Script launcher.
//!
//! A launch opens a dedicated channel and issues the script's commands one
//! at a time, each only after the previous one succeeded. The first failure
//! ends the run. The channel is closed when the run ends, and a channel
//! closed by the remote side before the last reply ends the run with an
//! error.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tcf_core::{
    Callback, Channel, ChannelError, ChannelManager, ChannelState, CommandError, CoreConfig,
    DispatchError, Dispatcher, EventStore, Peer,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cache::ScriptCache,
    parser::{ParseError, Parser},
    token::Token,
};

const SCRIPT_CACHE_CAPACITY: usize = 16;

/// Script run error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("Failed to parse script: {0}")]
    Parse(#[from] ParseError),
    #[error("Failed to open channel to {peer}: {source}")]
    Connect { peer: String, source: ChannelError },
    #[error("Channel to {peer} is not connected")]
    NotConnected { peer: String },
    #[error("Channel to {peer} closed before the script finished: {source}")]
    ChannelClosed { peer: String, source: ChannelError },
    #[error("Service {service} is not available on {peer}")]
    ServiceUnavailable { service: String, peer: String },
    #[error("Command failed: {0}")]
    Command(#[from] CommandError),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

pub type ScriptCallback = Callback<(), ScriptError>;

/// Direction of a traced message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceDirection {
    Sent,
    Received,
}

/// Script run lifecycle and trace output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptEvent {
    /// The channel is open and the first command is about to be issued.
    Started { run: Uuid, peer: Peer },
    /// A traced command or reply.
    Output {
        run: Uuid,
        direction: TraceDirection,
        text: String,
    },
    /// The run ended; `error` is `None` on success.
    Stopped { run: Uuid, error: Option<String> },
}

impl ScriptEvent {
    #[must_use]
    pub const fn run(&self) -> Uuid {
        match self {
            Self::Started { run, .. } | Self::Output { run, .. } | Self::Stopped { run, .. } => {
                *run
            }
        }
    }
}

fn join_values(values: &[Value]) -> String {
    values
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Append ` <rest>` unless `rest` is blank.
fn with_tail(head: String, rest: &str) -> String {
    if rest.trim().is_empty() {
        head
    } else {
        format!("{head} {}", rest.trim())
    }
}

/// Runs scripts against remote agents.
#[derive(Clone)]
pub struct ScriptLauncher {
    dispatcher: Dispatcher,
    manager: Arc<dyn ChannelManager>,
    cache: Arc<ScriptCache>,
    events: Arc<EventStore<ScriptEvent>>,
}

impl ScriptLauncher {
    #[must_use]
    pub fn new(
        dispatcher: Dispatcher,
        manager: Arc<dyn ChannelManager>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            dispatcher,
            manager,
            cache: Arc::new(ScriptCache::new(SCRIPT_CACHE_CAPACITY, Parser::lenient())),
            events: Arc::new(EventStore::new(config.event_history)),
        }
    }

    /// Parse scripts with `parser` instead of the lenient default.
    #[must_use]
    pub fn with_parser(mut self, parser: Parser) -> Self {
        self.cache = Arc::new(ScriptCache::new(SCRIPT_CACHE_CAPACITY, parser));
        self
    }

    /// Events of every run started by this launcher.
    #[must_use]
    pub const fn events(&self) -> &Arc<EventStore<ScriptEvent>> {
        &self.events
    }

    /// Run `tokens` against `peer`. `done` is called on the dispatch thread,
    /// after the channel has been closed.
    ///
    /// Returns the run id used in [`ScriptEvent`]s.
    pub fn launch(
        &self,
        peer: &Peer,
        tokens: impl Into<Arc<[Token]>>,
        done: ScriptCallback,
    ) -> Uuid {
        let run = Arc::new(Run {
            id: Uuid::new_v4(),
            peer: peer.clone(),
            dispatcher: self.dispatcher.clone(),
            manager: Arc::clone(&self.manager),
            events: Arc::clone(&self.events),
            tokens: tokens.into(),
            channel: Mutex::new(None),
            done: Mutex::new(Some(done)),
            next_trace: AtomicU64::new(0),
        });
        let id = run.id;
        debug!(run = %id, peer = %peer.id, commands = run.tokens.len(), "Launching script");
        self.dispatcher.invoke_later(move || run.open());
        id
    }

    /// Parse `script` and run it. A parse error is delivered to `done`
    /// without opening a channel.
    pub fn launch_script(&self, peer: &Peer, script: &str, done: ScriptCallback) -> Uuid {
        match self.cache.tokens(script) {
            Ok(tokens) => self.launch(peer, tokens, done),
            Err(e) => {
                warn!(peer = %peer.id, "Script not launched: {e}");
                self.dispatcher.invoke_later(move || done(Err(e.into())));
                Uuid::new_v4()
            }
        }
    }

    /// Async form of [`Self::launch_script`].
    ///
    /// # Errors
    /// Returns the error that ended the run.
    pub async fn run(&self, peer: &Peer, script: &str) -> Result<(), ScriptError> {
        let (tx, rx) = oneshot::channel();
        self.launch_script(
            peer,
            script,
            Box::new(move |result: Result<(), ScriptError>| {
                let _ = tx.send(result);
            }),
        );
        rx.await
            .map_err(|_| ScriptError::Dispatch(DispatchError::Shutdown))?
    }
}

/// State of one launch. Only touched on the dispatch thread.
struct Run {
    id: Uuid,
    peer: Peer,
    dispatcher: Dispatcher,
    manager: Arc<dyn ChannelManager>,
    events: Arc<EventStore<ScriptEvent>>,
    tokens: Arc<[Token]>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    done: Mutex<Option<ScriptCallback>>,
    next_trace: AtomicU64,
}

impl Run {
    fn open(self: Arc<Self>) {
        let run = Arc::clone(&self);
        self.manager.open_channel(
            &self.peer,
            Box::new(move |result: Result<Arc<dyn Channel>, ChannelError>| match result {
                Ok(channel) => run.on_open(channel),
                Err(source) => {
                    let peer = run.peer.id.clone();
                    run.finish(Err(ScriptError::Connect { peer, source }));
                }
            }),
        );
    }

    fn on_open(self: Arc<Self>, channel: Arc<dyn Channel>) {
        *self.channel.lock() = Some(Arc::clone(&channel));
        self.events.push(ScriptEvent::Started {
            run: self.id,
            peer: self.peer.clone(),
        });

        if channel.state() != ChannelState::Open {
            let peer = self.peer.id.clone();
            self.finish(Err(ScriptError::NotConnected { peer }));
            return;
        }
        let run = Arc::clone(&self);
        channel.add_close_listener(Box::new(move |error: Option<ChannelError>| {
            run.on_channel_closed(error);
        }));

        self.execute(0);
    }

    fn is_finished(&self) -> bool {
        self.done.lock().is_none()
    }

    fn execute(self: Arc<Self>, index: usize) {
        if self.is_finished() {
            return;
        }
        let Some(token) = self.tokens.get(index) else {
            self.finish(Ok(()));
            return;
        };
        let channel = self.channel.lock().clone();
        let Some(channel) = channel else {
            return;
        };
        let Some(service) = channel.remote_service(token.service()) else {
            self.finish(Err(ScriptError::ServiceUnavailable {
                service: token.service().to_string(),
                peer: self.peer.id.clone(),
            }));
            return;
        };

        let trace = self.next_trace.fetch_add(1, Ordering::Relaxed) + 1;
        let arguments = token.json_arguments();
        self.output(
            TraceDirection::Sent,
            with_tail(
                format!("---> C {trace} {} {}", token.service(), token.command()),
                &join_values(&arguments),
            ),
        );

        let run = Arc::clone(&self);
        service.command(
            token.command(),
            arguments,
            Box::new(move |result: Result<Vec<Value>, CommandError>| {
                run.on_reply(index, trace, result);
            }),
        );
    }

    fn on_reply(
        self: Arc<Self>,
        index: usize,
        trace: u64,
        result: Result<Vec<Value>, CommandError>,
    ) {
        if self.is_finished() {
            debug!(run = %self.id, trace, "Reply after the run ended");
            return;
        }
        match result {
            Ok(results) => {
                self.output(
                    TraceDirection::Received,
                    with_tail(format!("<--- R {trace}"), &join_values(&results)),
                );
                let run = Arc::clone(&self);
                self.dispatcher.invoke_later(move || run.execute(index + 1));
            }
            Err(e) => {
                self.output(TraceDirection::Received, format!("<--- E {trace} {e}"));
                self.finish(Err(e.into()));
            }
        }
    }

    fn on_channel_closed(&self, error: Option<ChannelError>) {
        if self.is_finished() {
            return;
        }
        let source =
            error.unwrap_or_else(|| ChannelError::Closed("closed by the remote peer".to_string()));
        self.finish(Err(ScriptError::ChannelClosed {
            peer: self.peer.id.clone(),
            source,
        }));
    }

    fn output(&self, direction: TraceDirection, text: String) {
        self.events.push(ScriptEvent::Output {
            run: self.id,
            direction,
            text,
        });
    }

    /// Close the channel and report `result`. Only the first call counts.
    fn finish(&self, result: Result<(), ScriptError>) {
        let done = self.done.lock().take();
        let Some(done) = done else {
            return;
        };
        let channel = self.channel.lock().take();
        if let Some(channel) = &channel {
            self.manager.close_channel(channel);
        }

        match &result {
            Ok(()) => info!(run = %self.id, peer = %self.peer.id, "Script completed"),
            Err(e) => warn!(run = %self.id, peer = %self.peer.id, "Script failed: {e}"),
        }
        if channel.is_some() {
            self.events.push(ScriptEvent::Stopped {
                run: self.id,
                error: result.as_ref().err().map(ToString::to_string),
            });
        }
        done(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trace_text() {
        assert_eq!(
            with_tail("---> C 1 Locator sync".to_string(), &join_values(&[])),
            "---> C 1 Locator sync"
        );
        assert_eq!(
            with_tail(
                "<--- R 2".to_string(),
                &join_values(&[json!("h1"), json!({"a": 1})])
            ),
            r#"<--- R 2 "h1" {"a":1}"#
        );
    }

    #[test]
    fn test_event_serialization() {
        let run = Uuid::nil();
        let event = ScriptEvent::Stopped { run, error: None };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "stopped");
        assert_eq!(event.run(), run);

        let event = ScriptEvent::Output {
            run,
            direction: TraceDirection::Sent,
            text: "---> C 1 Locator sync".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["direction"], "sent");
        let back: ScriptEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
