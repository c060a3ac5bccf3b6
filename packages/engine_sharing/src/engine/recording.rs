use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::broadcast;

use super::{EVENT_CAPACITY, EngineEvent, SessionEngine};

#[derive(Debug, Default)]
struct RecordingState {
    generation: u64,
    connected: bool,
    subscriptions: Vec<Value>,
    messages: Vec<String>,
}

/// In-memory engine without a server behind it. It records what it was
/// asked to do and emits the matching status events. Backs simulated
/// contexts and tests.
#[derive(Debug)]
pub struct RecordingEngine {
    state: Mutex<RecordingState>,
    events: broadcast::Sender<EngineEvent>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(RecordingState {
                generation: 1,
                ..Default::default()
            }),
            events,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn subscriptions(&self) -> Vec<Value> {
        self.state().subscriptions.clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.state().messages.clone()
    }

    /// Replace the server session. Returns the new generation.
    pub fn new_session(&self) -> u64 {
        let (generation, status) = {
            let mut state = self.state();
            state.generation += 1;
            state.subscriptions.clear();
            (state.generation, status_of(&state))
        };
        self.emit(EngineEvent::Status {
            status,
            session: generation,
        });
        generation
    }

    /// Push a data update to every listener.
    pub fn push(&self, key: &str, payload: Value) {
        self.emit(EngineEvent::Data {
            key: key.to_string(),
            payload,
        });
    }

    fn set_connected(&self, connected: bool) {
        let (generation, status) = {
            let mut state = self.state();
            state.connected = connected;
            (state.generation, status_of(&state))
        };
        self.emit(EngineEvent::Status {
            status,
            session: generation,
        });
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn state(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RecordingEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn status_of(state: &RecordingState) -> String {
    if state.connected {
        "CONNECTED".to_string()
    } else {
        "DISCONNECTED".to_string()
    }
}

impl SessionEngine for RecordingEngine {
    fn session_generation(&self) -> u64 {
        self.state().generation
    }

    fn connect(&self) {
        self.set_connected(true);
    }

    fn disconnect(&self) {
        self.set_connected(false);
    }

    fn subscribe(&self, subscription: Value) {
        self.state().subscriptions.push(subscription);
    }

    fn unsubscribe(&self, key: &str) {
        self.state()
            .subscriptions
            .retain(|s| s.get("key").and_then(Value::as_str) != Some(key));
    }

    fn send_message(&self, message: &str) {
        self.state().messages.push(message.to_string());
    }

    fn status(&self) -> String {
        status_of(&self.state())
    }

    fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}
