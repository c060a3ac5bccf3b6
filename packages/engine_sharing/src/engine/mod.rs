//! The seam to the surrounding streaming engine.
//!
//! [`SessionEngine`] is what a holder shares. [`EngineHandle`] is what
//! every instance gets back: a holder gets a local handle on its own
//! engine, an attached instance gets a remote handle that forwards the
//! same call catalog over a bridge. Callers see the same methods and the
//! same [`EngineEvent`] stream either way.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::error::CallError;
use crate::rpc::{CallDefinition, CallReceiver, CallShape, Channel, LocalChannel, RemoteChannel};
use crate::types::{InstanceId, PeerId};

mod recording;

pub use recording::RecordingEngine;

const EVENT_CAPACITY: usize = 256;

/// The engine owning the real server session.
pub trait SessionEngine: Send + Sync {
    /// Changes whenever the server session is replaced.
    fn session_generation(&self) -> u64;
    fn connect(&self);
    fn disconnect(&self);
    fn subscribe(&self, subscription: Value);
    fn unsubscribe(&self, key: &str);
    fn send_message(&self, message: &str);
    fn status(&self) -> String;
    fn events(&self) -> broadcast::Receiver<EngineEvent>;
}

/// Push notifications from the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    Data { key: String, payload: Value },
    Status { status: String, session: u64 },
    Lifecycle { phase: String },
    /// The holder behind a remote handle is gone.
    EngineDeath { reason: String },
}

// =============================================================================
// Call catalog
// =============================================================================

pub const CONNECT: CallDefinition = CallDefinition::new("connect", CallShape::NoResponse);
pub const DISCONNECT: CallDefinition = CallDefinition::new("disconnect", CallShape::NoResponse);
pub const SUBSCRIBE: CallDefinition = CallDefinition::new("subscribe", CallShape::NoResponseWithSession);
pub const UNSUBSCRIBE: CallDefinition = CallDefinition::new("unsubscribe", CallShape::NoResponseWithSession);
pub const SEND_MESSAGE: CallDefinition = CallDefinition::new("sendMessage", CallShape::NoResponseWithSession);
pub const PING: CallDefinition = CallDefinition::new("ping", CallShape::ResponseWithTimeoutAndSession);
pub const STATUS: CallDefinition = CallDefinition::new("status", CallShape::Response);

/// Master to remote: one pushed [`EngineEvent`].
pub const ON_EVENT: CallDefinition = CallDefinition::new("onEvent", CallShape::NoResponse);

/// Methods a holder serves.
pub const CATALOG: [CallDefinition; 7] = [
    CONNECT,
    DISCONNECT,
    SUBSCRIBE,
    UNSUBSCRIBE,
    SEND_MESSAGE,
    PING,
    STATUS,
];

pub fn definition(method: &str) -> Option<&'static CallDefinition> {
    CATALOG.iter().find(|def| def.name == method)
}

/// Serves the call catalog against a local engine.
pub struct EngineDispatcher {
    engine: Arc<dyn SessionEngine>,
}

impl EngineDispatcher {
    pub fn new(engine: Arc<dyn SessionEngine>) -> Self {
        Self { engine }
    }
}

impl CallReceiver for EngineDispatcher {
    fn receive(&self, from: PeerId, method: &str, params: Vec<Value>) -> Result<Option<Value>, CallError> {
        let def = definition(method).ok_or_else(|| CallError::UnknownMethod(method.to_string()))?;
        let mut params = params.into_iter();

        if def.shape.carries_session() {
            let current = self.engine.session_generation();
            match params.next().as_ref().and_then(Value::as_u64) {
                Some(token) if token == current => {}
                token => {
                    debug!(%from, method, ?token, current, "stale session token");
                    return Err(CallError::Stale {
                        token: token.unwrap_or_default(),
                    });
                }
            }
        }

        match def.name {
            "connect" => self.engine.connect(),
            "disconnect" => self.engine.disconnect(),
            "subscribe" => self.engine.subscribe(params.next().unwrap_or(Value::Null)),
            "unsubscribe" => self.engine.unsubscribe(&string_arg(params.next(), method)?),
            "sendMessage" => self.engine.send_message(&string_arg(params.next(), method)?),
            "ping" => return Ok(Some(json!("pong"))),
            "status" => {
                return Ok(Some(json!({
                    "status": self.engine.status(),
                    "session": self.engine.session_generation(),
                })));
            }
            other => return Err(CallError::UnknownMethod(other.to_string())),
        }
        Ok(None)
    }
}

fn string_arg(value: Option<Value>, method: &str) -> Result<String, CallError> {
    match value {
        Some(Value::String(s)) => Ok(s),
        _ => Err(CallError::Remote(format!("{} needs a string argument", method))),
    }
}

/// Reply to [`STATUS`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub status: String,
    pub session: u64,
}

/// Where a handle's events go. Shared with whatever feeds them.
#[derive(Clone, Debug)]
pub(crate) struct EventSink {
    events: broadcast::Sender<EngineEvent>,
    session: Arc<AtomicU64>,
    dead: Arc<AtomicBool>,
}

impl EventSink {
    pub(crate) fn new(session: u64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            session: Arc::new(AtomicU64::new(session)),
            dead: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        if let EngineEvent::Status { session, .. } = &event {
            self.session.store(*session, Ordering::SeqCst);
        }
        let _ = self.events.send(event);
    }

    /// Raise [`EngineEvent::EngineDeath`] once. Returns false if already dead.
    pub(crate) fn die(&self, reason: &str) -> bool {
        if self.dead.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(reason, "engine death");
        let _ = self.events.send(EngineEvent::EngineDeath {
            reason: reason.to_string(),
        });
        true
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }
}

/// Resources a remote handle tears down on close.
#[derive(Debug)]
pub(crate) struct Link {
    pub(crate) bridge: Bridge,
    pub(crate) cancel: CancellationToken,
}

struct HandleInner {
    channel: Channel,
    holder: Option<InstanceId>,
    sink: EventSink,
    link: Mutex<Option<Link>>,
    cancel: CancellationToken,
}

/// The engine as seen by one instance, whether it holds it or not.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("remote", &self.is_remote())
            .field("holder", &self.inner.holder)
            .field("session", &self.session())
            .finish()
    }
}

impl EngineHandle {
    /// Handle on an engine living in this context. Must be called inside a
    /// tokio runtime.
    pub fn local(engine: Arc<dyn SessionEngine>, holder: Option<InstanceId>) -> Self {
        let sink = EventSink::new(engine.session_generation());
        let cancel = CancellationToken::new();
        let mut events = engine.events();
        let channel = Channel::Local(LocalChannel::new(Arc::new(EngineDispatcher::new(engine))));

        let forward = sink.clone();
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => forward.publish(event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "local handle lagging behind engine events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Self {
            inner: Arc::new(HandleInner {
                channel,
                holder,
                sink,
                link: Mutex::new(None),
                cancel,
            }),
        }
    }

    pub(crate) fn remote(channel: RemoteChannel, holder: InstanceId, sink: EventSink, link: Link) -> Self {
        let cancel = link.cancel.clone();
        Self {
            inner: Arc::new(HandleInner {
                channel: Channel::Remote(channel),
                holder: Some(holder),
                sink,
                link: Mutex::new(Some(link)),
                cancel,
            }),
        }
    }

    /// The instance holding the engine, when known.
    pub fn holder(&self) -> Option<InstanceId> {
        self.inner.holder
    }

    pub fn is_remote(&self) -> bool {
        self.inner.channel.is_remote()
    }

    /// Session token sent with session-bound calls.
    pub fn session(&self) -> u64 {
        self.inner.sink.session()
    }

    pub fn is_dead(&self) -> bool {
        self.inner.sink.is_dead()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.sink.events.subscribe()
    }

    pub fn connect(&self) {
        self.fire(&CONNECT, Vec::new());
    }

    pub fn disconnect(&self) {
        self.fire(&DISCONNECT, Vec::new());
    }

    pub fn subscribe(&self, subscription: Value) {
        self.fire(&SUBSCRIBE, vec![json!(self.session()), subscription]);
    }

    pub fn unsubscribe(&self, key: &str) {
        self.fire(&UNSUBSCRIBE, vec![json!(self.session()), json!(key)]);
    }

    pub fn send_message(&self, message: &str) {
        self.fire(&SEND_MESSAGE, vec![json!(self.session()), json!(message)]);
    }

    pub async fn ping(&self) -> Result<(), CallError> {
        self.inner
            .channel
            .call_defined(&PING, vec![json!(self.session())])
            .await
            .map(|_| ())
    }

    pub async fn status(&self) -> Result<EngineStatus, CallError> {
        let value = self.inner.channel.call_defined(&STATUS, Vec::new()).await?;
        let status: EngineStatus = serde_json::from_value(value)
            .map_err(|e| CallError::Remote(format!("malformed status reply: {}", e)))?;
        self.inner.sink.session.store(status.session, Ordering::SeqCst);
        Ok(status)
    }

    /// Liveness probe used by the attach watchdog. Unlike [`Self::ping`] it
    /// carries no session token, so a session change on the holder can't
    /// make it look dead.
    pub(crate) async fn probe(&self, timeout: Duration) -> Result<(), CallError> {
        match &self.inner.channel {
            Channel::Remote(c) => c
                .call(STATUS.name, Vec::new(), true, Some(timeout))
                .await
                .map(|_| ()),
            Channel::Local(_) => Ok(()),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakEngineHandle {
        WeakEngineHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Raise engine death once and tear the link down.
    pub(crate) fn declare_death(&self, reason: &str) {
        if self.inner.sink.die(reason) {
            self.close();
        }
    }

    /// Stop forwarding and, for a remote handle, drop the bridge.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.channel.close();
        let link = self
            .inner
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(link) = link {
            link.cancel.cancel();
            link.bridge.dispose();
        }
    }

    fn fire(&self, def: &CallDefinition, params: Vec<Value>) {
        if let Some(Err(e)) = self.inner.channel.call_defined(def, params).now_or_never() {
            debug!(method = def.name, error = %e, "call not delivered");
        }
    }
}

/// Reference that doesn't keep a handle's tasks alive.
#[derive(Clone)]
pub(crate) struct WeakEngineHandle {
    inner: Weak<HandleInner>,
}

impl WeakEngineHandle {
    pub(crate) fn upgrade(&self) -> Option<EngineHandle> {
        self.inner.upgrade().map(|inner| EngineHandle { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> (Arc<RecordingEngine>, EngineDispatcher) {
        let engine = Arc::new(RecordingEngine::new());
        (engine.clone(), EngineDispatcher::new(engine))
    }

    #[test]
    fn catalog_shapes() {
        assert_eq!(definition("ping").unwrap().shape, CallShape::ResponseWithTimeoutAndSession);
        assert_eq!(definition("sendMessage").unwrap().shape, CallShape::NoResponseWithSession);
        assert!(definition("onEvent").is_none());
    }

    #[test]
    fn session_calls_need_current_token() {
        let (engine, dispatcher) = dispatcher();
        let current = engine.session_generation();

        dispatcher
            .receive(PeerId(1), "sendMessage", vec![json!(current), json!("hi")])
            .unwrap();
        assert_eq!(engine.messages(), vec!["hi".to_string()]);

        let err = dispatcher
            .receive(PeerId(1), "sendMessage", vec![json!(current + 1), json!("late")])
            .unwrap_err();
        assert_eq!(err, CallError::Stale { token: current + 1 });
        assert_eq!(engine.messages().len(), 1);
    }

    #[test]
    fn responses_only_for_response_shapes() {
        let (engine, dispatcher) = dispatcher();
        assert_eq!(dispatcher.receive(PeerId(1), "connect", vec![]).unwrap(), None);
        assert!(engine.is_connected());

        let status = dispatcher.receive(PeerId(1), "status", vec![]).unwrap().unwrap();
        assert_eq!(status["status"], json!("CONNECTED"));

        let session = engine.session_generation();
        assert_eq!(
            dispatcher.receive(PeerId(1), "ping", vec![json!(session)]).unwrap(),
            Some(json!("pong"))
        );
    }

    #[test]
    fn bad_calls_are_errors() {
        let (_engine, dispatcher) = dispatcher();
        assert!(matches!(
            dispatcher.receive(PeerId(1), "explode", vec![]),
            Err(CallError::UnknownMethod(_))
        ));
        assert!(matches!(
            dispatcher.receive(PeerId(1), "unsubscribe", vec![json!(1)]),
            Err(CallError::Remote(_))
        ));
    }

    #[test]
    fn events_serialize_tagged() {
        let event = EngineEvent::Status {
            status: "CONNECTED".into(),
            session: 2,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "status", "status": "CONNECTED", "session": 2})
        );
    }

    #[tokio::test]
    async fn local_handle_calls_engine_directly() {
        let engine = Arc::new(RecordingEngine::new());
        let handle = EngineHandle::local(engine.clone(), Some(InstanceId(3)));
        assert!(!handle.is_remote());

        let mut events = handle.subscribe_events();
        handle.connect();
        handle.subscribe(json!({"items": ["a"]}));
        handle.send_message("hello");
        assert_eq!(handle.status().await.unwrap().status, "CONNECTED");
        handle.ping().await.unwrap();

        assert_eq!(engine.subscriptions(), vec![json!({"items": ["a"]})]);
        assert_eq!(engine.messages(), vec!["hello".to_string()]);
        assert!(matches!(events.recv().await.unwrap(), EngineEvent::Status { .. }));
    }

    #[tokio::test]
    async fn local_handle_follows_new_sessions() {
        let engine = Arc::new(RecordingEngine::new());
        let handle = EngineHandle::local(engine.clone(), None);
        let mut events = handle.subscribe_events();

        let session = engine.new_session();
        events.recv().await.unwrap();
        assert_eq!(handle.session(), session);
        handle.send_message("fresh");
        assert_eq!(engine.messages(), vec!["fresh".to_string()]);
    }

    #[test]
    fn sink_dies_once() {
        let sink = EventSink::new(1);
        let mut rx = sink.events.subscribe();
        assert!(sink.die("gone"));
        assert!(!sink.die("again"));
        assert!(sink.is_dead());
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::EngineDeath {
                reason: "gone".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
