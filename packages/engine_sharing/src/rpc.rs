//! RPC on top of a bridge.
//!
//! A [`RemoteChannel`] talks to exactly one peer. Calls get ids of the form
//! `<channelId>_<seq>`; responses are matched by that id, never by arrival
//! order. Calls issued before the bridge is ready are buffered and flushed
//! in issue order.
//!
//! Response params are `[value]` on success and `[null, {"error": reason}]`
//! when the receiver failed.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::error::CallError;
use crate::types::PeerId;
use crate::wire::{MessageType, WireMessage};

/// How a method is called, fixed per method name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallShape {
    NoResponse,
    /// First param is the caller's session token.
    NoResponseWithSession,
    Response,
    /// First param is the caller's session token; the call times out.
    ResponseWithTimeoutAndSession,
}

impl CallShape {
    pub fn expects_response(self) -> bool {
        matches!(self, Self::Response | Self::ResponseWithTimeoutAndSession)
    }

    pub fn carries_session(self) -> bool {
        matches!(
            self,
            Self::NoResponseWithSession | Self::ResponseWithTimeoutAndSession
        )
    }

    pub fn has_timeout(self) -> bool {
        matches!(self, Self::ResponseWithTimeoutAndSession)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallDefinition {
    pub name: &'static str,
    pub shape: CallShape,
}

impl CallDefinition {
    pub const fn new(name: &'static str, shape: CallShape) -> Self {
        Self { name, shape }
    }
}

pub type CallResult = Result<Value, CallError>;

/// Target of incoming calls.
///
/// `Ok(Some(v))` is sent back as the response, `Ok(None)` sends nothing.
/// `Err(CallError::Stale { .. })` drops the call silently on both channel
/// kinds; a local caller sees `Value::Null`.
pub trait CallReceiver: Send + Sync {
    fn receive(&self, from: PeerId, method: &str, params: Vec<Value>) -> Result<Option<Value>, CallError>;
}

struct Outgoing {
    message_id: String,
    method: String,
    params: Vec<Value>,
}

#[derive(Default)]
struct ChannelState {
    seq: u64,
    ready: bool,
    closed: bool,
    buffered: VecDeque<Outgoing>,
    pending: HashMap<String, oneshot::Sender<CallResult>>,
}

struct ChannelInner {
    channel_id: u64,
    bridge: Bridge,
    target: PeerId,
    receiver: Arc<dyn CallReceiver>,
    call_timeout: Duration,
    state: Mutex<ChannelState>,
}

/// Channel to one peer over a bridge.
#[derive(Clone)]
pub struct RemoteChannel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for RemoteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteChannel")
            .field("channel_id", &self.inner.channel_id)
            .field("target", &self.inner.target)
            .finish()
    }
}

impl RemoteChannel {
    pub fn new(
        channel_id: u64,
        bridge: Bridge,
        target: PeerId,
        receiver: Arc<dyn CallReceiver>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                channel_id,
                bridge,
                target,
                receiver,
                call_timeout,
                state: Mutex::new(ChannelState::default()),
            }),
        }
    }

    pub fn target(&self) -> PeerId {
        self.inner.target
    }

    pub fn bridge(&self) -> &Bridge {
        &self.inner.bridge
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Issue a call according to its definition.
    pub fn call_defined(&self, def: &CallDefinition, params: Vec<Value>) -> BoxFuture<'static, CallResult> {
        let timeout = def.shape.has_timeout().then_some(self.inner.call_timeout);
        self.call(def.name, params, def.shape.expects_response(), timeout)
    }

    /// Issue a call. The wire side effect happens before this returns, so
    /// the issue order of calls is the order they reach the bridge. The
    /// returned future only waits for the result.
    pub fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        expect_response: bool,
        timeout: Option<Duration>,
    ) -> BoxFuture<'static, CallResult> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let (message_id, rx) = {
            let mut state = self.state();
            if state.closed {
                return future::ready(Err(CallError::Closed)).boxed();
            }
            state.seq += 1;
            let message_id = format!("{}_{}", self.inner.channel_id, state.seq);

            let rx = expect_response.then(|| {
                let (tx, rx) = oneshot::channel();
                state.pending.insert(message_id.clone(), tx);
                rx
            });

            let outgoing = Outgoing {
                message_id: message_id.clone(),
                method: method.to_string(),
                params,
            };
            if state.ready {
                if !self.transmit(outgoing) {
                    state.pending.remove(&message_id);
                    return future::ready(Err(CallError::DeliveryFailed { message_id })).boxed();
                }
            } else {
                debug!(message_id = %message_id, method, "buffering call until channel is ready");
                state.buffered.push_back(outgoing);
            }
            (message_id, rx)
        };

        let Some(rx) = rx else {
            return future::ready(Ok(Value::Null)).boxed();
        };

        let channel = self.clone();
        async move {
            match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx).await {
                    Ok(result) => result.unwrap_or(Err(CallError::Closed)),
                    Err(_) => {
                        channel.forget(&message_id);
                        Err(CallError::Timeout {
                            message_id,
                            timeout_ms: timeout.map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
                        })
                    }
                },
                None => rx.await.unwrap_or(Err(CallError::Closed)),
            }
        }
        .boxed()
    }

    /// The bridge is ready: flush buffered calls in issue order.
    pub fn set_ready(&self) {
        let mut state = self.state();
        if state.ready || state.closed {
            return;
        }
        state.ready = true;
        while let Some(outgoing) = state.buffered.pop_front() {
            let message_id = outgoing.message_id.clone();
            if !self.transmit(outgoing) {
                if let Some(tx) = state.pending.remove(&message_id) {
                    let _ = tx.send(Err(CallError::DeliveryFailed { message_id }));
                }
            }
        }
    }

    /// Handle a message the bridge delivered from our peer.
    pub fn on_message(&self, msg: WireMessage) {
        match msg.kind {
            MessageType::Response => self.on_response(msg),
            MessageType::Call(method) => {
                match self.inner.receiver.receive(msg.sender, &method, msg.params) {
                    Ok(Some(value)) => self.respond(msg.sender, &msg.message_id, vec![value]),
                    Ok(None) => {}
                    Err(CallError::Stale { token }) => {
                        debug!(method = %method, token, "dropping call from a stale session");
                    }
                    Err(e) => {
                        debug!(method = %method, error = %e, "call failed");
                        self.respond(
                            msg.sender,
                            &msg.message_id,
                            vec![Value::Null, json!({ "error": e.to_string() })],
                        );
                    }
                }
            }
            other => debug!(kind = other.as_str(), "ignoring control message on channel"),
        }
    }

    /// The bridge could not deliver `message_id`.
    pub fn on_message_fail(&self, message_id: &str) {
        let tx = self.state().pending.remove(message_id);
        if let Some(tx) = tx {
            let _ = tx.send(Err(CallError::DeliveryFailed {
                message_id: message_id.to_string(),
            }));
        }
    }

    /// The peer is gone: reject everything outstanding.
    pub fn close(&self) {
        let pending = {
            let mut state = self.state();
            state.closed = true;
            state.buffered.clear();
            std::mem::take(&mut state.pending)
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(CallError::Closed));
        }
    }

    fn on_response(&self, msg: WireMessage) {
        let Some(tx) = self.state().pending.remove(&msg.message_id) else {
            debug!(message_id = %msg.message_id, "response without a pending call");
            return;
        };
        let mut params = msg.params.into_iter();
        let value = params.next().unwrap_or(Value::Null);
        let result = match params.next() {
            Some(failure) => Err(CallError::Remote(
                failure
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            )),
            None => Ok(value),
        };
        let _ = tx.send(result);
    }

    fn respond(&self, to: PeerId, message_id: &str, params: Vec<Value>) {
        if !self
            .inner
            .bridge
            .send_message(to, MessageType::Response, message_id, params)
        {
            warn!(%to, message_id, "could not send response");
        }
    }

    fn transmit(&self, outgoing: Outgoing) -> bool {
        self.inner.bridge.send_message(
            self.inner.target,
            MessageType::call(&outgoing.method),
            &outgoing.message_id,
            outgoing.params,
        )
    }

    fn forget(&self, message_id: &str) {
        let mut state = self.state();
        state.pending.remove(message_id);
        state.buffered.retain(|o| o.message_id != message_id);
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Same-context channel: invokes the receiver directly.
#[derive(Clone)]
pub struct LocalChannel {
    receiver: Arc<dyn CallReceiver>,
}

impl fmt::Debug for LocalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalChannel").finish_non_exhaustive()
    }
}

impl LocalChannel {
    pub fn new(receiver: Arc<dyn CallReceiver>) -> Self {
        Self { receiver }
    }

    pub fn call_defined(&self, def: &CallDefinition, params: Vec<Value>) -> BoxFuture<'static, CallResult> {
        self.call(def.name, params, def.shape.expects_response())
    }

    pub fn call(&self, method: &str, params: Vec<Value>, expect_response: bool) -> BoxFuture<'static, CallResult> {
        let result = match self.receiver.receive(PeerId::MASTER, method, params) {
            Ok(Some(value)) if expect_response => Ok(value),
            Ok(_) => Ok(Value::Null),
            Err(CallError::Stale { token }) => {
                debug!(method = %method, token, "dropping call from a stale session");
                Ok(Value::Null)
            }
            Err(e) => Err(e),
        };
        future::ready(result).boxed()
    }
}

#[derive(Clone, Debug)]
pub enum Channel {
    Remote(RemoteChannel),
    Local(LocalChannel),
}

impl Channel {
    pub fn call_defined(&self, def: &CallDefinition, params: Vec<Value>) -> BoxFuture<'static, CallResult> {
        match self {
            Self::Remote(c) => c.call_defined(def, params),
            Self::Local(c) => c.call_defined(def, params),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub fn close(&self) {
        if let Self::Remote(c) = self {
            c.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeEvent, DirectBridge};
    use tokio::sync::mpsc;

    struct Echo;

    impl CallReceiver for Echo {
        fn receive(&self, _from: PeerId, method: &str, params: Vec<Value>) -> Result<Option<Value>, CallError> {
            match method {
                "echo" => Ok(Some(Value::Array(params))),
                "quiet" => Ok(None),
                "stale" => Err(CallError::Stale { token: 1 }),
                other => Err(CallError::UnknownMethod(other.to_string())),
            }
        }
    }

    /// Master channel serving `Echo` and a remote channel calling it.
    async fn linked() -> (RemoteChannel, RemoteChannel) {
        let (master, mut master_rx) = DirectBridge::master();
        master_rx.recv().await;
        let (remote, mut remote_rx) = DirectBridge::connect(master.peer_ref());
        let Some(BridgeEvent::Remote(peer)) = master_rx.recv().await else {
            panic!("expected remote");
        };
        remote_rx.recv().await;

        let serving = RemoteChannel::new(1, master.into(), peer, Arc::new(Echo), Duration::from_secs(1));
        let calling = RemoteChannel::new(2, remote.into(), PeerId::MASTER, Arc::new(Echo), Duration::from_secs(1));
        serving.set_ready();
        calling.set_ready();
        spawn_pump(serving.clone(), master_rx);
        spawn_pump(calling.clone(), remote_rx);
        (serving, calling)
    }

    fn spawn_pump(channel: RemoteChannel, mut rx: mpsc::UnboundedReceiver<BridgeEvent>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    BridgeEvent::Message(msg) => channel.on_message(msg),
                    BridgeEvent::MessageFail { message_id, .. } => channel.on_message_fail(&message_id),
                    BridgeEvent::Terminated { .. } => channel.close(),
                    _ => {}
                }
            }
        });
    }

    #[tokio::test]
    async fn call_and_response() {
        let (_serving, calling) = linked().await;
        let value = calling.call("echo", vec![json!(1), json!("a")], true, None).await.unwrap();
        assert_eq!(value, json!([1, "a"]));
        assert_eq!(calling.pending_count(), 0);
    }

    #[tokio::test]
    async fn fire_and_forget_resolves_immediately() {
        let (_serving, calling) = linked().await;
        assert_eq!(calling.call("quiet", vec![], false, None).await.unwrap(), Value::Null);
        assert_eq!(calling.pending_count(), 0);
    }

    #[tokio::test]
    async fn remote_errors_are_reported() {
        let (_serving, calling) = linked().await;
        let err = calling.call("nope", vec![], true, None).await.unwrap_err();
        assert_eq!(err, CallError::Remote("unknown method nope".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_calls_time_out_silently() {
        let (_serving, calling) = linked().await;
        let err = calling
            .call("stale", vec![], true, Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout { timeout_ms: 200, .. }));
        assert_eq!(calling.pending_count(), 0);
    }

    #[tokio::test]
    async fn message_ids_are_channel_scoped_and_sequential() {
        let (master, mut master_rx) = DirectBridge::master();
        master_rx.recv().await;
        let (remote, mut remote_rx) = DirectBridge::connect(master.peer_ref());
        master_rx.recv().await;
        remote_rx.recv().await;

        let channel = RemoteChannel::new(7, remote.into(), PeerId::MASTER, Arc::new(Echo), Duration::from_secs(1));
        channel.set_ready();
        drop(channel.call("quiet", vec![], false, None));
        drop(channel.call("quiet", vec![], false, None));

        for expected in ["7_1", "7_2"] {
            let Some(BridgeEvent::Message(msg)) = master_rx.recv().await else {
                panic!("expected message");
            };
            assert_eq!(msg.message_id, expected);
        }
    }

    #[tokio::test]
    async fn buffered_calls_flush_in_order() {
        let (master, mut master_rx) = DirectBridge::master();
        master_rx.recv().await;
        let (remote, mut remote_rx) = DirectBridge::connect(master.peer_ref());
        master_rx.recv().await;
        remote_rx.recv().await;

        let channel = RemoteChannel::new(3, remote.into(), PeerId::MASTER, Arc::new(Echo), Duration::from_secs(1));
        for i in 0..5 {
            drop(channel.call("quiet", vec![json!(i)], false, None));
        }
        channel.set_ready();

        for i in 0..5 {
            let Some(BridgeEvent::Message(msg)) = master_rx.recv().await else {
                panic!("expected message");
            };
            assert_eq!(msg.params, vec![json!(i)]);
        }
    }

    #[tokio::test]
    async fn close_rejects_pending_calls() {
        let (master, mut master_rx) = DirectBridge::master();
        master_rx.recv().await;
        let channel = RemoteChannel::new(1, master.into(), PeerId(1), Arc::new(Echo), Duration::from_secs(1));
        let pending = channel.call("echo", vec![], true, None);
        channel.close();
        assert_eq!(pending.await, Err(CallError::Closed));
        assert_eq!(channel.call("echo", vec![], true, None).await, Err(CallError::Closed));
    }

    #[tokio::test]
    async fn delivery_failure_rejects_immediately() {
        let (master, mut master_rx) = DirectBridge::master();
        master_rx.recv().await;
        let channel = RemoteChannel::new(1, master.into(), PeerId(9), Arc::new(Echo), Duration::from_secs(1));
        channel.set_ready();
        let err = channel.call("echo", vec![], true, None).await.unwrap_err();
        assert_eq!(err, CallError::DeliveryFailed { message_id: "1_1".into() });

        let pending = {
            let buffered = RemoteChannel::new(2, channel.bridge().clone(), PeerId(9), Arc::new(Echo), Duration::from_secs(1));
            let call = buffered.call("echo", vec![], true, None);
            buffered.on_message_fail("2_1");
            call
        };
        assert_eq!(pending.await, Err(CallError::DeliveryFailed { message_id: "2_1".into() }));
    }

    #[tokio::test]
    async fn local_channel_wraps_results() {
        let channel = LocalChannel::new(Arc::new(Echo));
        assert_eq!(channel.call("echo", vec![json!(1)], true).await, Ok(json!([1])));
        assert_eq!(channel.call("echo", vec![json!(1)], false).await, Ok(Value::Null));
    }

    #[tokio::test]
    async fn local_channel_drops_stale_calls_like_remote() {
        let channel = LocalChannel::new(Arc::new(Echo));
        assert_eq!(channel.call("stale", vec![], true).await, Ok(Value::Null));
        assert_eq!(channel.call("stale", vec![], false).await, Ok(Value::Null));
    }
}
