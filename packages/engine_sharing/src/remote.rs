//! Attaching to a holder found by discovery.
//!
//! [`attach`] turns a presence record into an [`EngineHandle`]: a local
//! one when the holder lives in this context, otherwise a remote one
//! over the relay or the direct bridge the record advertises. A remote
//! handle raises [`EngineEvent::EngineDeath`] once when its bridge is
//! killed or the holder stops answering the liveness probe.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, BridgeEvent, BridgeRole, DirectBridge, PeerRef, RelayBridge};
use crate::engine::{EngineEvent, EngineHandle, EventSink, Link, ON_EVENT, WeakEngineHandle};
use crate::error::{AttachError, CallError};
use crate::rpc::{CallReceiver, RemoteChannel};
use crate::sharing::SharingDeps;
use crate::store::status::PresenceRecord;
use crate::types::{InstanceId, PeerId};

/// Receives what a holder pushes to its remotes.
struct RemoteReceiver {
    sink: EventSink,
}

impl CallReceiver for RemoteReceiver {
    fn receive(&self, from: PeerId, method: &str, params: Vec<Value>) -> Result<Option<Value>, CallError> {
        if method != ON_EVENT.name {
            return Err(CallError::UnknownMethod(method.to_string()));
        }
        let payload = params
            .into_iter()
            .next()
            .ok_or_else(|| CallError::Remote("onEvent without an event".into()))?;
        let event: EngineEvent = serde_json::from_value(payload)
            .map_err(|e| CallError::Remote(format!("malformed event from {}: {}", from, e)))?;
        self.sink.publish(event);
        Ok(None)
    }
}

/// Open a handle on the engine held by `id`. `preferred` is tried before
/// the advertised direct address.
pub async fn attach(
    id: InstanceId,
    record: &PresenceRecord,
    preferred: Option<PeerRef>,
    deps: &SharingDeps,
) -> Result<EngineHandle, AttachError> {
    if let Some(engine) = deps.directory.engine(id) {
        debug!(holder = %id, "holder lives in this context");
        return Ok(EngineHandle::local(engine, Some(id)));
    }

    let (bridge, mut events) = open_bridge(id, record, preferred, deps)?;
    let timeout = deps.timings.call_timeout;

    let ready = tokio::time::timeout(timeout, async {
        while let Some(event) = events.recv().await {
            match event {
                BridgeEvent::Ready {
                    role: BridgeRole::Remote,
                    ..
                } => return Ok(()),
                // we'd be the first on the holder's relay: it's not there
                BridgeEvent::Ready { .. } => return Err(AttachError::Unreachable(id)),
                BridgeEvent::Terminated { .. } => return Err(AttachError::Terminated(id)),
                _ => {}
            }
        }
        Err(AttachError::Terminated(id))
    })
    .await;
    match ready {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            bridge.dispose();
            return Err(e);
        }
        Err(_) => {
            bridge.dispose();
            return Err(AttachError::Timeout(id, timeout));
        }
    }

    let sink = EventSink::new(0);
    let channel = RemoteChannel::new(
        deps.directory.next_channel_id(),
        bridge.clone(),
        PeerId::MASTER,
        Arc::new(RemoteReceiver { sink: sink.clone() }),
        timeout,
    );
    channel.set_ready();

    let cancel = CancellationToken::new();
    let handle = EngineHandle::remote(
        channel.clone(),
        id,
        sink.clone(),
        Link {
            bridge: bridge.clone(),
            cancel: cancel.clone(),
        },
    );
    tokio::spawn(pump(channel, bridge, sink, events, cancel.clone()));

    match tokio::time::timeout(timeout, handle.status()).await {
        Ok(Ok(status)) => {
            info!(holder = %id, session = status.session, status = %status.status, "attached to holder");
        }
        Ok(Err(e)) => {
            handle.close();
            return Err(e.into());
        }
        Err(_) => {
            handle.close();
            return Err(AttachError::Timeout(id, timeout));
        }
    }

    tokio::spawn(watchdog(handle.downgrade(), deps.clone(), cancel));
    Ok(handle)
}

fn open_bridge(
    id: InstanceId,
    record: &PresenceRecord,
    preferred: Option<PeerRef>,
    deps: &SharingDeps,
) -> Result<(Bridge, mpsc::UnboundedReceiver<BridgeEvent>), AttachError> {
    if let Some(address) = &record.worker_address {
        match deps.env.find_relay(address) {
            Some(hub) => {
                let (bridge, events) = RelayBridge::connect(hub);
                return Ok((bridge.into(), events));
            }
            None => debug!(holder = %id, address, "relay not reachable, trying direct"),
        }
    }

    let peer = preferred.filter(PeerRef::is_alive).or_else(|| {
        let name = record.direct_address.clone().unwrap_or_else(|| id.peer_name());
        deps.env.resolve(&name)
    });
    match peer {
        Some(peer) => {
            let (bridge, events) = DirectBridge::connect(peer);
            Ok((bridge.into(), events))
        }
        None => Err(AttachError::Unreachable(id)),
    }
}

/// Feed bridge events into the channel until the bridge goes away.
async fn pump(
    channel: RemoteChannel,
    bridge: Bridge,
    sink: EventSink,
    mut events: mpsc::UnboundedReceiver<BridgeEvent>,
    cancel: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(BridgeEvent::Message(msg)) => channel.on_message(msg),
                Some(BridgeEvent::MessageFail { message_id, .. }) => channel.on_message_fail(&message_id),
                Some(BridgeEvent::Terminated { peer }) if peer.is_master() => break "holder bridge terminated",
                Some(_) => {}
                None => break "holder bridge closed",
            }
        }
    };
    channel.close();
    sink.die(reason);
    bridge.dispose();
    cancel.cancel();
}

/// Probe the holder every heartbeat. A fatal failure means it's gone.
async fn watchdog(handle: WeakEngineHandle, deps: SharingDeps, cancel: CancellationToken) {
    let heartbeat = deps.timings.heartbeat;
    let timeout = deps.timings.call_timeout;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(heartbeat) => {}
        }
        let Some(handle) = handle.upgrade() else {
            break;
        };
        match handle.probe(timeout).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                warn!(holder = ?handle.holder(), error = %e, "holder stopped answering");
                handle.declare_death("holder unreachable");
                break;
            }
            Err(e) => debug!(holder = ?handle.holder(), error = %e, "probe failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Directory;
    use crate::engine::{RecordingEngine, SessionEngine};
    use crate::environment::{Environment, LocalEnvironment};
    use crate::host::EngineHost;
    use crate::store::MemoryStore;
    use crate::store::status::Origin;
    use crate::types::Namespace;
    use serde_json::json;
    use std::time::Duration;

    fn context(env: &Arc<LocalEnvironment>, first_id: u64) -> SharingDeps {
        SharingDeps::new(
            Arc::new(MemoryStore::new()),
            env.clone(),
            Arc::new(Directory::starting_at(first_id)),
            Origin::new("h", "b1", "https"),
        )
    }

    fn record_for(host: &EngineHost, deps: &SharingDeps) -> PresenceRecord {
        let (direct, worker) = host.addresses().advertised();
        PresenceRecord::new(0, &deps.origin, direct, worker)
    }

    async fn next_event(events: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn same_context_holder_gets_local_handle() {
        let env = Arc::new(LocalEnvironment::new());
        let deps = context(&env, 1);
        deps.directory.register_engine(InstanceId(1), Arc::new(RecordingEngine::new()));
        let record = PresenceRecord::new(0, &deps.origin, Some("esh-1".into()), None);

        let handle = attach(InstanceId(1), &record, None, &deps).await.unwrap();
        assert!(!handle.is_remote());
        assert_eq!(handle.holder(), Some(InstanceId(1)));
    }

    #[tokio::test]
    async fn attaches_through_relay() {
        let env = Arc::new(LocalEnvironment::new());
        let holder = context(&env, 10);
        let engine = Arc::new(RecordingEngine::new());
        let ns = Namespace::new("app1").unwrap();
        let host = EngineHost::start(InstanceId(10), &ns, engine.clone(), &holder);

        let slave = context(&env, 20);
        let handle = attach(InstanceId(10), &record_for(&host, &holder), None, &slave)
            .await
            .unwrap();
        assert!(handle.is_remote());
        assert_eq!(handle.session(), engine.session_generation());

        let mut events = handle.subscribe_events();
        handle.connect();
        assert!(matches!(next_event(&mut events).await, EngineEvent::Status { .. }));
        assert!(engine.is_connected());

        handle.send_message("hello");
        handle.ping().await.unwrap();
        assert_eq!(engine.messages(), vec!["hello".to_string()]);

        engine.push("quotes", json!(1));
        assert_eq!(
            next_event(&mut events).await,
            EngineEvent::Data {
                key: "quotes".into(),
                payload: json!(1)
            }
        );
    }

    #[tokio::test]
    async fn attaches_directly_without_relay() {
        let env = Arc::new(LocalEnvironment::without_relay());
        let holder = context(&env, 10);
        let engine = Arc::new(RecordingEngine::new());
        let ns = Namespace::new("app1").unwrap();
        let host = EngineHost::start(InstanceId(10), &ns, engine.clone(), &holder);

        let slave = context(&env, 20);
        let handle = attach(InstanceId(10), &record_for(&host, &holder), None, &slave)
            .await
            .unwrap();
        handle.subscribe(json!({"key": "quotes"}));
        assert_eq!(handle.status().await.unwrap().status, "DISCONNECTED");
        assert_eq!(engine.subscriptions(), vec![json!({"key": "quotes"})]);
    }

    #[tokio::test]
    async fn holder_dispose_is_engine_death() {
        let env = Arc::new(LocalEnvironment::new());
        let holder = context(&env, 10);
        let ns = Namespace::new("app1").unwrap();
        let host = EngineHost::start(InstanceId(10), &ns, Arc::new(RecordingEngine::new()), &holder);

        let slave = context(&env, 20);
        let handle = attach(InstanceId(10), &record_for(&host, &holder), None, &slave)
            .await
            .unwrap();
        let mut events = handle.subscribe_events();

        host.dispose();
        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::EngineDeath { .. }
        ));
        assert!(handle.is_dead());
        assert_eq!(handle.status().await.unwrap_err(), CallError::Closed);
    }

    #[tokio::test]
    async fn unreachable_holder_is_an_error() {
        let env = Arc::new(LocalEnvironment::new());
        let deps = context(&env, 1);
        let record = PresenceRecord::new(0, &deps.origin, Some("esh-77".into()), None);
        assert!(matches!(
            attach(InstanceId(77), &record, None, &deps).await,
            Err(AttachError::Unreachable(InstanceId(77)))
        ));

        // a relay address nobody serves falls back to the direct name
        let record = PresenceRecord::new(0, &deps.origin, None, Some("esh-relay-77".into()));
        assert!(matches!(
            attach(InstanceId(77), &record, None, &deps).await,
            Err(AttachError::Unreachable(_))
        ));
        assert!(env.find_relay("esh-relay-77").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_holder_times_out() {
        let env = Arc::new(LocalEnvironment::without_relay());
        let deps = context(&env, 1);
        // a context that accepts messages but never answers
        let (tx, _rx) = mpsc::unbounded_channel();
        env.publish("esh-5", PeerRef::new(tx));
        let record = PresenceRecord::new(0, &deps.origin, Some("esh-5".into()), None);

        let err = attach(InstanceId(5), &record, None, &deps).await.unwrap_err();
        assert!(matches!(err, AttachError::Timeout(InstanceId(5), _)));
    }
}
