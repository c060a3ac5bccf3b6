//! Message transports between contexts.
//!
//! Both variants hand out an event receiver at start. Events arrive in
//! the order the bridge observed them:
//!
//! - [`BridgeEvent::Ready`] once the bridge knows its role and id
//! - [`BridgeEvent::Message`] for every non-control message addressed to us
//! - [`BridgeEvent::MessageFail`] when a message could not be delivered
//! - [`BridgeEvent::Remote`] on the master when a new peer joins
//! - [`BridgeEvent::Terminated`] when a peer (or the whole bridge) is gone

use serde_json::Value;

use crate::types::PeerId;
use crate::wire::{MessageType, WireMessage};

pub mod direct;
pub mod relay;

pub use direct::{DirectBridge, PeerRef};
pub use relay::{RelayBridge, RelayHub};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeRole {
    Master,
    Remote,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BridgeEvent {
    Ready { role: BridgeRole, id: PeerId },
    Message(WireMessage),
    MessageFail { target: PeerId, message_id: String },
    Remote(PeerId),
    /// `peer` is `PeerId::MASTER` on a remote when the whole bridge died.
    Terminated { peer: PeerId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BridgeKind {
    Direct,
    Relay,
}

#[derive(Clone, Debug)]
pub enum Bridge {
    Direct(DirectBridge),
    Relay(RelayBridge),
}

impl Bridge {
    pub fn kind(&self) -> BridgeKind {
        match self {
            Self::Direct(_) => BridgeKind::Direct,
            Self::Relay(_) => BridgeKind::Relay,
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            Self::Direct(b) => b.is_ready(),
            Self::Relay(b) => b.is_ready(),
        }
    }

    pub fn role(&self) -> Option<BridgeRole> {
        match self {
            Self::Direct(b) => b.role(),
            Self::Relay(b) => b.role(),
        }
    }

    pub fn id(&self) -> Option<PeerId> {
        match self {
            Self::Direct(b) => b.id(),
            Self::Relay(b) => b.id(),
        }
    }

    /// Queue a message. Returns false if it can't even be queued; a later
    /// delivery failure is reported as [`BridgeEvent::MessageFail`].
    pub fn send_message(
        &self,
        target: PeerId,
        kind: MessageType,
        message_id: &str,
        params: Vec<Value>,
    ) -> bool {
        match self {
            Self::Direct(b) => b.send_message(target, kind, message_id, params),
            Self::Relay(b) => b.send_message(target, kind, message_id, params),
        }
    }

    pub fn remove_target(&self, target: PeerId) {
        match self {
            Self::Direct(b) => b.remove_target(target),
            Self::Relay(b) => b.remove_target(target),
        }
    }

    pub fn dispose(&self) {
        match self {
            Self::Direct(b) => b.dispose(),
            Self::Relay(b) => b.dispose(),
        }
    }
}

impl From<DirectBridge> for Bridge {
    fn from(b: DirectBridge) -> Self {
        Self::Direct(b)
    }
}

impl From<RelayBridge> for Bridge {
    fn from(b: RelayBridge) -> Self {
        Self::Relay(b)
    }
}
