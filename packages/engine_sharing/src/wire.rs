//! Bridge wire message and its JSON byte encoding.
//!
//! ```text
//! { "type": "RESPONSE", "sender": 0, "target": 3, "messageId": "7_12", "params": [...] }
//! ```
//!
//! Reserved types are uppercase. Any other type is the name of an RPC
//! method on the receiving side.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::PeerId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Assigns role and id on connect.
    Initialization,
    /// RPC reply, correlated by message id.
    Response,
    /// New peer announcement (relay only).
    Remote,
    /// Drop a peer (relay only).
    Remove,
    /// Tear the bridge down (relay only).
    Kill,
    /// Delivery failure notice.
    Failed,
    Call(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Initialization => "INITIALIZATION",
            Self::Response => "RESPONSE",
            Self::Remote => "REMOTE",
            Self::Remove => "REMOVE",
            Self::Kill => "KILL",
            Self::Failed => "FAILED",
            Self::Call(method) => method,
        }
    }

    pub fn call(method: &str) -> Self {
        Self::from(method.to_string())
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "INITIALIZATION" => Self::Initialization,
            "RESPONSE" => Self::Response,
            "REMOTE" => Self::Remote,
            "REMOVE" => Self::Remove,
            "KILL" => Self::Kill,
            "FAILED" => Self::Failed,
            _ => Self::Call(s),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Call(method) => method,
            other => other.as_str().to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub sender: PeerId,
    pub target: PeerId,
    #[serde(rename = "messageId", default)]
    pub message_id: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl WireMessage {
    pub fn new(
        kind: MessageType,
        sender: PeerId,
        target: PeerId,
        message_id: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        Self {
            kind,
            sender,
            target,
            message_id: message_id.into(),
            params,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// First param as a peer id, as carried by REMOTE, REMOVE and FAILED.
    pub fn peer_param(&self) -> Option<PeerId> {
        self.params.first().and_then(Value::as_u64).map(PeerId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reserved_types_serialize_uppercase() {
        let msg = WireMessage::new(MessageType::Response, PeerId::MASTER, PeerId(3), "7_12", vec![json!(1)]);
        let value: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "RESPONSE", "sender": 0, "target": 3, "messageId": "7_12", "params": [1]})
        );
    }

    #[test]
    fn method_names_pass_through() {
        let msg = WireMessage::decode(br#"{"type":"sendMessage","sender":2,"target":0,"messageId":"1_1","params":[5,"hi"]}"#)
            .unwrap();
        assert_eq!(msg.kind, MessageType::Call("sendMessage".into()));
        assert_eq!(msg.sender, PeerId(2));
        assert_eq!(MessageType::call("KILL"), MessageType::Kill);
    }

    #[test]
    fn missing_optional_fields_default() {
        let msg = WireMessage::decode(br#"{"type":"KILL","sender":0,"target":1}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Kill);
        assert!(msg.message_id.is_empty());
        assert!(msg.params.is_empty());
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(WireMessage::decode(b"not json").is_err());
        assert!(WireMessage::decode(br#"{"type":"KILL"}"#).is_err());
    }

    #[test]
    fn peer_param() {
        let msg = WireMessage::new(MessageType::Remote, PeerId::MASTER, PeerId::MASTER, "", vec![json!(4)]);
        assert_eq!(msg.peer_param(), Some(PeerId(4)));
    }
}
