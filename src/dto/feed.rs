use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::dto::replication::ChangeEvent;

#[derive(Clone, Debug)]
/// Dispatched payload carried across the change feed channel.
pub struct ServerEvent {
    pub event: Option<String>,
    pub data: String,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }
}

/// Messages pushed on `/subscribe-changes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FeedMessage {
    /// First message of every subscription.
    #[serde(rename_all = "camelCase")]
    Connected { node_id: String, timestamp_ms: i64 },
    /// A mutation committed on the publishing node.
    DataChange(ChangeEvent),
    /// Heartbeat so idle subscribers can detect a dead stream.
    #[serde(rename_all = "camelCase")]
    Ping { timestamp_ms: i64 },
}

impl FeedMessage {
    /// Name used for the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedMessage::Connected { .. } => "connected",
            FeedMessage::DataChange(_) => "dataChange",
            FeedMessage::Ping { .. } => "ping",
        }
    }

    /// Serialise into an event ready for the feed hub.
    pub fn to_server_event(&self) -> serde_json::Result<ServerEvent> {
        ServerEvent::json(Some(self.kind().to_owned()), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_messages_are_tagged_by_type() {
        let message = FeedMessage::Connected {
            node_id: "node-a".into(),
            timestamp_ms: 7,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "connected", "nodeId": "node-a", "timestampMs": 7})
        );

        let raw = r#"{"type":"dataChange","table":"scores_coop","action":"INSERT","data":{"level":2,"score":10,"time":3.5},"timestampMs":9,"originNodeId":"node-b"}"#;
        let parsed: FeedMessage = serde_json::from_str(raw).unwrap();
        match parsed {
            FeedMessage::DataChange(event) => {
                assert_eq!(event.table, "scores_coop");
                assert!(!event.replay);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn server_event_carries_message_kind() {
        let event = FeedMessage::Ping { timestamp_ms: 1 }
            .to_server_event()
            .unwrap();
        assert_eq!(event.event.as_deref(), Some("ping"));
        assert!(event.data.contains("\"type\":\"ping\""));
    }
}
