//! Wire protocol.
//!
//! Outbound commands are tagged text frames:
//!
//! ```text
//! sub:<groupId>        subscribe to a group channel
//! unsub:<groupId>      unsubscribe from a group channel
//! ch:{"interlocutorId":"u2","text":"hi"}    private send
//! gch:{"groupId":"g1","text":"hi"}          group send
//! ```
//!
//! Inbound frames are JSON arrays of message records. Each record carries
//! exactly one of `groupId` / `conversationId`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{
    ChatMessage, ConversationId, GroupId, GroupMessage, MessageId, PrivateMessage, UserId,
};

/// Close code sent on a deliberate disconnect. Suppresses auto-reconnect.
pub const INTENTIONAL_CLOSE: u16 = 4000;

/// Returns true if a close with this code must not trigger a reconnect.
pub fn is_intentional_close(code: Option<u16>) -> bool {
    code == Some(INTENTIONAL_CLOSE)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrivatePayload<'a> {
    interlocutor_id: &'a UserId,
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupPayload<'a> {
    group_id: &'a GroupId,
    text: &'a str,
}

/// A command sent from the client to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Subscribe(GroupId),
    Unsubscribe(GroupId),
    SendPrivate { interlocutor_id: UserId, text: String },
    SendGroup { group_id: GroupId, text: String },
}

impl Command {
    /// Encode as a tagged text frame.
    pub fn encode(&self) -> String {
        match self {
            Command::Subscribe(id) => format!("sub:{id}"),
            Command::Unsubscribe(id) => format!("unsub:{id}"),
            Command::SendPrivate {
                interlocutor_id,
                text,
            } => {
                let payload = PrivatePayload {
                    interlocutor_id,
                    text,
                };
                // Serializing two strings cannot fail.
                format!("ch:{}", serde_json::to_string(&payload).unwrap_or_default())
            }
            Command::SendGroup { group_id, text } => {
                let payload = GroupPayload { group_id, text };
                format!("gch:{}", serde_json::to_string(&payload).unwrap_or_default())
            }
        }
    }
}

/// Server timestamps arrive either as RFC 3339 strings or epoch millis.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Text(DateTime<Utc>),
    Millis(i64),
}

impl WireTimestamp {
    fn into_datetime(self) -> Result<DateTime<Utc>, ProtocolError> {
        match self {
            WireTimestamp::Text(dt) => Ok(dt),
            WireTimestamp::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| ProtocolError::InvalidRecord(format!("bad timestamp {ms}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    id: MessageId,
    #[serde(default)]
    conversation_id: Option<ConversationId>,
    #[serde(default)]
    group_id: Option<GroupId>,
    sender_id: UserId,
    text: String,
    created_at: WireTimestamp,
}

/// A decoded inbound record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Private(PrivateMessage),
    Group(GroupMessage),
}

impl Inbound {
    pub fn message(&self) -> &ChatMessage {
        match self {
            Inbound::Private(m) => &m.message,
            Inbound::Group(m) => &m.message,
        }
    }
}

fn decode_record(value: serde_json::Value) -> Result<Inbound, ProtocolError> {
    let record: WireRecord =
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidRecord(e.to_string()))?;

    let message = ChatMessage {
        id: record.id,
        sender_id: record.sender_id,
        text: record.text,
        created_at: record.created_at.into_datetime()?,
        pending: false,
    };

    match (record.group_id, record.conversation_id) {
        (Some(group_id), None) => Ok(Inbound::Group(GroupMessage { group_id, message })),
        (None, Some(conversation_id)) => Ok(Inbound::Private(PrivateMessage {
            conversation_id,
            message,
        })),
        (Some(_), Some(_)) => Err(ProtocolError::AmbiguousTarget),
        (None, None) => Err(ProtocolError::MissingTarget),
    }
}

/// Decode one inbound frame.
///
/// The outer error means the whole frame was unusable. Otherwise every record
/// yields its own result, in array order, so one bad record does not spoil
/// the rest of the batch. A bare object is accepted as a batch of one.
pub fn decode_frame(frame: &str) -> Result<Vec<Result<Inbound, ProtocolError>>, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(frame).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;

    let records = match value {
        serde_json::Value::Array(items) => items,
        obj @ serde_json::Value::Object(_) => vec![obj],
        other => {
            return Err(ProtocolError::MalformedFrame(format!(
                "expected an array of records, got {other}"
            )));
        }
    };

    Ok(records.into_iter().map(decode_record).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_tagged_commands() {
        assert_eq!(Command::Subscribe("g1".into()).encode(), "sub:g1");
        assert_eq!(Command::Unsubscribe("g1".into()).encode(), "unsub:g1");
        assert_eq!(
            Command::SendPrivate {
                interlocutor_id: "u2".into(),
                text: "hi \"there\"".into(),
            }
            .encode(),
            r#"ch:{"interlocutorId":"u2","text":"hi \"there\""}"#
        );
        assert_eq!(
            Command::SendGroup {
                group_id: "g1".into(),
                text: "yo".into(),
            }
            .encode(),
            r#"gch:{"groupId":"g1","text":"yo"}"#
        );
    }

    #[test]
    fn decodes_mixed_batch_in_order() {
        let frame = r#"[
            {"id":"1","conversationId":"c1","senderId":"u2","text":"a","createdAt":"2024-05-01T10:00:00Z"},
            {"id":"2","groupId":"g1","senderId":"u3","text":"b","createdAt":1714557600000}
        ]"#;
        let records = decode_frame(frame).unwrap();
        assert_eq!(records.len(), 2);

        match records[0].as_ref().unwrap() {
            Inbound::Private(m) => {
                assert_eq!(m.conversation_id.as_str(), "c1");
                assert_eq!(m.message.text, "a");
                assert!(!m.message.pending);
            }
            other => panic!("expected private, got {other:?}"),
        }
        match records[1].as_ref().unwrap() {
            Inbound::Group(m) => {
                assert_eq!(m.group_id.as_str(), "g1");
                assert_eq!(m.message.created_at.timestamp_millis(), 1714557600000);
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn bad_records_do_not_spoil_the_batch() {
        let frame = r#"[
            {"id":"1","senderId":"u2","text":"no target","createdAt":0},
            {"id":"2","groupId":"g","conversationId":"c","senderId":"u2","text":"both","createdAt":0},
            {"text":"garbage"},
            {"id":"4","groupId":"g1","senderId":"u3","text":"ok","createdAt":0}
        ]"#;
        let records = decode_frame(frame).unwrap();
        assert_eq!(records[0], Err(ProtocolError::MissingTarget));
        assert_eq!(records[1], Err(ProtocolError::AmbiguousTarget));
        assert!(matches!(records[2], Err(ProtocolError::InvalidRecord(_))));
        assert!(records[3].is_ok());
    }

    #[test]
    fn rejects_non_json_frames() {
        assert!(matches!(
            decode_frame("not json"),
            Err(ProtocolError::MalformedFrame(_))
        ));
        assert!(matches!(
            decode_frame("42"),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn only_the_intentional_code_suppresses_reconnect() {
        assert!(is_intentional_close(Some(INTENTIONAL_CLOSE)));
        assert!(!is_intentional_close(Some(1000)));
        assert!(!is_intentional_close(Some(1006)));
        assert!(!is_intentional_close(None));
    }
}
