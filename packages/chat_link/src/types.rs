//! Domain types shared by every layer of the messaging core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// A user account, local or remote.
    UserId
);
string_id!(
    /// A 1:1 conversation as identified by the server.
    ConversationId
);
string_id!(
    /// A group channel. Doubles as the subscription channel id.
    GroupId
);
string_id!(
    /// A message id. Server-assigned, or `temp-<uuid>` for pending messages.
    MessageId
);

const TEMP_PREFIX: &str = "temp-";

impl MessageId {
    /// A fresh temporary id for a locally synthesized message.
    pub fn temporary() -> Self {
        Self(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_PREFIX)
    }
}

/// Where a message lives.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Thread {
    /// A private chat. The conversation id is unknown until the server has
    /// echoed the first message of a brand-new conversation.
    Private {
        interlocutor: UserId,
        conversation: Option<ConversationId>,
    },
    Group(GroupId),
}

impl Thread {
    pub fn private(interlocutor: impl Into<UserId>) -> Self {
        Self::Private {
            interlocutor: interlocutor.into(),
            conversation: None,
        }
    }

    pub fn group(id: impl Into<GroupId>) -> Self {
        Self::Group(id.into())
    }
}

/// A message as held in a history view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// True until the server echo has been reconciled.
    #[serde(default)]
    pub pending: bool,
}

impl ChatMessage {
    /// Synthesize a pending local message.
    pub fn pending(sender_id: UserId, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::temporary(),
            sender_id,
            text: text.into(),
            created_at: Utc::now(),
            pending: true,
        }
    }
}

/// An inbound private-chat event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrivateMessage {
    pub conversation_id: ConversationId,
    pub message: ChatMessage,
}

/// An inbound group-chat event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMessage {
    pub group_id: GroupId,
    pub message: ChatMessage,
}

/// The other party of a private conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interlocutor {
    pub id: UserId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Interlocutor {
    pub fn bare(id: UserId) -> Self {
        Self {
            id,
            display_name: None,
            avatar_url: None,
        }
    }
}

/// A row of the conversation list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// `None` only for a placeholder synthesized from an inbound message
    /// before its metadata has been fetched.
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    pub interlocutor: Interlocutor,
    #[serde(default)]
    pub last_message: Option<ChatMessage>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
}

/// One page returned by a collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, has_more: bool) -> Self {
        Self { items, has_more }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_ids_are_unique_and_flagged() {
        let a = MessageId::temporary();
        let b = MessageId::temporary();
        assert_ne!(a, b);
        assert!(a.is_temporary());
        assert!(!MessageId::new("42").is_temporary());
    }

    #[test]
    fn conversation_deserializes_from_camel_case() {
        let json = r#"{
            "conversationId": "c1",
            "interlocutor": {"id": "u2", "displayName": "Bea"},
            "updatedAt": "2024-01-01T00:00:00Z",
            "unreadCount": 2
        }"#;
        let conv: Conversation = serde_json::from_str(json).unwrap();
        assert_eq!(conv.conversation_id, Some(ConversationId::new("c1")));
        assert_eq!(conv.interlocutor.display_name.as_deref(), Some("Bea"));
        assert_eq!(conv.unread_count, 2);
        assert!(conv.last_message.is_none());
    }
}
