//! External collaborators consumed by the pagination engines.
//!
//! The HTTP endpoints and the session store live outside this crate; these
//! traits are the seams they plug into.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::FetchError;
use crate::types::{ChatMessage, Conversation, ConversationId, GroupId, MessageId, Page, UserId};

/// Which history a `list_messages` call targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThreadRef {
    Interlocutor(UserId),
    Group(GroupId),
}

/// Edge of the already-loaded history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBoundary {
    /// Strictly older than this message.
    Before(MessageId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListMessages {
    pub thread: ThreadRef,
    pub boundary: Option<MessageBoundary>,
    pub limit: usize,
}

/// Conversation and history queries. Implementations return message pages
/// newest first.
pub trait ChatApi: Send + Sync {
    /// Conversations ordered by `updated_at` descending, strictly older than
    /// `cursor` when one is given.
    fn list_conversations(
        &self,
        cursor: Option<DateTime<Utc>>,
        limit: usize,
    ) -> impl Future<Output = Result<Page<Conversation>, FetchError>> + Send;

    fn list_messages(
        &self,
        request: ListMessages,
    ) -> impl Future<Output = Result<Page<ChatMessage>, FetchError>> + Send;

    /// Returns the server's `success` flag.
    fn mark_read(
        &self,
        conversation_id: &ConversationId,
        last_message_id: Option<&MessageId>,
    ) -> impl Future<Output = Result<bool, FetchError>> + Send;

    fn get_conversation(
        &self,
        interlocutor: &UserId,
        conversation_id: Option<&ConversationId>,
    ) -> impl Future<Output = Result<Option<Conversation>, FetchError>> + Send;
}

/// Source of the local user's identity.
pub trait SessionStore: Send + Sync {
    fn current_user_id(&self) -> Option<UserId>;
}

/// A session fixed at construction time.
#[derive(Clone, Debug)]
pub struct StaticSession(pub UserId);

impl SessionStore for StaticSession {
    fn current_user_id(&self) -> Option<UserId> {
        Some(self.0.clone())
    }
}
