//! Optimistic sends: pending messages shown before the server confirms them.
//!
//! A confirmed echo carries no correlation id, so it is matched to the oldest
//! pending entry from the local user with identical text. Each echo resolves
//! at most one entry, and identical texts resolve first-in first-out.

use std::future::Future;

use tracing::{debug, warn};

use crate::client::ChatClient;
use crate::error::SendError;
use crate::history::MessageHistory;
use crate::types::{ChatMessage, GroupMessage, MessageId, PrivateMessage, Thread, UserId};

/// What happened to a confirmed message handed to a history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// A pending entry at `index` was swapped for the confirmed message.
    Replaced { index: usize, temp_id: MessageId },
    /// No pending entry matched; appended as a fresh message.
    Fresh { index: usize },
    /// Already present.
    Duplicate,
}

/// A send that failed after its pending entry was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message not sent: {error}")]
pub struct RolledBack {
    /// The text, so the input can be restored.
    pub text: String,
    #[source]
    pub error: SendError,
}

/// Hands text to a transport. Implemented by [`ChatClient`].
pub trait MessageSender: Send + Sync {
    fn send_to(
        &self,
        thread: &Thread,
        text: &str,
    ) -> impl Future<Output = Result<(), SendError>> + Send;
}

impl MessageSender for ChatClient {
    async fn send_to(&self, thread: &Thread, text: &str) -> Result<(), SendError> {
        match thread {
            Thread::Private { interlocutor, .. } => {
                self.send_private_message(interlocutor, text).await
            }
            Thread::Group(group) => self.send_group_message(group, text).await,
        }
    }
}

impl MessageHistory {
    /// Append a pending message and return its temporary id.
    pub fn insert_pending(&mut self, local_user: &UserId, text: &str) -> MessageId {
        let pending = ChatMessage::pending(local_user.clone(), text);
        let id = pending.id.clone();
        self.items.push(pending);
        id
    }

    /// Remove a pending entry. Returns false if it was already resolved.
    pub fn discard_pending(&mut self, temp_id: &MessageId) -> bool {
        match self.items.iter().position(|m| m.pending && &m.id == temp_id) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.items.iter().filter(|m| m.pending).count()
    }

    /// Fold a confirmed message in, replacing the oldest matching pending
    /// entry in place when the local user sent it.
    pub fn reconcile(&mut self, confirmed: ChatMessage, local_user: &UserId) -> Reconciled {
        if self.contains(&confirmed.id) {
            return Reconciled::Duplicate;
        }

        if &confirmed.sender_id == local_user {
            let slot = self
                .items
                .iter()
                .position(|m| m.pending && m.text == confirmed.text);
            if let Some(index) = slot {
                let temp_id = std::mem::replace(&mut self.items[index], confirmed).id;
                debug!(%temp_id, index, "pending message confirmed");
                return Reconciled::Replaced { index, temp_id };
            }
        }

        self.items.push(confirmed);
        Reconciled::Fresh {
            index: self.items.len() - 1,
        }
    }

    /// Whether an inbound private message belongs in this history.
    pub fn accepts_private(&self, event: &PrivateMessage, local_user: &UserId) -> bool {
        match self.thread() {
            Thread::Private {
                conversation: Some(conversation),
                ..
            } => conversation == &event.conversation_id,
            Thread::Private {
                interlocutor,
                conversation: None,
            } => {
                let sender = &event.message.sender_id;
                sender == interlocutor
                    || (sender == local_user
                        && self
                            .items()
                            .iter()
                            .any(|m| m.pending && m.text == event.message.text))
            }
            Thread::Group(_) => false,
        }
    }

    /// Route an inbound private message into this history, binding the
    /// conversation id on first contact. `None` if it belongs elsewhere.
    pub fn ingest_private(
        &mut self,
        event: &PrivateMessage,
        local_user: &UserId,
    ) -> Option<Reconciled> {
        if !self.accepts_private(event, local_user) {
            return None;
        }
        self.bind_conversation(event.conversation_id.clone());
        Some(self.reconcile(event.message.clone(), local_user))
    }

    pub fn ingest_group(&mut self, event: &GroupMessage, local_user: &UserId) -> Option<Reconciled> {
        match self.thread() {
            Thread::Group(group) if group == &event.group_id => {
                Some(self.reconcile(event.message.clone(), local_user))
            }
            _ => None,
        }
    }
}

/// Insert a pending message, then hand the text to `sender`. On rejection the
/// pending entry is removed again and the text comes back in the error.
pub async fn send_optimistic<S: MessageSender>(
    sender: &S,
    history: &mut MessageHistory,
    local_user: &UserId,
    text: &str,
) -> Result<MessageId, RolledBack> {
    let temp_id = history.insert_pending(local_user, text);
    let thread = history.thread().clone();

    match sender.send_to(&thread, text).await {
        Ok(()) => Ok(temp_id),
        Err(error) => {
            warn!(%temp_id, error = %error, "send failed; rolling back pending message");
            history.discard_pending(&temp_id);
            Err(RolledBack {
                text: text.to_string(),
                error,
            })
        }
    }
}
