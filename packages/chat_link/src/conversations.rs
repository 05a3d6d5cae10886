//! The conversation list: paging, unread accounting and placeholder rows for
//! conversations first seen through an inbound message.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::error::FetchError;
use crate::types::{
    Conversation, ConversationId, Interlocutor, MessageId, PrivateMessage, UserId,
};

pub const DEFAULT_CONVERSATION_PAGE: usize = 20;

/// How many inbound message ids are remembered for redelivery checks.
const RECENT_MESSAGE_IDS: usize = 256;

/// Metadata still to be fetched for a placeholder row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapRequest {
    pub interlocutor: UserId,
    pub conversation_id: ConversationId,
}

#[derive(Debug)]
pub struct ConversationList {
    /// Unique by interlocutor, sorted by `updated_at` descending.
    rows: Vec<Conversation>,
    has_more: bool,
    loaded: bool,
    page_size: usize,
    unread_total: u32,
    active: Option<UserId>,
    /// Ids of recently folded inbound messages, oldest first.
    recent: VecDeque<MessageId>,
}

impl Default for ConversationList {
    fn default() -> Self {
        Self::new(DEFAULT_CONVERSATION_PAGE)
    }
}

impl ConversationList {
    pub fn new(page_size: usize) -> Self {
        Self {
            rows: Vec::new(),
            has_more: true,
            loaded: false,
            page_size: page_size.max(1),
            unread_total: 0,
            active: None,
            recent: VecDeque::new(),
        }
    }

    pub fn rows(&self) -> &[Conversation] {
        &self.rows
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn unread_total(&self) -> u32 {
        self.unread_total
    }

    pub fn active(&self) -> Option<&UserId> {
        self.active.as_ref()
    }

    pub fn find(&self, interlocutor: &UserId) -> Option<&Conversation> {
        self.rows.iter().find(|c| &c.interlocutor.id == interlocutor)
    }

    fn position_by_interlocutor(&self, interlocutor: &UserId) -> Option<usize> {
        self.rows.iter().position(|c| &c.interlocutor.id == interlocutor)
    }

    fn position_by_conversation(&self, id: &ConversationId) -> Option<usize> {
        self.rows
            .iter()
            .position(|c| c.conversation_id.as_ref() == Some(id))
    }

    /// Remember `id`. Returns false if it was already seen.
    fn remember(&mut self, id: &MessageId) -> bool {
        if self.recent.contains(id) {
            return false;
        }
        if self.recent.len() == RECENT_MESSAGE_IDS {
            self.recent.pop_front();
        }
        self.recent.push_back(id.clone());
        true
    }

    fn oldest_updated_at(&self) -> Option<DateTime<Utc>> {
        self.rows.iter().map(|c| c.updated_at).min()
    }

    fn sort(&mut self) {
        self.rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    pub async fn load_initial<A: ChatApi>(&mut self, api: &A) -> Result<usize, FetchError> {
        let page = api.list_conversations(None, self.page_size).await?;
        self.loaded = true;
        Ok(self.merge_page(page.items, page.has_more))
    }

    /// Fetch conversations older than the oldest loaded row. Returns how many
    /// new rows arrived; a no-op once the list is exhausted.
    pub async fn load_more<A: ChatApi>(&mut self, api: &A) -> Result<usize, FetchError> {
        if !self.loaded {
            return self.load_initial(api).await;
        }
        if !self.has_more {
            return Ok(0);
        }
        let page = api
            .list_conversations(self.oldest_updated_at(), self.page_size)
            .await?;
        Ok(self.merge_page(page.items, page.has_more))
    }

    fn merge_page(&mut self, items: Vec<Conversation>, server_has_more: bool) -> usize {
        self.has_more = server_has_more && items.len() >= self.page_size;
        let mut added = 0;
        for conversation in items {
            if self.upsert(conversation) {
                added += 1;
            }
        }
        self.sort();
        debug!(
            added,
            total = self.rows.len(),
            has_more = self.has_more,
            "conversation page merged"
        );
        added
    }

    /// Check-then-insert keyed by interlocutor. Returns true if a new row was
    /// created. An existing row keeps the higher unread count and the newer
    /// last message.
    fn upsert(&mut self, mut incoming: Conversation) -> bool {
        let is_active = self.active.as_ref() == Some(&incoming.interlocutor.id);
        if is_active {
            incoming.unread_count = 0;
        }

        match self.position_by_interlocutor(&incoming.interlocutor.id) {
            Some(index) => {
                let row = &mut self.rows[index];
                if row.conversation_id.is_none() {
                    row.conversation_id = incoming.conversation_id;
                }
                row.interlocutor = incoming.interlocutor;
                if incoming.updated_at > row.updated_at {
                    row.updated_at = incoming.updated_at;
                    if incoming.last_message.is_some() {
                        row.last_message = incoming.last_message;
                    }
                } else if row.last_message.is_none() {
                    row.last_message = incoming.last_message;
                }
                if incoming.unread_count > row.unread_count {
                    self.unread_total += incoming.unread_count - row.unread_count;
                    row.unread_count = incoming.unread_count;
                }
                false
            }
            None => {
                self.unread_total += incoming.unread_count;
                self.rows.push(incoming);
                true
            }
        }
    }

    /// Fold an inbound private message into the list. A message from a
    /// sender with no row yet creates a placeholder and asks for its
    /// metadata to be fetched. A redelivered message is ignored.
    pub fn on_private_message(
        &mut self,
        event: &PrivateMessage,
        local_user: &UserId,
    ) -> Option<BootstrapRequest> {
        let message = &event.message;
        let incoming = &message.sender_id != local_user;
        if !self.remember(&message.id) {
            debug!(id = %message.id, "redelivered message ignored");
            return None;
        }

        let index = match self.position_by_conversation(&event.conversation_id) {
            Some(index) => Some(index),
            None if incoming => self.position_by_interlocutor(&message.sender_id),
            None => None,
        };

        let Some(index) = index else {
            if !incoming {
                // Our own echo for a conversation we have no row for. The
                // caller knows the interlocutor; see `note_outgoing`.
                debug!(conversation = %event.conversation_id, "own echo for unknown conversation");
                return None;
            }
            return Some(self.insert_placeholder(event));
        };

        let active = self.active.as_ref();
        let row = &mut self.rows[index];
        if row.last_message.as_ref().map(|m| &m.id) == Some(&message.id) {
            // Already folded in through a fetched page.
            return None;
        }
        if row.conversation_id.is_none() {
            row.conversation_id = Some(event.conversation_id.clone());
        }
        if message.created_at >= row.updated_at {
            row.updated_at = message.created_at;
            row.last_message = Some(message.clone());
        }
        if incoming && active != Some(&row.interlocutor.id) {
            row.unread_count += 1;
            self.unread_total += 1;
        }
        self.sort();
        None
    }

    /// Record a message the local user sent to `interlocutor`. Creates a
    /// placeholder if this is the first message of a new conversation.
    pub fn note_outgoing(
        &mut self,
        interlocutor: &UserId,
        event: &PrivateMessage,
    ) -> Option<BootstrapRequest> {
        match self.position_by_interlocutor(interlocutor) {
            Some(index) => {
                let row = &mut self.rows[index];
                if row.conversation_id.is_none() {
                    row.conversation_id = Some(event.conversation_id.clone());
                }
                if event.message.created_at >= row.updated_at {
                    row.updated_at = event.message.created_at;
                    row.last_message = Some(event.message.clone());
                }
                self.sort();
                None
            }
            None => {
                let row = Conversation {
                    conversation_id: Some(event.conversation_id.clone()),
                    interlocutor: Interlocutor::bare(interlocutor.clone()),
                    last_message: Some(event.message.clone()),
                    updated_at: event.message.created_at,
                    unread_count: 0,
                };
                self.rows.push(row);
                self.sort();
                Some(BootstrapRequest {
                    interlocutor: interlocutor.clone(),
                    conversation_id: event.conversation_id.clone(),
                })
            }
        }
    }

    fn insert_placeholder(&mut self, event: &PrivateMessage) -> BootstrapRequest {
        let sender = event.message.sender_id.clone();
        let unread = u32::from(self.active.as_ref() != Some(&sender));
        info!(interlocutor = %sender, "new conversation");
        self.rows.push(Conversation {
            conversation_id: Some(event.conversation_id.clone()),
            interlocutor: Interlocutor::bare(sender.clone()),
            last_message: Some(event.message.clone()),
            updated_at: event.message.created_at,
            unread_count: unread,
        });
        self.unread_total += unread;
        self.sort();
        BootstrapRequest {
            interlocutor: sender,
            conversation_id: event.conversation_id.clone(),
        }
    }

    /// Backfill a row with fetched metadata. Never creates a second row for
    /// the same interlocutor, whichever of placeholder and fetch lands first.
    pub fn apply_fetched(&mut self, conversation: Conversation) {
        self.upsert(conversation);
        self.sort();
    }

    /// Fetch metadata for a placeholder row and merge it in.
    pub async fn bootstrap<A: ChatApi>(
        &mut self,
        api: &A,
        request: &BootstrapRequest,
    ) -> Result<(), FetchError> {
        let fetched = api
            .get_conversation(&request.interlocutor, Some(&request.conversation_id))
            .await?;
        match fetched {
            Some(conversation) => self.apply_fetched(conversation),
            None => warn!(interlocutor = %request.interlocutor, "conversation not found; keeping placeholder"),
        }
        Ok(())
    }

    /// Open the conversation with `interlocutor`: zero its unread counter,
    /// take it out of the global total once, and tell the server. While it
    /// stays open, inbound messages for it are not counted as unread.
    pub async fn open<A: ChatApi>(
        &mut self,
        api: &A,
        interlocutor: &UserId,
    ) -> Result<(), FetchError> {
        self.active = Some(interlocutor.clone());
        let Some(index) = self.position_by_interlocutor(interlocutor) else {
            return Ok(());
        };

        let row = &mut self.rows[index];
        let cleared = std::mem::take(&mut row.unread_count);
        if cleared == 0 {
            return Ok(());
        }
        self.unread_total = self.unread_total.saturating_sub(cleared);
        debug!(%interlocutor, cleared, total = self.unread_total, "conversation read");

        let Some(conversation_id) = row.conversation_id.clone() else {
            return Ok(());
        };
        let last_message_id = row
            .last_message
            .as_ref()
            .map(|m| m.id.clone())
            .filter(|id| !id.is_temporary());
        let acknowledged = api
            .mark_read(&conversation_id, last_message_id.as_ref())
            .await?;
        if !acknowledged {
            warn!(conversation = %conversation_id, "server did not acknowledge mark read");
        }
        Ok(())
    }

    pub fn close_active(&mut self) {
        self.active = None;
    }
}
