//! Per-thread message history with backwards pagination.
//!
//! Messages are held ascending by time. Older pages are prepended; nothing
//! already loaded is ever reordered.

use std::collections::HashSet;

use tracing::debug;

use crate::api::{ChatApi, ListMessages, MessageBoundary, ThreadRef};
use crate::error::FetchError;
use crate::types::{ChatMessage, MessageId, Page, Thread};

pub const DEFAULT_MESSAGE_PAGE: usize = 30;

/// Where the viewport should stay pinned after older messages were prepended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScrollAnchor {
    /// The message that was first before the prepend.
    pub anchor_id: Option<MessageId>,
    /// How many messages now sit above it.
    pub inserted_before: usize,
}

#[derive(Debug)]
pub struct MessageHistory {
    thread: Thread,
    pub(crate) items: Vec<ChatMessage>,
    has_more: bool,
    loaded: bool,
    page_size: usize,
}

impl MessageHistory {
    pub fn new(thread: Thread) -> Self {
        Self::with_page_size(thread, DEFAULT_MESSAGE_PAGE)
    }

    pub fn with_page_size(thread: Thread, page_size: usize) -> Self {
        Self {
            thread,
            items: Vec::new(),
            has_more: true,
            loaded: false,
            page_size: page_size.max(1),
        }
    }

    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn items(&self) -> &[ChatMessage] {
        &self.items
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.items.iter().any(|m| &m.id == id)
    }

    /// The oldest server-confirmed message, i.e. the pagination boundary.
    pub fn oldest_confirmed(&self) -> Option<&MessageId> {
        self.items.iter().find(|m| !m.pending).map(|m| &m.id)
    }

    fn thread_ref(&self) -> ThreadRef {
        match &self.thread {
            Thread::Private { interlocutor, .. } => ThreadRef::Interlocutor(interlocutor.clone()),
            Thread::Group(group) => ThreadRef::Group(group.clone()),
        }
    }

    pub(crate) fn bind_conversation(&mut self, id: crate::types::ConversationId) {
        if let Thread::Private { conversation, .. } = &mut self.thread {
            if conversation.is_none() {
                debug!(conversation = %id, "history bound to conversation");
                *conversation = Some(id);
            }
        }
    }

    pub async fn load_initial<A: ChatApi>(&mut self, api: &A) -> Result<ScrollAnchor, FetchError> {
        let page = api
            .list_messages(ListMessages {
                thread: self.thread_ref(),
                boundary: None,
                limit: self.page_size,
            })
            .await?;
        self.loaded = true;
        Ok(self.merge_older(page))
    }

    /// Fetch the page before the oldest loaded message. A no-op once the
    /// server has run out of history.
    pub async fn load_more<A: ChatApi>(
        &mut self,
        api: &A,
    ) -> Result<Option<ScrollAnchor>, FetchError> {
        if !self.loaded {
            return self.load_initial(api).await.map(Some);
        }
        if !self.has_more {
            return Ok(None);
        }
        let boundary = self
            .oldest_confirmed()
            .cloned()
            .map(MessageBoundary::Before);
        let page = api
            .list_messages(ListMessages {
                thread: self.thread_ref(),
                boundary,
                limit: self.page_size,
            })
            .await?;
        Ok(Some(self.merge_older(page)))
    }

    /// Prepend a newest-first page. Ids already present are skipped.
    pub fn merge_older(&mut self, page: Page<ChatMessage>) -> ScrollAnchor {
        let anchor_id = self.items.first().map(|m| m.id.clone());
        self.has_more = page.has_more && page.items.len() >= self.page_size;

        let known: HashSet<&MessageId> = self.items.iter().map(|m| &m.id).collect();
        let mut older: Vec<ChatMessage> = page
            .items
            .into_iter()
            .filter(|m| !known.contains(&m.id))
            .collect();
        older.reverse();

        let inserted_before = older.len();
        debug!(inserted = inserted_before, has_more = self.has_more, "history page merged");
        older.append(&mut self.items);
        self.items = older;

        ScrollAnchor {
            anchor_id,
            inserted_before,
        }
    }

    /// Append a live message. Returns false if its id is already present.
    pub fn push_live(&mut self, message: ChatMessage) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.items.push(message);
        true
    }
}
