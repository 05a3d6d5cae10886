//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{ChatApi, ListMessages, MessageBoundary};
use crate::error::{FetchError, TransportError};
use crate::transport::{Connector, OutboundFrame, TransportEvent, TransportLink};
use crate::types::{
    ChatMessage, Conversation, ConversationId, Interlocutor, MessageId, Page, UserId,
};

struct Peer {
    sent_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    sent: Vec<OutboundFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct MockState {
    fail_next: usize,
    greeting: Vec<String>,
    peers: Vec<Peer>,
}

/// A connector whose "server side" the test drives directly.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` dials fail.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().unwrap().fail_next = n;
    }

    /// Queue `frame` on every link opened from now on, before the client sees it.
    pub fn greet_with(&self, frame: &str) {
        self.state.lock().unwrap().greeting.push(frame.to_string());
    }

    /// Number of dials attempted, failed ones included.
    pub fn dials(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.peers.len()
    }

    /// Every frame the client has sent on the link from the `idx`-th dial.
    pub fn sent_on(&self, idx: usize) -> Vec<OutboundFrame> {
        let mut state = self.state.lock().unwrap();
        let peer = &mut state.peers[idx];
        while let Ok(frame) = peer.sent_rx.try_recv() {
            peer.sent.push(frame);
        }
        peer.sent.clone()
    }

    pub fn push(&self, idx: usize, event: TransportEvent) {
        let state = self.state.lock().unwrap();
        let _ = state.peers[idx].events.send(event);
    }
}

impl Connector for MockConnector {
    async fn connect(&self) -> Result<TransportLink, TransportError> {
        let mut state = self.state.lock().unwrap();
        let (out_tx, sent_rx) = mpsc::unbounded_channel();
        let (events, in_rx) = mpsc::unbounded_channel();

        if state.fail_next > 0 {
            state.fail_next -= 1;
            // Failed dials still count, with a peer nobody will use.
            state.peers.push(Peer {
                sent_rx,
                sent: Vec::new(),
                events,
            });
            return Err(TransportError::Connect("refused".into()));
        }

        for frame in &state.greeting {
            let _ = events.send(TransportEvent::Frame(frame.clone()));
        }
        state.peers.push(Peer {
            sent_rx,
            sent: Vec::new(),
            events,
        });
        Ok(TransportLink::new(out_tx, in_rx, CancellationToken::new()))
    }
}

/// Let spawned tasks run until they block.
pub(crate) async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Poll `cond`, letting (paused) time advance between checks.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

pub(crate) fn msg(id: &str, sender: &str, text: &str, secs: i64) -> ChatMessage {
    ChatMessage {
        id: MessageId::new(id),
        sender_id: UserId::new(sender),
        text: text.to_string(),
        created_at: chrono::DateTime::from_timestamp(secs, 0).unwrap(),
        pending: false,
    }
}

pub(crate) fn conversation(id: &str, with: &str, updated_secs: i64, unread: u32) -> Conversation {
    Conversation {
        conversation_id: Some(ConversationId::new(id)),
        interlocutor: Interlocutor {
            id: UserId::new(with),
            display_name: Some(format!("User {with}")),
            avatar_url: None,
        },
        last_message: None,
        updated_at: chrono::DateTime::from_timestamp(updated_secs, 0).unwrap(),
        unread_count: unread,
    }
}

#[derive(Default)]
struct ApiState {
    /// Newest first, as a server would return them.
    conversations: Vec<Conversation>,
    /// Per interlocutor, oldest first.
    messages: HashMap<String, Vec<ChatMessage>>,
    fetched: HashMap<String, Conversation>,
    fail: VecDeque<FetchError>,
    conversation_cursors: Vec<Option<chrono::DateTime<chrono::Utc>>>,
    message_boundaries: Vec<Option<MessageBoundary>>,
    mark_read: Vec<(ConversationId, Option<MessageId>)>,
}

/// A scripted collaborator backend.
#[derive(Clone, Default)]
pub(crate) struct MockApi {
    state: Arc<Mutex<ApiState>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conversations(self, mut conversations: Vec<Conversation>) -> Self {
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        self.state.lock().unwrap().conversations = conversations;
        self
    }

    pub fn with_messages(self, interlocutor: &str, messages: Vec<ChatMessage>) -> Self {
        self.state
            .lock()
            .unwrap()
            .messages
            .insert(interlocutor.to_string(), messages);
        self
    }

    pub fn with_fetched(self, conversation: Conversation) -> Self {
        self.state
            .lock()
            .unwrap()
            .fetched
            .insert(conversation.interlocutor.id.0.clone(), conversation);
        self
    }

    pub fn fail_next(&self, error: FetchError) {
        self.state.lock().unwrap().fail.push_back(error);
    }

    pub fn conversation_cursors(&self) -> Vec<Option<chrono::DateTime<chrono::Utc>>> {
        self.state.lock().unwrap().conversation_cursors.clone()
    }

    pub fn message_boundaries(&self) -> Vec<Option<MessageBoundary>> {
        self.state.lock().unwrap().message_boundaries.clone()
    }

    pub fn mark_read_calls(&self) -> Vec<(ConversationId, Option<MessageId>)> {
        self.state.lock().unwrap().mark_read.clone()
    }

    fn take_failure(&self) -> Result<(), FetchError> {
        match self.state.lock().unwrap().fail.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl ChatApi for MockApi {
    async fn list_conversations(
        &self,
        cursor: Option<chrono::DateTime<chrono::Utc>>,
        limit: usize,
    ) -> Result<Page<Conversation>, FetchError> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        state.conversation_cursors.push(cursor);
        let matching: Vec<Conversation> = state
            .conversations
            .iter()
            .filter(|c| cursor.is_none_or(|cur| c.updated_at < cur))
            .cloned()
            .collect();
        let has_more = matching.len() > limit;
        Ok(Page::new(matching.into_iter().take(limit).collect(), has_more))
    }

    async fn list_messages(&self, request: ListMessages) -> Result<Page<ChatMessage>, FetchError> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        state.message_boundaries.push(request.boundary.clone());
        let key = match &request.thread {
            crate::api::ThreadRef::Interlocutor(id) => id.0.clone(),
            crate::api::ThreadRef::Group(id) => id.0.clone(),
        };
        let all = state.messages.get(&key).cloned().unwrap_or_default();
        let older: Vec<ChatMessage> = match &request.boundary {
            Some(MessageBoundary::Before(id)) => {
                let pos = all.iter().position(|m| &m.id == id).unwrap_or(all.len());
                all[..pos].to_vec()
            }
            None => all,
        };
        // Newest first, like the server.
        let newest_first: Vec<ChatMessage> = older.into_iter().rev().collect();
        let has_more = newest_first.len() > request.limit;
        Ok(Page::new(
            newest_first.into_iter().take(request.limit).collect(),
            has_more,
        ))
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        last_message_id: Option<&MessageId>,
    ) -> Result<bool, FetchError> {
        self.take_failure()?;
        self.state
            .lock()
            .unwrap()
            .mark_read
            .push((conversation_id.clone(), last_message_id.cloned()));
        Ok(true)
    }

    async fn get_conversation(
        &self,
        interlocutor: &UserId,
        _conversation_id: Option<&ConversationId>,
    ) -> Result<Option<Conversation>, FetchError> {
        self.take_failure()?;
        Ok(self.state.lock().unwrap().fetched.get(&interlocutor.0).cloned())
    }
}
