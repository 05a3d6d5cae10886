//! Real-time messaging client core.
//!
//! One duplex connection carries both private and group chat. On top of it
//! sit an optimistic send tracker and the paging engines for the conversation
//! list and message histories.
//!
//! ```no_run
//! use chat_link::{ChatClient, ClientConfig, GroupView, WsConnector};
//!
//! # async fn demo() -> Result<(), chat_link::SendError> {
//! let connector = WsConnector::new("wss://chat.example/ws", None)?;
//! let client = ChatClient::init(connector, ClientConfig::default());
//! client.connect();
//! client.ready().await?;
//!
//! let mut lobby = GroupView::enter(&client, "lobby");
//! client.send_group_message(lobby.group(), "hello").await?;
//! while let Some(event) = lobby.recv().await {
//!     println!("{}: {}", event.message.sender_id, event.message.text);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod client;
pub mod connection;
pub mod conversations;
pub mod error;
pub mod group_view;
pub mod history;
pub mod optimistic;
pub mod protocol;
pub mod router;
pub mod subscription;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_helpers;

pub use api::{ChatApi, ListMessages, MessageBoundary, SessionStore, StaticSession, ThreadRef};
pub use client::{ChatClient, ClientConfig};
pub use connection::{ConnectionState, ReconnectPolicy};
pub use conversations::{BootstrapRequest, ConversationList};
pub use error::{ChatError, FetchError, ProtocolError, SendError, TransportError};
pub use group_view::GroupView;
pub use history::{MessageHistory, ScrollAnchor};
pub use optimistic::{MessageSender, Reconciled, RolledBack, send_optimistic};
pub use router::ListenerHandle;
pub use transport::{Connector, OutboundFrame, TransportEvent, TransportLink, WsConnector};
pub use types::{
    ChatMessage, Conversation, ConversationId, GroupId, GroupMessage, Interlocutor, MessageId,
    Page, PrivateMessage, Thread, UserId,
};
