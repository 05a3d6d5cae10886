//! Scoped presence in a group channel.

use tokio::sync::mpsc;
use tracing::debug;

use crate::client::ChatClient;
use crate::router::ListenerHandle;
use crate::types::{GroupId, GroupMessage};

/// While alive, the client is subscribed to `group` and its messages are
/// forwarded here. Leaving, explicitly or by drop, deregisters the listener
/// and unsubscribes whatever the connection state.
pub struct GroupView {
    client: ChatClient,
    group: GroupId,
    handle: Option<ListenerHandle>,
    messages: mpsc::UnboundedReceiver<GroupMessage>,
}

impl GroupView {
    pub fn enter(client: &ChatClient, group: impl Into<GroupId>) -> Self {
        let group = group.into();
        let (tx, messages) = mpsc::unbounded_channel();
        let wanted = group.clone();
        let handle = client.add_on_group_message(move |event| {
            if event.group_id == wanted {
                let _ = tx.send(event.clone());
            }
        });
        client.subscribe_to_group(group.clone());
        debug!(group = %group, "entered group view");

        Self {
            client: client.clone(),
            group,
            handle: Some(handle),
            messages,
        }
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub async fn recv(&mut self) -> Option<GroupMessage> {
        self.messages.recv().await
    }

    pub fn try_recv(&mut self) -> Option<GroupMessage> {
        self.messages.try_recv().ok()
    }

    pub fn leave(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.client.remove_on_group_message(handle);
            self.client.unsubscribe_from_group(Some(self.group.clone()));
            debug!(group = %self.group, "left group view");
        }
    }
}

impl Drop for GroupView {
    fn drop(&mut self) {
        self.release();
    }
}
