//! Group-channel subscription multiplexer.
//!
//! Tracks the one channel the client wants (`desired`) separately from the
//! one the server currently has (`active`). The desired channel survives
//! disconnects and is replayed after every open.

use tracing::debug;

use crate::protocol::Command;
use crate::types::GroupId;

#[derive(Debug, Default)]
pub struct SubscriptionMux {
    desired: Option<GroupId>,
    active: Option<GroupId>,
}

impl SubscriptionMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn desired(&self) -> Option<&GroupId> {
        self.desired.as_ref()
    }

    pub fn active(&self) -> Option<&GroupId> {
        self.active.as_ref()
    }

    /// Commands to switch to `channel`. Empty while disconnected; the desired
    /// state is recorded either way.
    pub fn subscribe(&mut self, channel: GroupId, connected: bool) -> Vec<Command> {
        let mut commands = Vec::new();
        if connected {
            if self.active.as_ref() == Some(&channel) {
                self.desired = Some(channel);
                return commands;
            }
            if let Some(previous) = self.active.take() {
                commands.push(Command::Unsubscribe(previous));
            }
            commands.push(Command::Subscribe(channel.clone()));
            self.active = Some(channel.clone());
        }
        debug!(channel = %channel, connected, "desired subscription set");
        self.desired = Some(channel);
        commands
    }

    /// Commands to leave `channel`, defaulting to the current one. Desired
    /// state is cleared only if it names the same channel.
    pub fn unsubscribe(&mut self, channel: Option<GroupId>, connected: bool) -> Vec<Command> {
        let Some(target) = channel.or_else(|| self.active.clone().or_else(|| self.desired.clone()))
        else {
            return Vec::new();
        };

        if self.desired.as_ref() == Some(&target) {
            self.desired = None;
        }

        if connected && self.active.as_ref() == Some(&target) {
            self.active = None;
            return vec![Command::Unsubscribe(target)];
        }
        Vec::new()
    }

    /// The server forgets subscriptions when the connection drops.
    pub fn connection_lost(&mut self) {
        self.active = None;
    }

    /// Command to re-establish the desired channel on a fresh connection.
    pub fn replay(&mut self) -> Option<Command> {
        let channel = self.desired.clone()?;
        self.active = Some(channel.clone());
        Some(Command::Subscribe(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g(id: &str) -> GroupId {
        GroupId::new(id)
    }

    #[test]
    fn switching_unsubscribes_first() {
        let mut mux = SubscriptionMux::new();
        assert_eq!(
            mux.subscribe(g("A"), true),
            vec![Command::Subscribe(g("A"))]
        );
        assert_eq!(
            mux.subscribe(g("B"), true),
            vec![Command::Unsubscribe(g("A")), Command::Subscribe(g("B"))]
        );

        mux.connection_lost();
        assert_eq!(mux.replay(), Some(Command::Subscribe(g("B"))));
    }

    #[test]
    fn resubscribing_same_channel_is_a_noop() {
        let mut mux = SubscriptionMux::new();
        mux.subscribe(g("A"), true);
        assert!(mux.subscribe(g("A"), true).is_empty());
    }

    #[test]
    fn disconnected_calls_only_touch_desired_state() {
        let mut mux = SubscriptionMux::new();
        assert!(mux.subscribe(g("A"), false).is_empty());
        assert!(mux.subscribe(g("B"), false).is_empty());
        assert_eq!(mux.desired(), Some(&g("B")));
        assert_eq!(mux.active(), None);

        assert_eq!(mux.replay(), Some(Command::Subscribe(g("B"))));
        assert_eq!(mux.active(), Some(&g("B")));
    }

    #[test]
    fn unsubscribe_defaults_to_current_channel() {
        let mut mux = SubscriptionMux::new();
        mux.subscribe(g("A"), true);
        assert_eq!(
            mux.unsubscribe(None, true),
            vec![Command::Unsubscribe(g("A"))]
        );
        assert_eq!(mux.desired(), None);
        assert_eq!(mux.replay(), None);
    }

    #[test]
    fn unsubscribe_of_other_channel_keeps_desired() {
        let mut mux = SubscriptionMux::new();
        mux.subscribe(g("B"), true);
        assert!(mux.unsubscribe(Some(g("A")), true).is_empty());
        assert_eq!(mux.desired(), Some(&g("B")));
    }

    #[test]
    fn unsubscribe_while_disconnected_clears_desired_silently() {
        let mut mux = SubscriptionMux::new();
        mux.subscribe(g("A"), true);
        mux.connection_lost();
        assert!(mux.unsubscribe(Some(g("A")), false).is_empty());
        assert_eq!(mux.replay(), None);
    }
}
