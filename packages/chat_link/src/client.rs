//! ChatClient: the single duplex connection and everything riding on it.
//!
//! One actor task owns the transport link, the connection state machine, the
//! subscription multiplexer and the listener registries. [`ChatClient`] is a
//! cheap handle that posts requests to it; requests are handled strictly in
//! the order they were posted, so no locks guard any of this state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionMachine, ConnectionState, ReconnectPolicy};
use crate::error::{SendError, TransportError};
use crate::protocol::{Command, INTENTIONAL_CLOSE};
use crate::router::{Listener, ListenerHandle, ListenerRegistry, MessageRouter};
use crate::subscription::SubscriptionMux;
use crate::transport::{Connector, TransportEvent, TransportLink};
use crate::types::{GroupId, GroupMessage, PrivateMessage, UserId};

#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    pub reconnect: ReconnectPolicy,
}

#[derive(Clone, Copy, Debug)]
enum ListenerKind {
    Private,
    Group,
    TransportError,
}

enum Request {
    Connect,
    Disconnect,
    Subscribe(GroupId),
    Unsubscribe(Option<GroupId>),
    AddPrivate(ListenerHandle, Listener<PrivateMessage>),
    AddGroup(ListenerHandle, Listener<GroupMessage>),
    AddTransportError(ListenerHandle, Listener<TransportError>),
    RemoveListener(ListenerKind, ListenerHandle),
    Send {
        command: Command,
        respond_to: oneshot::Sender<Result<(), SendError>>,
    },
    Dispose,
}

/// Completions of work the actor spawned, tagged with the generation that
/// spawned them so results from before a disconnect are discarded.
enum Internal {
    Dialed {
        generation: u64,
        result: Result<TransportLink, TransportError>,
    },
    BackoffElapsed {
        generation: u64,
    },
}

/// Handle to a running chat connection. Clones share the same connection.
///
/// Dropping the last handle disposes the connection.
#[derive(Clone)]
pub struct ChatClient {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    next_handle: Arc<AtomicU64>,
}

impl ChatClient {
    /// Spawn the connection actor. Nothing is dialed until [`connect`](Self::connect).
    pub fn init<C: Connector>(connector: C, config: ClientConfig) -> Self {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let actor = ClientActor {
            connector: Arc::new(connector),
            machine: ConnectionMachine::new(config.reconnect),
            subscriptions: SubscriptionMux::new(),
            router: MessageRouter::new(),
            transport_errors: ListenerRegistry::default(),
            link: None,
            generation: 0,
            dial: None,
            backoff: None,
            state_tx,
            internal_tx,
        };
        tokio::spawn(actor.run(request_rx, internal_rx));

        Self {
            requests,
            state,
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }

    fn post(&self, request: Request) {
        if self.requests.send(request).is_err() {
            debug!("chat client already disposed; request ignored");
        }
    }

    fn allocate_handle(&self) -> ListenerHandle {
        ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Open the connection. No-op if it is already open or opening.
    pub fn connect(&self) {
        self.post(Request::Connect);
    }

    /// Deliberately close the connection and cancel any pending reconnect.
    pub fn disconnect(&self) {
        self.post(Request::Disconnect);
    }

    /// Disconnect and stop the actor. Every handle becomes inert.
    pub fn dispose(&self) {
        self.post(Request::Dispose);
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves once the connection is open and the desired subscription has
    /// been replayed.
    pub async fn ready(&self) -> Result<(), SendError> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == ConnectionState::Connected)
            .await
            .map(|_| ())
            .map_err(|_| SendError::ClientClosed)
    }

    pub fn subscribe_to_group(&self, group: impl Into<GroupId>) {
        self.post(Request::Subscribe(group.into()));
    }

    /// Leave `group`, or the current group when `None`.
    pub fn unsubscribe_from_group(&self, group: Option<GroupId>) {
        self.post(Request::Unsubscribe(group));
    }

    pub fn add_on_private_message(
        &self,
        listener: impl Fn(&PrivateMessage) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let handle = self.allocate_handle();
        self.post(Request::AddPrivate(handle, Arc::new(listener)));
        handle
    }

    pub fn remove_on_private_message(&self, handle: ListenerHandle) {
        self.post(Request::RemoveListener(ListenerKind::Private, handle));
    }

    pub fn add_on_group_message(
        &self,
        listener: impl Fn(&GroupMessage) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let handle = self.allocate_handle();
        self.post(Request::AddGroup(handle, Arc::new(listener)));
        handle
    }

    pub fn remove_on_group_message(&self, handle: ListenerHandle) {
        self.post(Request::RemoveListener(ListenerKind::Group, handle));
    }

    pub fn add_on_transport_error(
        &self,
        listener: impl Fn(&TransportError) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let handle = self.allocate_handle();
        self.post(Request::AddTransportError(handle, Arc::new(listener)));
        handle
    }

    pub fn remove_on_transport_error(&self, handle: ListenerHandle) {
        self.post(Request::RemoveListener(ListenerKind::TransportError, handle));
    }

    /// Register a listener that forwards private messages into a channel.
    pub fn private_message_stream(
        &self,
    ) -> (ListenerHandle, mpsc::UnboundedReceiver<PrivateMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.add_on_private_message(move |msg| {
            let _ = tx.send(msg.clone());
        });
        (handle, rx)
    }

    /// Register a listener that forwards group messages into a channel.
    pub fn group_message_stream(&self) -> (ListenerHandle, mpsc::UnboundedReceiver<GroupMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.add_on_group_message(move |msg| {
            let _ = tx.send(msg.clone());
        });
        (handle, rx)
    }

    /// Hand a private message to the transport. Rejected immediately when not
    /// connected; nothing is queued for later.
    pub async fn send_private_message(
        &self,
        interlocutor: &UserId,
        text: &str,
    ) -> Result<(), SendError> {
        self.send(Command::SendPrivate {
            interlocutor_id: interlocutor.clone(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn send_group_message(&self, group: &GroupId, text: &str) -> Result<(), SendError> {
        self.send(Command::SendGroup {
            group_id: group.clone(),
            text: text.to_string(),
        })
        .await
    }

    async fn send(&self, command: Command) -> Result<(), SendError> {
        let (respond_to, response) = oneshot::channel();
        self.requests
            .send(Request::Send {
                command,
                respond_to,
            })
            .map_err(|_| SendError::ClientClosed)?;
        response.await.map_err(|_| SendError::ClientClosed)?
    }
}

struct ClientActor<C> {
    connector: Arc<C>,
    machine: ConnectionMachine,
    subscriptions: SubscriptionMux,
    router: MessageRouter,
    transport_errors: ListenerRegistry<TransportError>,
    link: Option<TransportLink>,
    /// Bumped on every dial and every deliberate disconnect.
    generation: u64,
    dial: Option<JoinHandle<()>>,
    backoff: Option<CancellationToken>,
    state_tx: watch::Sender<ConnectionState>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

async fn next_link_event(link: &mut Option<TransportLink>) -> TransportEvent {
    match link {
        // A link whose tasks vanished without a close event counts as an abrupt drop.
        Some(link) => link
            .inbound
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed { code: None }),
        None => std::future::pending().await,
    }
}

impl<C: Connector> ClientActor<C> {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        // Dial completions first so a replayed subscription precedes any
        // frame on a new link; then requests, so a listener removal or a
        // disconnect posted before a frame arrives is applied before it.
        loop {
            tokio::select! {
                biased;
                Some(event) = internal.recv() => self.handle_internal(event),
                request = requests.recv() => match request {
                    Some(Request::Dispose) | None => break,
                    Some(request) => self.handle_request(request),
                },
                event = next_link_event(&mut self.link) => self.handle_transport(event),
            }
        }

        self.teardown();
        info!("chat client disposed");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect => {
                if self.machine.connect() {
                    self.cancel_backoff();
                    self.start_dial();
                }
            }
            Request::Disconnect => self.teardown(),
            Request::Subscribe(group) => {
                let commands = self
                    .subscriptions
                    .subscribe(group, self.machine.is_connected());
                self.transmit_all(commands);
            }
            Request::Unsubscribe(group) => {
                let commands = self
                    .subscriptions
                    .unsubscribe(group, self.machine.is_connected());
                self.transmit_all(commands);
            }
            Request::AddPrivate(handle, listener) => self.router.add_private(handle, listener),
            Request::AddGroup(handle, listener) => self.router.add_group(handle, listener),
            Request::AddTransportError(handle, listener) => {
                self.transport_errors.insert(handle, listener)
            }
            Request::RemoveListener(kind, handle) => {
                let removed = match kind {
                    ListenerKind::Private => self.router.remove_private(handle),
                    ListenerKind::Group => self.router.remove_group(handle),
                    ListenerKind::TransportError => self.transport_errors.remove(handle),
                };
                if !removed {
                    debug!(?kind, ?handle, "listener already removed");
                }
            }
            Request::Send {
                command,
                respond_to,
            } => {
                let result = self.transmit(&command);
                if let Err(e) = &result {
                    warn!(error = %e, "send rejected");
                }
                let _ = respond_to.send(result);
            }
            // Handled by the run loop.
            Request::Dispose => {}
        }
        self.publish_state();
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Dialed { generation, result } => {
                self.dial = None;
                if generation != self.generation {
                    if let Ok(link) = result {
                        debug!("discarding link from an abandoned dial");
                        link.close(INTENTIONAL_CLOSE, "superseded");
                    }
                    return;
                }
                match result {
                    Ok(link) => self.on_open(link),
                    Err(e) => {
                        warn!(error = %e, "dial failed");
                        self.transport_errors.emit(&e);
                        if let Some(delay) = self.machine.dial_failed() {
                            self.schedule_reconnect(delay);
                        }
                    }
                }
            }
            Internal::BackoffElapsed { generation } => {
                if generation != self.generation {
                    return;
                }
                self.backoff = None;
                if self.machine.backoff_elapsed() {
                    self.start_dial();
                }
            }
        }
        self.publish_state();
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => {
                self.router.dispatch_frame(&frame);
            }
            TransportEvent::Error(e) => {
                warn!(error = %e, "transport error");
                self.transport_errors.emit(&e);
            }
            TransportEvent::Closed { code } => {
                info!(code = ?code, "connection closed");
                self.link = None;
                self.subscriptions.connection_lost();
                if let Some(delay) = self.machine.closed(code) {
                    self.schedule_reconnect(delay);
                }
            }
        }
        self.publish_state();
    }

    fn on_open(&mut self, link: TransportLink) {
        self.link = Some(link);
        let opened = self.machine.opened();
        info!(recovered_after = opened.recovered_after, "connected");

        // Replay before the state is published: consumers must not observe
        // Connected until the desired channel is back.
        if let Some(command) = self.subscriptions.replay() {
            if let Err(e) = self.transmit(&command) {
                warn!(error = %e, "failed to replay subscription");
            }
        }
    }

    fn start_dial(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let connector = self.connector.clone();
        let internal_tx = self.internal_tx.clone();
        debug!(generation, "dialing");
        self.dial = Some(tokio::spawn(async move {
            let result = connector.connect().await;
            let _ = internal_tx.send(Internal::Dialed { generation, result });
        }));
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        self.cancel_backoff();
        let token = CancellationToken::new();
        self.backoff = Some(token.clone());
        let generation = self.generation;
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = internal_tx.send(Internal::BackoffElapsed { generation });
                }
            }
        });
    }

    fn cancel_backoff(&mut self) {
        if let Some(token) = self.backoff.take() {
            token.cancel();
        }
    }

    /// Deliberate close: cancel timers and dials, close with the intentional code.
    fn teardown(&mut self) {
        self.cancel_backoff();
        if let Some(dial) = self.dial.take() {
            dial.abort();
        }
        self.generation += 1;
        if let Some(link) = self.link.take() {
            link.close(INTENTIONAL_CLOSE, "client disconnect");
        }
        self.subscriptions.connection_lost();
        if self.machine.disconnect() {
            info!("disconnected");
        }
        self.publish_state();
    }

    fn transmit(&self, command: &Command) -> Result<(), SendError> {
        if !self.machine.is_connected() {
            return Err(SendError::NotConnected);
        }
        let link = self.link.as_ref().ok_or(SendError::NotConnected)?;
        let frame = command.encode();
        debug!(frame = %frame, "send");
        link.send_text(frame).map_err(SendError::from)
    }

    fn transmit_all(&self, commands: Vec<Command>) {
        for command in commands {
            if let Err(e) = self.transmit(&command) {
                warn!(error = %e, ?command, "failed to send subscription command");
            }
        }
    }

    fn publish_state(&self) {
        let state = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MessageHistory;
    use crate::optimistic::send_optimistic;
    use crate::test_helpers::{MockConnector, settle, wait_until};
    use crate::transport::OutboundFrame;
    use crate::types::Thread;
    use std::sync::Mutex;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(100),
                cap: Duration::from_millis(800),
            },
        }
    }

    fn text(frame: &OutboundFrame) -> &str {
        match frame {
            OutboundFrame::Text(t) => t,
            OutboundFrame::Close { .. } => "<close>",
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let connector = MockConnector::new();
        let client = ChatClient::init(connector.clone(), fast_config());

        client.connect();
        client.connect();
        client.ready().await.unwrap();
        client.connect();
        settle().await;

        assert_eq!(connector.dials(), 1);
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_disconnected_is_rejected() {
        let connector = MockConnector::new();
        let client = ChatClient::init(connector.clone(), fast_config());

        let result = client
            .send_private_message(&UserId::new("u2"), "hello")
            .await;
        assert_eq!(result, Err(SendError::NotConnected));
        assert_eq!(connector.dials(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_reconnecting_is_rejected_and_rolled_back() {
        let connector = MockConnector::new();
        let client = ChatClient::init(
            connector.clone(),
            ClientConfig {
                reconnect: ReconnectPolicy {
                    base: Duration::from_secs(10),
                    cap: Duration::from_secs(60),
                },
            },
        );
        client.connect();
        client.ready().await.unwrap();

        connector.push(0, TransportEvent::Closed { code: Some(1006) });
        wait_until(|| client.connection_state() == ConnectionState::Reconnecting).await;

        let result = client.send_group_message(&GroupId::new("g1"), "hi").await;
        assert_eq!(result, Err(SendError::NotConnected));

        let mut history = MessageHistory::new(Thread::private("u2"));
        let err = send_optimistic(&client, &mut history, &UserId::new("me"), "hello")
            .await
            .unwrap_err();
        assert_eq!(err.error, SendError::NotConnected);
        assert_eq!(history.pending_count(), 0);
        assert!(history.is_empty());

        assert_eq!(client.connection_state(), ConnectionState::Reconnecting);
        assert!(connector.sent_on(0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn switching_groups_sends_unsub_then_sub() {
        let connector = MockConnector::new();
        let client = ChatClient::init(connector.clone(), fast_config());
        client.connect();
        client.ready().await.unwrap();

        client.subscribe_to_group("A");
        client.subscribe_to_group("A");
        client.subscribe_to_group("B");
        settle().await;

        let sent: Vec<String> = connector
            .sent_on(0)
            .iter()
            .map(|f| text(f).to_string())
            .collect();
        assert_eq!(sent, vec!["sub:A", "unsub:A", "sub:B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_close_reconnects_and_replays_subscription_first() {
        let connector = MockConnector::new();
        let client = ChatClient::init(connector.clone(), fast_config());
        client.connect();
        client.ready().await.unwrap();
        client.subscribe_to_group("g1");
        settle().await;

        // Every new link arrives with a frame already queued. The listener
        // snapshots what had been sent on that link when the frame is delivered.
        let delivered_after = Arc::new(Mutex::new(Vec::<Vec<String>>::new()));
        let server = connector.clone();
        let log = delivered_after.clone();
        client.add_on_group_message(move |_| {
            let idx = server.dials() - 1;
            let sent = server
                .sent_on(idx)
                .iter()
                .map(|f| text(f).to_string())
                .collect();
            log.lock().unwrap().push(sent);
        });
        connector.greet_with(
            r#"[{"id":"9","groupId":"g1","senderId":"u3","text":"hey","createdAt":0}]"#,
        );

        connector.push(0, TransportEvent::Closed { code: Some(1006) });
        wait_until(|| client.connection_state() == ConnectionState::Reconnecting).await;
        wait_until(|| connector.dials() == 2).await;
        client.ready().await.unwrap();
        settle().await;

        let sent: Vec<String> = connector
            .sent_on(1)
            .iter()
            .map(|f| text(f).to_string())
            .collect();
        assert_eq!(sent, vec!["sub:g1"]);
        assert_eq!(*delivered_after.lock().unwrap(), vec![vec!["sub:g1".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_while_disconnected_is_sent_on_open() {
        let connector = MockConnector::new();
        let client = ChatClient::init(connector.clone(), fast_config());
        client.subscribe_to_group("g7");
        settle().await;
        assert_eq!(connector.dials(), 0);

        client.connect();
        client.ready().await.unwrap();
        let sent = connector.sent_on(0);
        assert_eq!(sent.len(), 1);
        assert_eq!(text(&sent[0]), "sub:g7");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dials_back_off_until_success() {
        let connector = MockConnector::new();
        connector.fail_next(3);
        let errors = Arc::new(Mutex::new(0usize));
        let client = ChatClient::init(connector.clone(), fast_config());
        let counter = errors.clone();
        client.add_on_transport_error(move |_| *counter.lock().unwrap() += 1);

        let started = tokio::time::Instant::now();
        client.connect();
        client.ready().await.unwrap();

        // 100 + 200 + 400 ms of backoff between the four dials.
        assert!(started.elapsed() >= Duration::from_millis(700));
        assert_eq!(connector.dials(), 4);
        assert_eq!(*errors.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let connector = MockConnector::new();
        let client = ChatClient::init(connector.clone(), fast_config());
        client.connect();
        client.ready().await.unwrap();

        connector.push(0, TransportEvent::Closed { code: None });
        wait_until(|| client.connection_state() == ConnectionState::Reconnecting).await;
        client.disconnect();
        settle().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.dials(), 1);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn deliberate_disconnect_sends_intentional_close() {
        let connector = MockConnector::new();
        let client = ChatClient::init(connector.clone(), fast_config());
        client.connect();
        client.ready().await.unwrap();
        client.disconnect();
        settle().await;

        let sent = connector.sent_on(0);
        assert_eq!(
            sent.last(),
            Some(&OutboundFrame::Close {
                code: INTENTIONAL_CLOSE,
                reason: "client disconnect".into()
            })
        );
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.dials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_do_not_change_state() {
        let connector = MockConnector::new();
        let client = ChatClient::init(connector.clone(), fast_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client.add_on_transport_error(move |e| sink.lock().unwrap().push(e.clone()));
        client.connect();
        client.ready().await.unwrap();

        connector.push(0, TransportEvent::Error(TransportError::Io("reset".into())));
        settle().await;
        assert!(client.is_connected());
        assert_eq!(*seen.lock().unwrap(), vec![TransportError::Io("reset".into())]);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_listener_stops_receiving() {
        let connector = MockConnector::new();
        let client = ChatClient::init(connector.clone(), fast_config());
        let (handle, mut rx) = client.private_message_stream();
        client.connect();
        client.ready().await.unwrap();

        let frame = r#"[{"id":"1","conversationId":"c1","senderId":"u2","text":"a","createdAt":0}]"#;
        connector.push(0, TransportEvent::Frame(frame.into()));
        settle().await;
        assert_eq!(rx.recv().await.unwrap().message.text, "a");

        client.remove_on_private_message(handle);
        connector.push(0, TransportEvent::Frame(frame.into()));
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_makes_sends_fail_closed() {
        let connector = MockConnector::new();
        let client = ChatClient::init(connector.clone(), fast_config());
        client.connect();
        client.ready().await.unwrap();
        client.dispose();
        settle().await;

        let result = client.send_group_message(&GroupId::new("g"), "x").await;
        assert_eq!(result, Err(SendError::ClientClosed));
    }
}
