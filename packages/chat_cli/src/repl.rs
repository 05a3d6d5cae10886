//! Interactive terminal session.
//!
//! Lines starting with `/` are commands; anything else is sent to the open
//! conversation or group. Incoming messages are printed as they arrive.

use anyhow::{Context, Result};
use chat_link::{
    ChatApi, ChatClient, ChatError, ChatMessage, ConversationList, GroupId, GroupMessage,
    GroupView, MessageHistory, PrivateMessage, Reconciled, RolledBack, Thread, UserId,
    send_optimistic,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

const HELP: &str = "\
/list             show conversations
/more             load older conversations
/open <user>      open the conversation with a user
/group <id>       enter a group channel
/leave            leave the current conversation or group
/older            load older messages
/quit             exit";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    List,
    More,
    Open(UserId),
    Group(GroupId),
    Leave,
    Older,
    Send(String),
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Action>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(Action::Send(line.to_string())));
    };

    let mut parts = command.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

    let action = match (name, arg) {
        ("list", None) => Action::List,
        ("more", None) => Action::More,
        ("open", Some(user)) => Action::Open(UserId::new(user)),
        ("group", Some(group)) => Action::Group(GroupId::new(group)),
        ("leave", None) => Action::Leave,
        ("older", None) => Action::Older,
        ("help", None) => Action::Help,
        ("quit", None) | ("exit", None) => Action::Quit,
        ("open", None) | ("group", None) => return Err(format!("/{name} needs an argument")),
        _ => return Err(format!("unknown command /{name}; try /help")),
    };
    Ok(Some(action))
}

pub fn render(message: &ChatMessage, me: &UserId) -> String {
    let who = if &message.sender_id == me {
        "you"
    } else {
        message.sender_id.as_str()
    };
    let marker = if message.pending { " (sending)" } else { "" };
    format!(
        "[{}] {}: {}{}",
        message.created_at.format("%H:%M"),
        who,
        message.text,
        marker
    )
}

/// Print a failure with its stable code, and whether trying again may help.
fn report(context: &str, err: impl Into<ChatError>) {
    let err = err.into();
    let hint = if err.is_retryable() { "; try again" } else { "" };
    eprintln!("{context}: {err} [{}]{hint}", err.error_code());
}

pub struct Repl<A> {
    client: ChatClient,
    api: A,
    me: UserId,
    conversations: ConversationList,
    history: Option<MessageHistory>,
    group: Option<GroupView>,
    message_page: usize,
}

async fn next_group_event(view: &mut Option<GroupView>) -> Option<GroupMessage> {
    match view {
        Some(view) => view.recv().await,
        None => std::future::pending().await,
    }
}

impl<A: ChatApi> Repl<A> {
    pub fn new(
        client: ChatClient,
        api: A,
        me: UserId,
        conversations: ConversationList,
        message_page: usize,
    ) -> Self {
        Self {
            client,
            api,
            me,
            conversations,
            history: None,
            group: None,
            message_page,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let (private_handle, mut private_rx) = self.client.private_message_stream();
        let mut state = self.client.watch_state();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        self.client.connect();
        if let Err(e) = self.conversations.load_initial(&self.api).await {
            warn!(error = %e, "could not load conversations");
        }
        println!("{HELP}");

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("reading stdin")? else { break };
                    if !self.handle_line(&line).await {
                        break;
                    }
                }
                Some(event) = private_rx.recv() => self.on_private(event).await,
                Some(event) = next_group_event(&mut self.group) => self.on_group(event),
                Ok(()) = state.changed() => {
                    let current = *state.borrow_and_update();
                    eprintln!("-- {current}");
                }
            }
        }

        self.client.remove_on_private_message(private_handle);
        if let Some(view) = self.group.take() {
            view.leave();
        }
        self.client.dispose();
        Ok(())
    }

    /// Returns false when the session should end.
    async fn handle_line(&mut self, line: &str) -> bool {
        let action = match parse_line(line) {
            Ok(Some(action)) => action,
            Ok(None) => return true,
            Err(message) => {
                eprintln!("{message}");
                return true;
            }
        };
        debug!(?action, "input");

        match action {
            Action::Quit => return false,
            Action::Help => println!("{HELP}"),
            Action::List => self.print_conversations(),
            Action::More => match self.conversations.load_more(&self.api).await {
                Ok(0) if !self.conversations.has_more() => println!("no more conversations"),
                Ok(_) => self.print_conversations(),
                Err(e) => report("could not load conversations", e),
            },
            Action::Open(user) => self.open_conversation(user).await,
            Action::Group(group) => self.enter_group(group).await,
            Action::Leave => self.leave(),
            Action::Older => self.load_older().await,
            Action::Send(text) => self.send(text).await,
        }
        true
    }

    fn print_conversations(&self) {
        println!("unread: {}", self.conversations.unread_total());
        for row in self.conversations.rows() {
            let name = row
                .interlocutor
                .display_name
                .as_deref()
                .unwrap_or(row.interlocutor.id.as_str());
            let preview = row
                .last_message
                .as_ref()
                .map(|m| m.text.as_str())
                .unwrap_or("");
            let unread = match row.unread_count {
                0 => String::new(),
                n => format!(" ({n})"),
            };
            println!("  {name}{unread}: {preview}");
        }
    }

    fn print_history(&self) {
        if let Some(history) = &self.history {
            for message in history.items() {
                println!("{}", render(message, &self.me));
            }
        }
    }

    async fn load_history(&mut self, thread: Thread) {
        let mut history = MessageHistory::with_page_size(thread, self.message_page);
        if let Err(e) = history.load_initial(&self.api).await {
            report("could not load history", e);
        }
        self.history = Some(history);
        self.print_history();
    }

    async fn open_conversation(&mut self, user: UserId) {
        self.leave();
        if let Err(e) = self.conversations.open(&self.api, &user).await {
            report("could not mark conversation read", e);
        }
        let conversation = self
            .conversations
            .find(&user)
            .and_then(|row| row.conversation_id.clone());
        self.load_history(Thread::Private {
            interlocutor: user,
            conversation,
        })
        .await;
    }

    async fn enter_group(&mut self, group: GroupId) {
        self.leave();
        self.group = Some(GroupView::enter(&self.client, group.clone()));
        self.load_history(Thread::Group(group)).await;
    }

    fn leave(&mut self) {
        if let Some(view) = self.group.take() {
            view.leave();
        }
        self.conversations.close_active();
        self.history = None;
    }

    async fn load_older(&mut self) {
        let Some(history) = self.history.as_mut() else {
            eprintln!("nothing open");
            return;
        };
        match history.load_more(&self.api).await {
            Ok(Some(anchor)) => {
                println!("-- {} older messages", anchor.inserted_before);
                self.print_history();
            }
            Ok(None) => println!("-- start of history"),
            Err(e) => report("could not load history", e),
        }
    }

    async fn send(&mut self, text: String) {
        let Some(history) = self.history.as_mut() else {
            eprintln!("open a conversation or group first");
            return;
        };
        match send_optimistic(&self.client, history, &self.me, &text).await {
            Ok(_) => {
                if let Some(pending) = history.items().last() {
                    println!("{}", render(pending, &self.me));
                }
            }
            Err(RolledBack { text, error }) => {
                report("not sent", error);
                eprintln!("your message was: {text}");
            }
        }
    }

    async fn on_private(&mut self, event: PrivateMessage) {
        if let Some(request) = self.conversations.on_private_message(&event, &self.me) {
            if let Err(e) = self.conversations.bootstrap(&self.api, &request).await {
                warn!(error = %e, "could not fetch new conversation");
            }
        }

        let Some(history) = self.history.as_mut() else {
            println!("{} (new message)", render(&event.message, &self.me));
            return;
        };
        match history.ingest_private(&event, &self.me) {
            Some(Reconciled::Replaced { .. }) => {
                // Own echo: now that the conversation id is known, make sure
                // the list has a row for it.
                if let Thread::Private { interlocutor, .. } = history.thread() {
                    let interlocutor = interlocutor.clone();
                    if let Some(request) = self.conversations.note_outgoing(&interlocutor, &event) {
                        if let Err(e) = self.conversations.bootstrap(&self.api, &request).await {
                            warn!(error = %e, "could not fetch new conversation");
                        }
                    }
                }
            }
            Some(Reconciled::Fresh { .. }) => println!("{}", render(&event.message, &self.me)),
            Some(Reconciled::Duplicate) => {}
            None => println!("{} (new message)", render(&event.message, &self.me)),
        }
    }

    fn on_group(&mut self, event: GroupMessage) {
        let Some(history) = self.history.as_mut() else {
            return;
        };
        if let Some(Reconciled::Fresh { .. }) = history.ingest_group(&event, &self.me) {
            println!("{}", render(&event.message, &self.me));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_send() {
        assert_eq!(
            parse_line("  hello there "),
            Ok(Some(Action::Send("hello there".into())))
        );
        assert_eq!(parse_line("   "), Ok(None));
    }

    #[test]
    fn commands_take_arguments() {
        assert_eq!(
            parse_line("/open u2"),
            Ok(Some(Action::Open(UserId::new("u2"))))
        );
        assert_eq!(
            parse_line("/group lobby"),
            Ok(Some(Action::Group(GroupId::new("lobby"))))
        );
        assert_eq!(parse_line("/quit"), Ok(Some(Action::Quit)));
        assert!(parse_line("/open").is_err());
        assert!(parse_line("/dance").is_err());
    }

    #[test]
    fn pending_messages_are_marked() {
        let me = UserId::new("me");
        let mut message = ChatMessage::pending(me.clone(), "hi");
        message.created_at = chrono::DateTime::from_timestamp(3600 * 13 + 60 * 5, 0).unwrap();
        assert_eq!(render(&message, &me), "[13:05] you: hi (sending)");

        message.pending = false;
        message.sender_id = UserId::new("bea");
        assert_eq!(render(&message, &me), "[13:05] bea: hi");
    }
}
