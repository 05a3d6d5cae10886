use std::path::PathBuf;

use anyhow::{Context, Result};
use chat_link::{
    ChatClient, ClientConfig, ConversationList, MessageHistory, SessionStore, StaticSession,
    Thread, UserId, WsConnector,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;

mod config;
mod http_api;
mod repl;

use crate::config::{ChatConfig, Overrides};
use crate::http_api::HttpApi;

#[derive(Parser)]
#[command(name = "chat")]
#[command(about = "Terminal client for private and group chat")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory holding config.toml (defaults to the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Realtime endpoint, e.g. wss://chat.example/ws
    #[arg(long, global = true)]
    url: Option<String>,

    /// Base URL of the conversation/history API
    #[arg(long, global = true)]
    api: Option<String>,

    /// Local user id
    #[arg(long, global = true)]
    user: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session (the default)
    Chat,

    /// Print the conversation list and exit
    Conversations(ConversationsArgs),

    /// Print the recent history of a conversation or group and exit
    History(HistoryArgs),
}

#[derive(Parser)]
struct ConversationsArgs {
    /// How many pages to fetch
    #[arg(long, default_value = "1")]
    pages: usize,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct HistoryArgs {
    /// Interlocutor user id, or group id with --group
    target: String,

    /// Treat the target as a group id
    #[arg(short, long)]
    group: bool,

    /// How many pages to fetch
    #[arg(long, default_value = "1")]
    pages: usize,
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "chat=debug,chat_link=debug,info"
    } else {
        "chat=info,chat_link=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config_dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(config::default_config_dir);
    let file_config = config::load_config(&config_dir)
        .extract()
        .with_context(|| format!("Failed to load config from {}", config_dir.display()))?;
    let config = ChatConfig::resolve(
        file_config,
        Overrides {
            url: cli.url,
            api: cli.api,
            user: cli.user,
        },
    )?;

    let api = HttpApi::new(&config.api_base_url, config.token.clone(), config.api_timeout)
        .context("Failed to build HTTP client")?;

    match cli.command {
        None | Some(Commands::Chat) => chat_command(config, api).await,
        Some(Commands::Conversations(args)) => conversations_command(&config, &api, args).await,
        Some(Commands::History(args)) => history_command(&config, &api, args).await,
    }
}

async fn chat_command(config: ChatConfig, api: HttpApi) -> Result<()> {
    let user = config
        .user_id
        .clone()
        .context("No user id configured; pass --user or set [session] user_id")?;
    let session = StaticSession(user);
    let me = session
        .current_user_id()
        .context("Session has no current user")?;

    info!(user = %me, url = %config.ws_url, "starting chat session");
    let connector = WsConnector::new(&config.ws_url, config.token.as_deref())
        .with_context(|| format!("Invalid realtime URL {}", config.ws_url))?;
    let client = ChatClient::init(
        connector,
        ClientConfig {
            reconnect: config.reconnect,
        },
    );

    let conversations = ConversationList::new(config.conversation_page);
    repl::Repl::new(client, api, me, conversations, config.message_page)
        .run()
        .await
}

async fn conversations_command(
    config: &ChatConfig,
    api: &HttpApi,
    args: ConversationsArgs,
) -> Result<()> {
    let mut list = ConversationList::new(config.conversation_page);
    list.load_initial(api)
        .await
        .context("Failed to list conversations")?;
    for _ in 1..args.pages {
        if !list.has_more() {
            break;
        }
        list.load_more(api)
            .await
            .context("Failed to list conversations")?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(list.rows())?);
        return Ok(());
    }

    println!("{} conversations, {} unread", list.rows().len(), list.unread_total());
    for row in list.rows() {
        let name = row
            .interlocutor
            .display_name
            .as_deref()
            .unwrap_or(row.interlocutor.id.as_str());
        println!(
            "  {:<24} {:>3} unread  {}",
            name,
            row.unread_count,
            row.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    if list.has_more() {
        println!("  ... more available (--pages)");
    }
    Ok(())
}

async fn history_command(config: &ChatConfig, api: &HttpApi, args: HistoryArgs) -> Result<()> {
    let thread = if args.group {
        Thread::group(args.target.as_str())
    } else {
        Thread::private(args.target.as_str())
    };
    let mut history = MessageHistory::with_page_size(thread, config.message_page);
    history
        .load_initial(api)
        .await
        .context("Failed to load history")?;
    for _ in 1..args.pages {
        if history
            .load_more(api)
            .await
            .context("Failed to load history")?
            .is_none()
        {
            break;
        }
    }

    let me = config.user_id.clone().unwrap_or_else(|| UserId::new(""));
    for message in history.items() {
        println!("{}", repl::render(message, &me));
    }
    Ok(())
}
