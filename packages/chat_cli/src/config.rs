use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use chat_link::{ReconnectPolicy, UserId};
use serde::{Deserialize, Serialize};

// Layered configuration: struct defaults, then config.toml, then env vars.
//
//   config.toml:     [connection]
//                    base_delay_ms = 500
//
//   env var:         CHAT_CONNECTION__BASE_DELAY_MS=500   (double underscore = nesting)

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub api: ApiFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub pages: PagesFileConfig,
}

/// `[connection]`: the realtime endpoint and its reconnect backoff.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_ws_url")]
    pub url: String,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            url: default_ws_url(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// `[api]`: the HTTP endpoints behind conversation and history paging.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiFileConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PagesFileConfig {
    #[serde(default = "default_conversation_page")]
    pub conversations: usize,
    #[serde(default = "default_message_page")]
    pub messages: usize,
}

impl Default for PagesFileConfig {
    fn default() -> Self {
        Self {
            conversations: default_conversation_page(),
            messages: default_message_page(),
        }
    }
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}
fn default_api_base_url() -> String {
    "http://127.0.0.1:8080/api".to_string()
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_conversation_page() -> usize {
    chat_link::conversations::DEFAULT_CONVERSATION_PAGE
}
fn default_message_page() -> usize {
    chat_link::history::DEFAULT_MESSAGE_PAGE
}

/// Where `config.toml` lives unless `--config-dir` says otherwise.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chat")
}

/// Build a figment that layers: defaults → config.toml → CHAT_* env vars.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("CHAT_").split("__"))
}

/// Command-line flags that win over every file and env layer.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub url: Option<String>,
    pub api: Option<String>,
    pub user: Option<String>,
}

/// Resolved runtime configuration.
#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub ws_url: String,
    pub token: Option<String>,
    pub api_base_url: String,
    pub api_timeout: Duration,
    pub user_id: Option<UserId>,
    pub reconnect: ReconnectPolicy,
    pub conversation_page: usize,
    pub message_page: usize,
}

impl ChatConfig {
    pub fn resolve(fc: FileConfig, overrides: Overrides) -> Result<Self> {
        let conn = fc.connection;
        if conn.base_delay_ms == 0 {
            bail!("connection.base_delay_ms must be positive");
        }
        if conn.max_delay_ms < conn.base_delay_ms {
            bail!(
                "connection.max_delay_ms ({}) is below base_delay_ms ({})",
                conn.max_delay_ms,
                conn.base_delay_ms
            );
        }
        if fc.pages.conversations == 0 || fc.pages.messages == 0 {
            bail!("page sizes must be positive");
        }

        Ok(Self {
            ws_url: overrides.url.unwrap_or(conn.url),
            token: fc.session.token.filter(|t| !t.is_empty()),
            api_base_url: overrides
                .api
                .unwrap_or(fc.api.base_url)
                .trim_end_matches('/')
                .to_string(),
            api_timeout: Duration::from_secs(fc.api.timeout_secs),
            user_id: overrides
                .user
                .or(fc.session.user_id)
                .filter(|u| !u.is_empty())
                .map(UserId::new),
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(conn.base_delay_ms),
                cap: Duration::from_millis(conn.max_delay_ms),
            },
            conversation_page: fc.pages.conversations,
            message_page: fc.pages.messages,
        })
    }
}
