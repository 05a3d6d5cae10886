//! HTTP implementation of the conversation and history collaborators.
//!
//! ```text
//! GET  {base}/conversations?limit=&cursor=          -> {items, hasMore}
//! GET  {base}/messages?interlocutorId=|groupId=&before=&limit=
//!                                                   -> {items, hasMore}
//! POST {base}/conversations/{id}/read  {lastMessageId}  -> {success}
//! GET  {base}/conversations/lookup?interlocutorId=&conversationId=
//!                                                   -> conversation | null
//! ```

use std::time::Duration;

use chat_link::{
    ChatApi, ChatMessage, Conversation, ConversationId, FetchError, ListMessages,
    MessageBoundary, MessageId, Page, ThreadRef, UserId,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct MarkReadResponse {
    #[serde(default)]
    success: bool,
}

impl HttpApi {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&'static str, String)],
    ) -> Result<T, FetchError> {
        debug!(path, ?query, "GET");
        let response = self
            .authorize(self.client.get(self.url(path)).query(query))
            .send()
            .await
            .map_err(from_reqwest)?;
        decode(response).await
    }
}

/// Map transport-level reqwest failures. Body decoding is reported as
/// [`FetchError::Decode`] so it is not offered for retry.
fn from_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_decode() {
        FetchError::Decode(err.to_string())
    } else {
        FetchError::Request(err.to_string())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, FetchError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(FetchError::Status {
            status: status.as_u16(),
            message,
        });
    }
    let body = response.bytes().await.map_err(from_reqwest)?;
    serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversations_query(cursor: Option<DateTime<Utc>>, limit: usize) -> Vec<(&'static str, String)> {
    let mut query = vec![("limit", limit.to_string())];
    if let Some(cursor) = cursor {
        query.push(("cursor", timestamp(cursor)));
    }
    query
}

fn messages_query(request: &ListMessages) -> Vec<(&'static str, String)> {
    let mut query = match &request.thread {
        ThreadRef::Interlocutor(id) => vec![("interlocutorId", id.to_string())],
        ThreadRef::Group(id) => vec![("groupId", id.to_string())],
    };
    if let Some(MessageBoundary::Before(id)) = &request.boundary {
        query.push(("before", id.to_string()));
    }
    query.push(("limit", request.limit.to_string()));
    query
}

impl ChatApi for HttpApi {
    async fn list_conversations(
        &self,
        cursor: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Page<Conversation>, FetchError> {
        self.get_json("/conversations", &conversations_query(cursor, limit))
            .await
    }

    async fn list_messages(&self, request: ListMessages) -> Result<Page<ChatMessage>, FetchError> {
        self.get_json("/messages", &messages_query(&request)).await
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        last_message_id: Option<&MessageId>,
    ) -> Result<bool, FetchError> {
        let path = format!("/conversations/{conversation_id}/read");
        debug!(path, "POST");
        let response = self
            .authorize(self.client.post(self.url(&path)))
            .json(&serde_json::json!({ "lastMessageId": last_message_id }))
            .send()
            .await
            .map_err(from_reqwest)?;
        let body: MarkReadResponse = decode(response).await?;
        Ok(body.success)
    }

    async fn get_conversation(
        &self,
        interlocutor: &UserId,
        conversation_id: Option<&ConversationId>,
    ) -> Result<Option<Conversation>, FetchError> {
        let mut query = vec![("interlocutorId", interlocutor.to_string())];
        if let Some(id) = conversation_id {
            query.push(("conversationId", id.to_string()));
        }
        match self.get_json("/conversations/lookup", &query).await {
            Err(FetchError::Status { status: 404, .. }) => Ok(None),
            other => other,
        }
    }
}
