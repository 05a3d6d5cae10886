//! Error taxonomy for the messaging core.
//!
//! Nothing here is fatal. Transport errors are absorbed by the reconnect
//! loop, protocol errors drop a single record, send errors roll back an
//! optimistic message and fetch errors are handed to the caller to retry.

/// Connect or send failure on the duplex transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("transport i/o error: {0}")]
    Io(String),

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
}

/// A malformed inbound frame or record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("record carries neither groupId nor conversationId")]
    MissingTarget,

    #[error("record carries both groupId and conversationId")]
    AmbiguousTarget,

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// A collaborator call failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid response body: {0}")]
    Decode(String),
}

/// An outbound message could not be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("chat client has been disposed")]
    ClientClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Send(#[from] SendError),
}

impl ChatError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Transport(TransportError::Connect(_)) => "connect_failed",
            Self::Transport(TransportError::Send(_)) => "send_failed",
            Self::Transport(TransportError::Io(_)) => "transport_io",
            Self::Transport(TransportError::InvalidUrl(_)) => "invalid_url",
            Self::Protocol(_) => "protocol_error",
            Self::Fetch(FetchError::Status { .. }) => "fetch_status",
            Self::Fetch(FetchError::Request(_)) => "fetch_failed",
            Self::Fetch(FetchError::Decode(_)) => "fetch_decode",
            Self::Send(SendError::NotConnected) => "not_connected",
            Self::Send(SendError::Transport(_)) => "send_failed",
            Self::Send(SendError::ClientClosed) => "client_closed",
        }
    }

    /// Whether offering the user a retry makes sense.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Protocol(_)
            | Self::Transport(TransportError::InvalidUrl(_))
            | Self::Send(SendError::ClientClosed) => false,
            Self::Fetch(FetchError::Status { status, .. }) => *status >= 500 || *status == 429,
            Self::Fetch(FetchError::Decode(_)) => false,
            _ => true,
        }
    }
}
