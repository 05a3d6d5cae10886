//! Duplex transport seam.
//!
//! The client actor only sees a [`TransportLink`]: a pair of channels plus a
//! cancellation token. [`WsConnector`] backs it with a WebSocket; tests use an
//! in-memory connector.

use std::future::Future;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::error::TransportError;

/// A frame queued for the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Something that happened on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    /// Reported to error listeners. Does not by itself change connection state.
    Error(TransportError),
    /// The link is gone. `code` is `None` for an abrupt drop.
    Closed { code: Option<u16> },
}

/// One open connection. Dropping it tears down the I/O tasks behind it.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
    cancel: CancellationToken,
}

impl TransportLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            inbound,
            cancel,
        }
    }

    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(OutboundFrame::Text(text))
            .map_err(|_| TransportError::Send("link writer has stopped".into()))
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.outbound.send(OutboundFrame::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens transport links. Implementations must be cheap to call repeatedly;
/// the client dials again on every reconnect.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<TransportLink, TransportError>> + Send;
}

/// WebSocket connector built on tokio-tungstenite.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// `token`, when present, is passed as the `token` query parameter.
    pub fn new(url: &str, token: Option<&str>) -> Result<Self, TransportError> {
        let mut parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if let Some(token) = token {
            parsed.query_pairs_mut().append_pair("token", token);
        }
        Ok(Self { url: parsed.into() })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    async fn connect(&self) -> Result<TransportLink, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(url = %self.url, "websocket open");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let cancel = CancellationToken::new();

        // Writer: drain outbound channel into the socket. Queued frames win
        // over cancellation so a final close frame still goes out.
        let writer_cancel = cancel.clone();
        let writer_events = in_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    frame = out_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let (msg, closing) = match frame {
                            OutboundFrame::Text(text) => (tungstenite::Message::Text(text.into()), false),
                            OutboundFrame::Close { code, reason } => (
                                tungstenite::Message::Close(Some(CloseFrame {
                                    code: code.into(),
                                    reason: reason.into(),
                                })),
                                true,
                            ),
                        };
                        if let Err(e) = ws_write.send(msg).await {
                            error!("websocket write error: {}", e);
                            let _ = writer_events
                                .send(TransportEvent::Error(TransportError::Send(e.to_string())));
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    _ = writer_cancel.cancelled() => break,
                }
            }
        });

        // Reader: forward text frames and the close code.
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let code = loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => return,
                    msg = ws_read.next() => {
                        match msg {
                            Some(Ok(tungstenite::Message::Text(text))) => {
                                let _ = in_tx.send(TransportEvent::Frame(text.as_str().to_owned()));
                            }
                            Some(Ok(tungstenite::Message::Binary(bytes))) => {
                                match String::from_utf8(bytes.to_vec()) {
                                    Ok(text) => {
                                        let _ = in_tx.send(TransportEvent::Frame(text));
                                    }
                                    Err(e) => {
                                        let _ = in_tx.send(TransportEvent::Error(TransportError::Io(
                                            format!("non-utf8 binary frame: {e}"),
                                        )));
                                    }
                                }
                            }
                            Some(Ok(tungstenite::Message::Close(frame))) => {
                                break frame.map(|f| u16::from(f.code));
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = in_tx.send(TransportEvent::Error(TransportError::Io(e.to_string())));
                                break None;
                            }
                            None => break None,
                        }
                    }
                }
            };
            debug!(code = ?code, "websocket closed");
            let _ = in_tx.send(TransportEvent::Closed { code });
        });

        Ok(TransportLink::new(out_tx, in_rx, cancel))
    }
}
