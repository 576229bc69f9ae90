use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::errors::AppError;

/// One open transport, seen as a pair of text channels.
///
/// Dropping `outbound` closes the transport; `inbound` yields `None` once the
/// peer has gone away.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens transports for the connection manager.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self) -> Result<Link, AppError>;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> Result<Link, AppError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| AppError::TransportConnect { url: self.url.clone(), source: e })?;
        debug!("WebSocket opened to {}", self.url);

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        // Writer: drains outbound frames, closes the socket once the sender is dropped.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                    warn!("WebSocket send failed: {e}");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: forwards text frames until close or error.
        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let text = match msg {
                    Ok(WsMessage::Text(t)) => t.as_str().to_owned(),
                    Ok(WsMessage::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket receive error: {e}");
                        break;
                    }
                };
                if in_tx.send(text).is_err() {
                    break;
                }
            }
            debug!("WebSocket reader finished");
        });

        Ok(Link { outbound: out_tx, inbound: in_rx })
    }
}
