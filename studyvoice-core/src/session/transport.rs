//! Connection seam between the session controller and the network.
//!
//! [`GeminiConnector`] speaks the Live API over a tokio-tungstenite
//! WebSocket. Tests plug in their own [`Connector`] and script the inbound
//! side through a plain channel.

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use super::protocol::{parse_server_frame, ClientFrame, LiveMessage, SetupMessage};
use crate::config::LiveConfig;
use crate::error::{Result, VoiceError};

/// Inbound messages buffered between the reader task and the session task.
const INBOUND_QUEUE: usize = 256;

/// WebSocket close code used when the stream ends without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// An established connection, already past setup.
pub struct LiveConnection {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub inbound: mpsc::Receiver<LiveMessage>,
}

pub trait Connector: Send + Sync + 'static {
    /// Open a connection and complete the setup handshake.
    fn connect(&self, setup: SetupMessage) -> impl Future<Output = Result<LiveConnection>> + Send;
}

/// Live API over WebSocket.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    endpoint: String,
    api_key: String,
    connect_timeout: Duration,
    outbound_queue: usize,
}

impl GeminiConnector {
    /// # Errors
    /// `VoiceError::Config` when no API key is configured.
    pub fn from_config(config: &LiveConfig) -> Result<Self> {
        Ok(Self {
            endpoint: config.endpoint.clone(),
            api_key: config.require_api_key()?.to_owned(),
            connect_timeout: config.connect_timeout(),
            outbound_queue: config.outbound_queue.max(1),
        })
    }

    fn url(&self) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, sep, self.api_key)
    }

    async fn open(&self, setup: SetupMessage) -> Result<LiveConnection> {
        let (ws, _response) = timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url()),
        )
        .await
        .map_err(|_| VoiceError::Connection("timed out connecting to live endpoint".into()))?
        .map_err(|e| VoiceError::Connection(e.to_string()))?;
        info!(endpoint = self.endpoint.as_str(), "live socket connected");

        let (mut sink, mut stream) = ws.split();
        sink.send(Message::Text(setup.to_json()?.into()))
            .await
            .map_err(|e| VoiceError::Connection(e.to_string()))?;

        timeout(self.connect_timeout, await_setup(&mut stream))
            .await
            .map_err(|_| VoiceError::Connection("timed out waiting for setupComplete".into()))??;
        info!("live session setup complete");

        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(self.outbound_queue);
        let (in_tx, in_rx) = mpsc::channel::<LiveMessage>(INBOUND_QUEUE);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let json = match frame.to_json() {
                    Ok(Some(json)) => json,
                    Ok(None) => break,
                    Err(e) => {
                        error!("failed to serialize client frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    warn!("live socket write failed: {e}");
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            debug!("live writer task exiting");
        });

        tokio::spawn(async move {
            let end = loop {
                let Some(msg) = stream.next().await else {
                    break LiveMessage::Close {
                        code: ABNORMAL_CLOSURE,
                        reason: "connection dropped".into(),
                    };
                };
                let text = match msg {
                    Ok(Message::Text(t)) => t.as_str().to_owned(),
                    Ok(Message::Binary(b)) => match String::from_utf8(b.to_vec()) {
                        Ok(t) => t,
                        Err(_) => {
                            warn!("dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                            .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                        break LiveMessage::Close { code, reason };
                    }
                    Ok(_) => continue,
                    Err(e) => break LiveMessage::Error(e.to_string()),
                };
                match parse_server_frame(&text) {
                    Ok(parsed) => {
                        for message in parsed.messages {
                            if in_tx.send(message).await.is_err() {
                                debug!("session dropped inbound receiver");
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring unparsable server frame"),
                }
            };
            let _ = in_tx.send(end).await;
            debug!("live reader task exiting");
        });

        Ok(LiveConnection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Read frames until `setupComplete`. An error frame or a close fails setup.
async fn await_setup<S>(stream: &mut S) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        let msg = msg.map_err(|e| VoiceError::Connection(e.to_string()))?;
        let text = match &msg {
            Message::Text(t) => t.as_str().to_owned(),
            Message::Binary(b) => String::from_utf8_lossy(b).into_owned(),
            Message::Close(frame) => {
                let reason = frame
                    .as_ref()
                    .map(|f| f.reason.as_str().to_owned())
                    .unwrap_or_default();
                return Err(VoiceError::Connection(format!("closed during setup: {reason}")));
            }
            _ => continue,
        };
        match parse_server_frame(&text) {
            Ok(parsed) if parsed.setup_complete => return Ok(()),
            Ok(parsed) => {
                if let Some(LiveMessage::Error(message)) = parsed.messages.into_iter().next() {
                    return Err(VoiceError::Connection(message));
                }
            }
            Err(e) => debug!(error = %e, "ignoring unparsable setup frame"),
        }
    }
    Err(VoiceError::Connection("socket ended during setup".into()))
}

impl Connector for GeminiConnector {
    fn connect(&self, setup: SetupMessage) -> impl Future<Output = Result<LiveConnection>> + Send {
        self.open(setup)
    }
}
