//! Participant side of the signaling socket.

use futures_util::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{
    error::ClientError,
    protocol::{ClientMessage, ConnectionId, ServerMessage},
};

/// Where a participant's outgoing relay messages go.
pub trait SignalSink: Send + Sync {
    fn send(&self, msg: ClientMessage) -> Result<(), ClientError>;
}

impl SignalSink for mpsc::UnboundedSender<ClientMessage> {
    fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        mpsc::UnboundedSender::send(self, msg).map_err(|_| ClientError::Closed)
    }
}

/// A connected relay socket split into an outgoing queue and an incoming
/// stream of server events.
pub struct SignalingClient {
    id: ConnectionId,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    incoming: mpsc::UnboundedReceiver<ServerMessage>,
    writer: JoinHandle<()>,
}

impl SignalingClient {
    /// Connects and waits for the relay's `welcome` to learn our own id.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (mut ws, _) = connect_async(url).await?;

        let id = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text)? {
                    ServerMessage::Welcome { id } => break id,
                    other => return Err(ClientError::Handshake(format!("{other:?}"))),
                },
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
            }
        };
        info!(id = %id, "connected to relay");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "could not encode outgoing message");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if in_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "unparseable relay frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(error = %err, "relay socket error");
                        break;
                    }
                }
            }
            debug!("relay reader finished");
        });

        Ok(Self {
            id,
            outgoing: out_tx,
            incoming: in_rx,
            writer,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// A cloneable handle for components that only send.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.outgoing.clone()
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        SignalSink::send(&self.outgoing, msg)
    }

    /// Next server event; `None` once the socket is gone.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.incoming.recv().await
    }

    /// Splits into id, outgoing queue and incoming stream, e.g. to hand
    /// them to a [`RoomSession`](crate::session::RoomSession).
    pub fn into_parts(
        self,
    ) -> (
        ConnectionId,
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        (self.id, self.outgoing, self.incoming)
    }

    /// Flushes queued messages and closes the socket.
    pub async fn close(self) {
        drop(self.outgoing);
        let _ = self.writer.await;
    }
}
