use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::ChannelError;

/// Seam between the channel's lifecycle logic and the actual wire. The
/// production implementation speaks WebSocket; tests substitute a scripted
/// in-memory transport.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushStream>, ChannelError>;
}

/// One live connection. Text frames only; the channel owns framing.
#[async_trait]
pub trait PushStream: Send {
    /// Next inbound text frame, or `None` once the peer has closed.
    async fn next_text(&mut self) -> Option<Result<String, ChannelError>>;

    async fn send_text(&mut self, text: String) -> Result<(), ChannelError>;
}

pub struct WebSocketTransport;

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushStream>, ChannelError> {
        let parsed = Url::parse(url).map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;

        match connect_async(parsed.as_str()).await {
            Ok((stream, _response)) => Ok(Box::new(WebSocketPushStream { inner: stream })),
            Err(WsError::Http(response))
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                Err(ChannelError::AuthRejected)
            }
            Err(e) => Err(ChannelError::ConnectFailed(e.to_string())),
        }
    }
}

struct WebSocketPushStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushStream for WebSocketPushStream {
    async fn next_text(&mut self) -> Option<Result<String, ChannelError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => return None,
                // Control and binary frames carry no scheduling events.
                Ok(_) => continue,
                Err(e) => return Some(Err(ChannelError::Transport(e.to_string()))),
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }
}
