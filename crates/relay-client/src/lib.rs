//! Chat relay client
//!
//! A thin async wrapper around one WebSocket connection to the relay:
//! requests go out as `Request` envelopes, server events come back as
//! `Delivery` envelopes decoded through their discriminant.

pub mod config;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_common::{
    ChatId, Delivery, MessageKind, NewChatRequest, NewMessageRequest, ProtocolError, Request,
    UserId,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};

pub use config::ClientConfig;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("unauthorized: wrong token")]
    Unauthorized,

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server error: {0}")]
    Server(String),

    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// `host:port` becomes `ws://host:port`; explicit schemes are kept.
pub fn ws_url(address: &str) -> String {
    if address.starts_with("ws://") || address.starts_with("wss://") {
        address.to_string()
    } else {
        format!("ws://{}", address)
    }
}

/// Write half of a connection
pub struct RequestSender {
    sink: SplitSink<WsStream, Message>,
}

impl RequestSender {
    pub async fn send(&mut self, request: &Request) -> Result<()> {
        let text = request.to_json()?;
        debug!("Send: {}", text);
        self.sink.send(Message::text(text)).await?;
        Ok(())
    }

    pub async fn send_message(&mut self, ch_id: &ChatId, body: impl Into<String>) -> Result<()> {
        self.send(&Request::NewMessage(NewMessageRequest {
            ch_id: ch_id.clone(),
            kind: MessageKind::Add,
            msg: body.into(),
        }))
        .await
    }

    /// Send a normal close frame.
    pub async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        match self.sink.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read half of a connection
pub struct DeliveryReceiver {
    stream: SplitStream<WsStream>,
}

impl DeliveryReceiver {
    /// Next server event; `None` once the server closed the connection.
    ///
    /// Control frames are skipped. A frame that does not decode as a
    /// delivery is an error but leaves the connection usable.
    pub async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    debug!("Recv: {}", text.as_str());
                    return Ok(Some(Delivery::from_slice(text.as_bytes())?));
                }
                Ok(Message::Binary(data)) => return Ok(Some(Delivery::from_slice(&data)?)),
                Ok(Message::Close(frame)) => {
                    debug!("Server closed the connection: {:?}", frame);
                    return Ok(None);
                }
                Ok(_) => trace!("Control frame"),
                Err(tungstenite::Error::ConnectionClosed) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

/// One authenticated connection to the relay
pub struct RelayClient {
    sender: RequestSender,
    receiver: DeliveryReceiver,
}

impl RelayClient {
    /// Open a connection, presenting `token` in the `Authorization` header.
    pub async fn connect(address: &str, token: &str) -> Result<Self> {
        let url = ws_url(address);
        let mut request = url.as_str().into_client_request().map_err(ClientError::Connect)?;
        let value = HeaderValue::from_str(token)
            .map_err(|_| ClientError::Config("token is not a valid header value".into()))?;
        request.headers_mut().insert(header::AUTHORIZATION, value);

        let (ws, _response) = match tokio_tungstenite::connect_async(request).await {
            Ok(connected) => connected,
            Err(tungstenite::Error::Http(response))
                if response.status() == StatusCode::UNAUTHORIZED =>
            {
                return Err(ClientError::Unauthorized);
            }
            Err(e) => return Err(ClientError::Connect(e)),
        };
        info!("Connected to {}", url);

        let (sink, stream) = ws.split();
        Ok(Self {
            sender: RequestSender { sink },
            receiver: DeliveryReceiver { stream },
        })
    }

    /// Ask the relay for a new chat with `peer`; the caller is added by
    /// the server.
    pub async fn create_chat(&mut self, peer: impl Into<UserId>) -> Result<ChatId> {
        self.sender
            .send(&Request::NewChat(NewChatRequest {
                user_ids: vec![peer.into()],
            }))
            .await?;

        loop {
            match self.receiver.next_delivery().await? {
                Some(Delivery::NewChat(ch_id)) => return Ok(ch_id),
                Some(Delivery::Error(body)) => return Err(ClientError::Server(body.error)),
                Some(Delivery::NewMessage(delivery)) => {
                    debug!("Skipping message in {} while creating chat", delivery.ch_id);
                }
                None => return Err(ClientError::Closed),
            }
        }
    }

    pub async fn send_message(&mut self, ch_id: &ChatId, body: impl Into<String>) -> Result<()> {
        self.sender.send_message(ch_id, body).await
    }

    pub async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        self.receiver.next_delivery().await
    }

    pub async fn close(mut self) -> Result<()> {
        self.sender.close().await
    }

    /// Split into halves that can be driven from separate tasks.
    pub fn split(self) -> (RequestSender, DeliveryReceiver) {
        (self.sender, self.receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_adds_scheme() {
        assert_eq!(ws_url("localhost:8001"), "ws://localhost:8001");
        assert_eq!(ws_url("ws://relay:9000/ws"), "ws://relay:9000/ws");
        assert_eq!(ws_url("wss://relay.example"), "wss://relay.example");
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = RelayClient::connect(&addr.to_string(), "token")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Connect(_)));
    }

    #[tokio::test]
    async fn test_invalid_token_header_is_config_error() {
        let err = RelayClient::connect("127.0.0.1:1", "bad\ntoken")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Config(_)));
    }
}
