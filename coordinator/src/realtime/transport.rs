use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::stomp::{Command, Frame};
use crate::config_store::RealtimeConfig;
use crate::errors::{WalletError, WalletResult};

/// Message bodies received on one subscribed destination. The stream ends
/// when the underlying connection goes away.
pub type PushStream = Pin<Box<dyn Stream<Item = WalletResult<String>> + Send>>;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reader = SplitStream<Socket>;

const SUBSCRIPTION_ID: &str = "sub-0";

#[async_trait]
pub trait PushTransport: Send + Sync + fmt::Debug {
    /// Connect and subscribe to `destination`.
    async fn open(&self, destination: &str) -> WalletResult<PushStream>;
}

/// STOMP 1.2 over a WebSocket connection.
#[derive(Debug, Clone)]
pub struct StompTransport {
    endpoint: String,
    connect_timeout: Duration,
}

impl StompTransport {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout,
        }
    }

    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self::new(config.endpoint.clone(), config.connect_timeout())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn host(&self) -> WalletResult<String> {
        let url = reqwest::Url::parse(&self.endpoint).map_err(|e| {
            WalletError::ChannelError(format!("Invalid realtime endpoint: {}", e))
        })?;
        url.host_str()
            .map(str::to_string)
            .ok_or_else(|| WalletError::ChannelError("Realtime endpoint has no host".to_string()))
    }

    async fn await_connected(&self, socket: &mut Socket) -> WalletResult<()> {
        loop {
            let next = timeout(self.connect_timeout, socket.next())
                .await
                .map_err(|_| WalletError::ChannelError("STOMP handshake timed out".to_string()))?;
            let message = match next {
                Some(message) => message?,
                None => {
                    return Err(WalletError::ChannelError(
                        "Connection closed during STOMP handshake".to_string(),
                    ))
                }
            };
            let Some(text) = message_text(message) else {
                continue;
            };
            match Frame::decode(&text)? {
                Some(frame) if frame.command == Command::Connected => return Ok(()),
                Some(frame) if frame.command == Command::Error => {
                    return Err(stomp_error(&frame));
                }
                _ => continue,
            }
        }
    }
}

#[async_trait]
impl PushTransport for StompTransport {
    async fn open(&self, destination: &str) -> WalletResult<PushStream> {
        let host = self.host()?;
        let (mut socket, _) = timeout(self.connect_timeout, connect_async(self.endpoint.as_str()))
            .await
            .map_err(|_| WalletError::ChannelError("WebSocket connect timed out".to_string()))??;

        socket
            .send(Message::Text(Frame::connect(&host).encode()))
            .await?;
        self.await_connected(&mut socket).await?;
        socket
            .send(Message::Text(
                Frame::subscribe(SUBSCRIPTION_ID, destination).encode(),
            ))
            .await?;
        log::debug!("STOMP subscription open on {}", destination);

        let (sink, reader) = socket.split();
        let session = StompSession {
            reader,
            _disconnect: DisconnectOnDrop(Some(sink)),
        };
        let messages = stream::unfold(Some(session), |state| async move {
            let mut session = state?;
            loop {
                let message = match session.reader.next().await? {
                    Ok(message) => message,
                    Err(e) => return Some((Err(WalletError::from(e)), None)),
                };
                if matches!(message, Message::Close(_)) {
                    return None;
                }
                let Some(text) = message_text(message) else {
                    continue;
                };
                match Frame::decode(&text) {
                    Ok(Some(frame)) if frame.command == Command::Message => {
                        return Some((Ok(frame.body), Some(session)));
                    }
                    Ok(Some(frame)) if frame.command == Command::Error => {
                        return Some((Err(stomp_error(&frame)), None));
                    }
                    Ok(_) => continue,
                    Err(e) => return Some((Err(e), None)),
                }
            }
        });
        Ok(Box::pin(messages))
    }
}

struct StompSession {
    reader: Reader,
    _disconnect: DisconnectOnDrop,
}

/// Sends DISCONNECT and closes the socket once the subscription stream is
/// dropped, whether it ended or the consumer stopped reading.
struct DisconnectOnDrop(Option<SplitSink<Socket, Message>>);

impl Drop for DisconnectOnDrop {
    fn drop(&mut self) {
        let Some(mut sink) = self.0.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            if let Err(e) = sink.send(Message::Text(Frame::disconnect().encode())).await {
                log::debug!("STOMP DISCONNECT not delivered: {}", e);
            }
            let _ = sink.close().await;
        });
    }
}

fn message_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => String::from_utf8(bytes).ok(),
        _ => None,
    }
}

fn stomp_error(frame: &Frame) -> WalletError {
    let reason = frame
        .header("message")
        .map(str::to_string)
        .unwrap_or_else(|| frame.body.trim().to_string());
    WalletError::ChannelError(format!("Broker error: {}", reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_is_taken_from_endpoint() {
        let transport = StompTransport::from_config(&RealtimeConfig::default());
        assert_eq!(
            transport.host().unwrap(),
            "e-wallet-springboot-backend.onrender.com"
        );
        assert!(StompTransport::new("not a url", Duration::from_secs(1))
            .host()
            .is_err());
    }

    #[test]
    fn broker_error_prefers_message_header() {
        let frame = Frame::new(Command::Error)
            .with_header("message", "Access denied")
            .with_body("details");
        assert_eq!(
            stomp_error(&frame),
            WalletError::ChannelError("Broker error: Access denied".to_string())
        );
    }

    async fn next_frame(socket: &mut WebSocketStream<TcpStream>) -> Option<Frame> {
        while let Some(message) = socket.next().await {
            if let Some(text) = message_text(message.ok()?) {
                if let Some(frame) = Frame::decode(&text).unwrap() {
                    return Some(frame);
                }
            }
        }
        None
    }

    #[tokio::test]
    async fn dropping_the_stream_sends_disconnect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let broker = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let connect = next_frame(&mut socket).await.unwrap();
            assert_eq!(connect.command, Command::Connect);
            assert_eq!(connect.header("host"), Some("127.0.0.1"));
            let connected = Frame::new(Command::Connected).with_header("version", "1.2");
            socket.send(Message::Text(connected.encode())).await.unwrap();

            let subscribe = next_frame(&mut socket).await.unwrap();
            assert_eq!(subscribe.command, Command::Subscribe);
            assert_eq!(subscribe.header("destination"), Some("/topic/qr/7"));
            let message = Frame::new(Command::Message)
                .with_header("destination", "/topic/qr/7")
                .with_body(r#"{"status":"PAID","qrId":7}"#);
            socket.send(Message::Text(message.encode())).await.unwrap();

            next_frame(&mut socket).await.map(|frame| frame.command)
        });

        let transport = StompTransport::new(
            format!("ws://{}/ws/websocket", address),
            Duration::from_secs(5),
        );
        let mut messages = transport.open("/topic/qr/7").await.unwrap();
        let body = messages.next().await.unwrap().unwrap();
        assert_eq!(body, r#"{"status":"PAID","qrId":7}"#);
        drop(messages);

        let last = timeout(Duration::from_secs(5), broker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last, Some(Command::Disconnect));
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_to_open() {
        let transport = StompTransport::new("ws://127.0.0.1:9/ws/websocket", Duration::from_secs(2));
        let result = transport.open("/topic/qr/1").await;
        assert!(matches!(result, Err(WalletError::ChannelError(_))));
    }
}
