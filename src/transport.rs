//! WebSocket event transport.
//!
//! Connects to the fullnode's event stream, resumes it from the last
//! acknowledged event id, and forwards decoded events over a channel. The
//! connection state machine owns reconnection and backoff; this module only
//! reports lifecycle transitions ([`WsEvent::Connected`] and
//! [`WsEvent::Disconnected`]) and never retries on its own.
use std::sync::Arc;

use async_trait::async_trait;
use futures03::{stream::SplitSink, SinkExt, StreamExt};
use hyper::{
    header::{CONNECTION, HOST, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE, USER_AGENT},
    Uri,
};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        handshake::client::{generate_key, Request},
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, instrument, trace, warn};

use crate::events::{Event, FullNodeEvent, WsEvent};

#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to parse the provided URI.
    #[error("Failed to parse URI: {0}. Error: {1}")]
    UriParsing(String, String),

    /// The handshake with the stream server failed.
    #[error("Failed to connect to WebSocket server: {0}")]
    Connect(String),

    /// A frame failed to send through the websocket channel.
    #[error("Failed to send message: {0}")]
    Send(String),

    /// The transport has no active connection but was asked to send.
    #[error("The client is not connected!")]
    NotConnected,
}

/// Commands sent upstream on the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamCommand {
    /// Opens the stream, resuming after the last acknowledged event.
    StartStream { last_ack_event_id: Option<u64>, window_size: u64 },
    /// Acknowledges one event and refreshes the flow-control window.
    Ack { ack_event_id: u64, window_size: u64 },
}

/// A resumable source of daemon events.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Opens the stream. The returned channel yields a
    /// [`WsEvent::Connected`] first, then decoded fullnode events, and ends
    /// with a [`WsEvent::Disconnected`] when the connection drops.
    async fn connect(
        &self,
        last_ack_event_id: Option<u64>,
    ) -> Result<mpsc::Receiver<Event>, TransportError>;

    /// Acknowledges an event so the server advances the stream window.
    async fn ack(&self, event_id: u64) -> Result<(), TransportError>;

    /// Closes the current connection, if any.
    async fn close(&self) -> Result<(), TransportError>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::protocol::Message>;

/// [`EventSource`] over a fullnode websocket event stream.
#[derive(Clone)]
pub struct WsEventSource {
    uri: Arc<Uri>,
    window_size: u64,
    buffer_size: usize,
    sink: Arc<Mutex<Option<WsSink>>>,
}

impl WsEventSource {
    pub fn new(ws_uri: &str, window_size: u64) -> Result<Self, TransportError> {
        let uri = ws_uri
            .parse::<Uri>()
            .map_err(|e| TransportError::UriParsing(ws_uri.to_string(), e.to_string()))?;
        Ok(Self { uri: Arc::new(uri), window_size, buffer_size: 128, sink: Arc::new(Mutex::new(None)) })
    }

    fn build_request(&self) -> Result<Request, TransportError> {
        let host = self
            .uri
            .host()
            .ok_or_else(|| {
                TransportError::UriParsing(
                    self.uri.to_string(),
                    "No host found in stream url".to_string(),
                )
            })?;
        Request::builder()
            .uri(self.uri.as_ref())
            .header(SEC_WEBSOCKET_KEY, generate_key())
            .header(SEC_WEBSOCKET_VERSION, 13)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(HOST, host)
            .header(
                USER_AGENT,
                format!("vertex-indexer-{version}", version = env!("CARGO_PKG_VERSION")),
            )
            .body(())
            .map_err(|e| TransportError::Connect(format!("Failed to build connection request: {e}")))
    }

    async fn send_command(&self, command: &StreamCommand) -> Result<(), TransportError> {
        let payload = serde_json::to_string(command)
            .map_err(|e| TransportError::Send(e.to_string()))?;
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or(TransportError::NotConnected)?;
        trace!(?command, "Sending stream command");
        sink.send(tungstenite::protocol::Message::Text(payload))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

#[async_trait]
impl EventSource for WsEventSource {
    #[instrument(skip(self))]
    async fn connect(
        &self,
        last_ack_event_id: Option<u64>,
    ) -> Result<mpsc::Receiver<Event>, TransportError> {
        info!(uri = %self.uri, "Connecting to event stream");
        let request = self.build_request()?;
        let (conn, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (ws_sink, mut ws_stream) = conn.split();
        {
            let mut guard = self.sink.lock().await;
            *guard = Some(ws_sink);
        }
        self.send_command(&StreamCommand::StartStream {
            last_ack_event_id,
            window_size: self.window_size,
        })
        .await?;

        let (event_tx, event_rx) = mpsc::channel(self.buffer_size);
        // The receiver observes the connection before any stream event.
        let _ = event_tx
            .send(Event::Websocket(WsEvent::Connected))
            .await;

        let sink = self.sink.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_stream.next().await {
                match msg {
                    Ok(tungstenite::protocol::Message::Text(text)) => {
                        match serde_json::from_str::<FullNodeEvent>(&text) {
                            Ok(event) => {
                                if event_tx
                                    .send(Event::Fullnode(event))
                                    .await
                                    .is_err()
                                {
                                    debug!("Event receiver dropped, stopping reader");
                                    break;
                                }
                            }
                            Err(error) => {
                                warn!(?error, "Failed to decode stream frame");
                            }
                        }
                    }
                    Ok(tungstenite::protocol::Message::Ping(_)) => {
                        let mut guard = sink.lock().await;
                        if let Some(inner) = guard.as_mut() {
                            if let Err(error) = inner
                                .send(tungstenite::protocol::Message::Pong(Vec::new()))
                                .await
                            {
                                debug!(?error, "Failed to send pong!");
                            }
                        }
                    }
                    Ok(tungstenite::protocol::Message::Close(_)) => {
                        debug!("The server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(?error, "Websocket read failed");
                        break;
                    }
                }
            }
            {
                let mut guard = sink.lock().await;
                *guard = None;
            }
            let _ = event_tx
                .send(Event::Websocket(WsEvent::Disconnected))
                .await;
        });

        Ok(event_rx)
    }

    async fn ack(&self, event_id: u64) -> Result<(), TransportError> {
        self.send_command(&StreamCommand::Ack {
            ack_event_id: event_id,
            window_size: self.window_size,
        })
        .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            // Best effort; the server may already be gone.
            let _ = sink
                .send(tungstenite::protocol::Message::Close(None))
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::{net::TcpListener, task::JoinHandle};
    use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

    use super::*;
    use crate::events::VertexEventType;

    fn stream_event_json(id: u64) -> String {
        format!(
            r#"{{
                "stream_id": "stream-1",
                "peer_id": "peer-1",
                "network": "mainnet",
                "event": {{
                    "id": {id},
                    "timestamp": 1695655000,
                    "type": "NEW_VERTEX_ACCEPTED",
                    "data": {{"hash": "00abc"}}
                }},
                "latest_event_id": {id}
            }}"#
        )
    }

    /// One-shot stream server: expects the start command, pushes the given
    /// frames, then records every client command until the close frame.
    async fn mock_stream_server(frames: Vec<String>) -> (String, JoinHandle<Vec<StreamCommand>>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut commands = vec![];

            let first = ws.next().await.unwrap().unwrap();
            if let Message::Text(text) = first {
                commands.push(serde_json::from_str(&text).unwrap());
            }
            for frame in frames {
                ws.send(Message::Text(frame)).await.unwrap();
            }
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) => commands.push(serde_json::from_str(&text).unwrap()),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            commands
        });
        (format!("ws://{addr}"), handle)
    }

    #[test]
    fn test_stream_command_wire_format() {
        let start = StreamCommand::StartStream { last_ack_event_id: Some(37), window_size: 8 };
        let json = serde_json::to_value(&start).unwrap();
        assert_eq!(json["type"], "START_STREAM");
        assert_eq!(json["last_ack_event_id"], 37);
        assert_eq!(json["window_size"], 8);

        let ack = StreamCommand::Ack { ack_event_id: 38, window_size: 8 };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["type"], "ACK");
        assert_eq!(json["ack_event_id"], 38);
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_streams_events_and_acks() {
        let (uri, server) = mock_stream_server(vec![stream_event_json(38)]).await;
        let source = WsEventSource::new(&uri, 8).unwrap();

        let mut rx = source.connect(Some(37)).await.unwrap();

        assert_eq!(rx.recv().await, Some(Event::Websocket(WsEvent::Connected)));
        let event = rx.recv().await.unwrap();
        let Event::Fullnode(ev) = event else { panic!("expected a fullnode event") };
        assert_eq!(ev.event.id, 38);
        assert_eq!(ev.event.kind, VertexEventType::NewVertexAccepted);

        source.ack(38).await.unwrap();
        source.close().await.unwrap();

        assert_eq!(rx.recv().await, Some(Event::Websocket(WsEvent::Disconnected)));
        let commands = server.await.unwrap();
        assert_eq!(
            commands,
            vec![
                StreamCommand::StartStream { last_ack_event_id: Some(37), window_size: 8 },
                StreamCommand::Ack { ack_event_id: 38, window_size: 8 },
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_server_close_reports_disconnect() {
        let (uri, server) = mock_stream_server(vec![]).await;
        let source = WsEventSource::new(&uri, 8).unwrap();

        let mut rx = source.connect(None).await.unwrap();
        assert_eq!(rx.recv().await, Some(Event::Websocket(WsEvent::Connected)));

        // Dropping the server side ends the stream.
        source.close().await.unwrap();
        assert_eq!(rx.recv().await, Some(Event::Websocket(WsEvent::Disconnected)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ack_without_connection_fails() {
        let source = WsEventSource::new("ws://127.0.0.1:1", 8).unwrap();
        let err = source.ack(1).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
