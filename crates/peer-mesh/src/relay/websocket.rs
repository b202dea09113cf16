use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::{RelayEvent, RelayGateway};
use crate::error::RelayError;
use crate::protocol::{ClientMessage, ServerMessage};

/// Relay connection over a websocket.
///
/// Three tasks back each connection: a writer draining the send queue, a
/// reader decoding server frames into [`RelayEvent`]s, and a heartbeat that
/// keeps idle connections alive. Dropping the relay aborts all three.
pub struct WebSocketRelay {
    peer_id: String,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketRelay {
    pub async fn connect(
        relay_url: &str,
        room: &str,
        peer_id: &str,
        heartbeat: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RelayEvent>), RelayError> {
        let websocket_url = relay_socket_url(relay_url, room, peer_id)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| RelayError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target = "relay",
            url = %websocket_url,
            "relay websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<RelayEvent>();

        let relay = Arc::new(WebSocketRelay {
            peer_id: peer_id.to_string(),
            send_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "relay", error = %err, "failed to encode relay message");
                        continue;
                    }
                };
                tracing::trace!(target = "relay", event = "ws_out", kind = message.label(), len = text.len());
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "relay", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "relay", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(target = "relay", event = "ws_in", len = text.len());
                match decode_server_message(&text) {
                    Ok(message) => {
                        if events_tx.send(RelayEvent::Message(message)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(target = "relay", error = %err, "ignoring undecodable relay frame");
                    }
                }
            }
            let _ = events_tx.send(RelayEvent::Disconnected);
        });

        let heartbeat_tx = relay.send_tx.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        relay
            .tasks
            .lock()
            .extend([writer_handle, reader_handle, heartbeat_handle]);
        Ok((relay, events_rx))
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

impl RelayGateway for WebSocketRelay {
    fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        self.send_tx
            .send(message)
            .map_err(|_| RelayError::ChannelClosed)
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

pub fn decode_server_message(text: &str) -> Result<ServerMessage, RelayError> {
    Ok(serde_json::from_str(text)?)
}

/// Maps a relay base url (`http(s)://` or `ws(s)://`) to the room's socket
/// endpoint, `ws(s)://host/ws/{room}?peerId={peer}`.
pub fn relay_socket_url(relay_url: &str, room: &str, peer_id: &str) -> Result<Url, RelayError> {
    let base = Url::parse(relay_url)
        .map_err(|err| RelayError::Setup(format!("invalid relay url {relay_url}: {err}")))?;
    if room.is_empty() {
        return Err(RelayError::Setup("room name must not be empty".into()));
    }
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RelayError::Setup(format!(
                "unsupported relay url scheme {other}"
            )));
        }
    };
    let mut ws = base.clone();
    ws.set_scheme(scheme)
        .map_err(|_| RelayError::Setup("invalid websocket scheme".into()))?;
    let prefix = base.path().trim_end_matches('/');
    ws.set_path(&format!("{prefix}/ws/{room}"));
    ws.set_query(None);
    ws.query_pairs_mut().append_pair("peerId", peer_id);
    ws.set_fragment(None);
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn socket_url_swaps_scheme_and_appends_room() {
        let url = relay_socket_url("https://relay.example.com", "standup", "alice").expect("url");
        assert_eq!(url.as_str(), "wss://relay.example.com/ws/standup?peerId=alice");

        let url = relay_socket_url("http://127.0.0.1:8080/mesh/", "r1", "bob").expect("url");
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/mesh/ws/r1?peerId=bob");

        let url = relay_socket_url("ws://localhost:9000?x=1", "r1", "bob").expect("url");
        assert_eq!(url.as_str(), "ws://localhost:9000/ws/r1?peerId=bob");
    }

    #[test]
    fn socket_url_rejects_bad_input() {
        assert!(relay_socket_url("not a url", "room", "a").is_err());
        assert!(relay_socket_url("ftp://relay", "room", "a").is_err());
        assert!(relay_socket_url("http://relay", "", "a").is_err());
    }

    #[test]
    fn undecodable_frames_surface_codec_errors() {
        let err = decode_server_message(r#"{"type":"NOPE"}"#).expect_err("unknown type");
        assert!(matches!(err, RelayError::Codec(_)));
    }

    #[tokio::test]
    async fn relays_messages_both_ways_and_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("handshake");
            let first = loop {
                match ws.next().await.expect("frame").expect("ok frame") {
                    Message::Text(text) => break text,
                    _ => continue,
                }
            };
            ws.send(Message::Text(
                r#"{"type":"PRESENCE","peerIds":["alice","bob"]}"#.into(),
            ))
            .await
            .expect("send presence");
            ws.close(None).await.expect("close");
            first
        });

        let (relay, mut events) = WebSocketRelay::connect(
            &format!("http://{addr}"),
            "room",
            "alice",
            Duration::from_secs(3600),
        )
        .await
        .expect("connect");
        relay
            .send(ClientMessage::Join {
                account_id: "alice".into(),
            })
            .expect("queue join");

        assert_eq!(
            events.recv().await,
            Some(RelayEvent::Message(ServerMessage::Presence {
                peer_ids: vec!["alice".into(), "bob".into()],
            }))
        );
        assert_eq!(events.recv().await, Some(RelayEvent::Disconnected));

        let first = server.await.expect("server task");
        assert_eq!(first, r#"{"type":"JOIN","accountId":"alice"}"#);
        assert_eq!(relay.peer_id(), "alice");
    }
}
