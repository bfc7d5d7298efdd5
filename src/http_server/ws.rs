//! WebSocket status stream at `/ws`.
//!
//! Every client receives a full status snapshot on connect and after each
//! state change, in order. Sends for one connection are serialised by the
//! owning task; a client that cannot keep up for one second is dropped.
//! Client messages are ignored except that `"ping"` is tolerated (no
//! response required).

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hyper::header::HeaderValue;
use hyper::{Body, Request, Response, StatusCode};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::SharedState;
use crate::state::SystemState;

/// A send not accepted within this window counts as backpressure and drops
/// the connection.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Answer the http upgrade and hand the raw connection to [`serve`].
pub fn upgrade(state: SharedState, mut req: Request<Body>) -> Response<Body> {
    let is_websocket = req
        .headers()
        .get("upgrade")
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"websocket"))
        .unwrap_or(false);
    let key = req.headers().get("sec-websocket-key").cloned();

    let accept = match (is_websocket, key) {
        (true, Some(key)) => derive_accept_key(key.as_bytes()),
        _ => {
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Body::from("websocket upgrade required"))
                .expect("static response");
        },
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let socket = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                serve(state, socket).await;
            },
            Err(e) => warn!("WebSocket upgrade failed: {}", e),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header("connection", HeaderValue::from_static("Upgrade"))
        .header("upgrade", HeaderValue::from_static("websocket"))
        .header("sec-websocket-accept", accept)
        .body(Body::empty())
        .expect("upgrade response")
}

/// Push the current snapshot, then one snapshot per store change until the
/// client goes away or falls behind.
pub async fn serve<S>(state: SharedState, socket: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let mut changes = state.store.subscribe();

    if send_snapshot(&mut sink, &state.store.get()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = changes.borrow_and_update().clone();
                if send_snapshot(&mut sink, &snapshot).await.is_err() {
                    debug!("Dropping websocket client (closed or backpressure)");
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}, // ignored; "ping" needs no response
                Some(Err(e)) => {
                    debug!("WebSocket receive error: {}", e);
                    break;
                },
            },
        }
    }

    let _ = sink.close().await;
}

async fn send_snapshot<Sink>(sink: &mut Sink, snapshot: &SystemState) -> Result<(), ()>
where
    Sink: futures_util::Sink<Message> + Unpin,
{
    let payload = snapshot.status_json().to_string();
    match tokio::time::timeout(SEND_TIMEOUT, sink.send(Message::Text(payload))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mock::MockAdapter;
    use crate::state::ConnectionState;
    use crate::store::StatePatch;

    async fn ws_pair(
        state: SharedState,
    ) -> WebSocketStream<tokio::io::DuplexStream> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        tokio::spawn(serve(state, server));
        WebSocketStream::from_raw_socket(client_io, Role::Client, None).await
    }

    async fn next_status(
        client: &mut WebSocketStream<tokio::io::DuplexStream>,
    ) -> serde_json::Value {
        loop {
            match client.next().await.expect("stream open").expect("message") {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pushes_snapshot_on_connect_and_on_change() {
        let (state, _mock, _dir) = super::super::tests::test_state(MockAdapter::new()).await;
        super::super::tests::wait_for_state(&state.store, ConnectionState::ApMode).await;

        let mut client = ws_pair(state.clone()).await;

        let first = next_status(&mut client).await;
        assert_eq!(first["state"], "AP_MODE");
        assert!(first["ap_password"].as_str().is_some());

        state
            .store
            .update(StatePatch {
                connection_state: Some(ConnectionState::Connecting),
                ssid: Some("HomeNet".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();

        let second = next_status(&mut client).await;
        assert_eq!(second["state"], "CONNECTING");
        assert_eq!(second["ssid"], "HomeNet");
        assert!(second.get("ap_password").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn client_text_messages_are_ignored() {
        let (state, _mock, _dir) = super::super::tests::test_state(MockAdapter::new()).await;
        super::super::tests::wait_for_state(&state.store, ConnectionState::ApMode).await;

        let mut client = ws_pair(state.clone()).await;
        let _ = next_status(&mut client).await;

        client.send(Message::Text("ping".to_owned())).await.unwrap();
        client.send(Message::Text("garbage".to_owned())).await.unwrap();

        // the connection stays up and keeps delivering changes
        state.store.update(StatePatch::state(ConnectionState::Connecting)).await.unwrap();
        let status = next_status(&mut client).await;
        assert_eq!(status["state"], "CONNECTING");
    }
}
