//! WebSocket transport for the event hub.

use crate::event::ClientMessage;
use crate::hub::{EventHub, HubError, SubscriberHandle};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, warn};

/// Close code sent when the hub is at capacity ("try again later")
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Interval between keep-alive pings
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Largest message accepted from a subscriber
pub const MAX_CLIENT_MESSAGE: usize = 512;

/// Router serving the event stream at `/ws/events`
pub fn router(hub: EventHub) -> Router {
    Router::new()
        .route("/ws/events", get(ws_handler))
        .with_state(hub)
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<EventHub>) -> impl IntoResponse {
    ws.max_message_size(MAX_CLIENT_MESSAGE)
        .on_upgrade(move |socket| serve_socket(hub, socket))
}

/// Pump hub events into one socket until either side closes
pub async fn serve_socket(hub: EventHub, mut socket: WebSocket) {
    let subscription = match hub.connect().await {
        Ok(subscription) => subscription,
        Err(HubError::ConnectionLimit { max }) => {
            warn!("WebSocket connection rejected: limit of {} reached", max);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_TRY_AGAIN_LATER,
                    reason: Cow::from("connection limit reached"),
                })))
                .await;
            return;
        }
        Err(e) => {
            debug!("WebSocket connection refused: {}", e);
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (mut events, handle) = subscription.into_parts();
    let (mut sender, mut receiver) = socket.split();

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    let text = match event.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode {} event: {}", event.event_type.as_str(), e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_client_message(&handle, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket read error for {}: {}", handle.id(), e);
                    break;
                }
            },
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!("WebSocket subscriber {} closed", handle.id());
}

fn handle_client_message(handle: &SubscriberHandle, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { miners }) => handle.subscribe(miners),
        Ok(ClientMessage::Ping) => handle.ping(),
        Err(e) => debug!("Ignoring malformed client message: {}", e),
    }
}
