use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::app::AppState;

/// One change event pushed to connected observers. At-most-once, never
/// persisted: offline observers receive nothing and re-fetch on reconnect.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<RealtimeEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget publish. A send error only means nobody is listening.
    pub fn publish(&self, event: &str, payload: serde_json::Value) {
        let receivers = self
            .tx
            .send(RealtimeEvent {
                event: event.to_string(),
                payload,
            })
            .unwrap_or(0);
        debug!(event, receivers, "realtime event published");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.tx.subscribe()
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let rx = state.broadcaster.subscribe();
    ws.on_upgrade(move |socket| client_loop(socket, rx))
}

async fn client_loop(socket: WebSocket, mut rx: broadcast::Receiver<RealtimeEvent>) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Slow consumer: events are droppable by contract.
                    warn!(skipped, "realtime observer lagged; events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let broadcaster = Broadcaster::new(16);
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        broadcaster.publish("availability_update", serde_json::json!({"available": 3}));

        let got_a = a.recv().await.expect("subscriber a");
        let got_b = b.recv().await.expect("subscriber b");
        assert_eq!(got_a.event, "availability_update");
        assert_eq!(got_b.payload["available"], 3);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let broadcaster = Broadcaster::new(16);
        broadcaster.publish("guestlist_update", serde_json::json!({}));
        // Late subscriber sees nothing: no persistence.
        let mut late = broadcaster.subscribe();
        broadcaster.publish("guestlist_update", serde_json::json!({"n": 1}));
        let event = late.recv().await.expect("only the post-subscribe event");
        assert_eq!(event.payload["n"], 1);
        assert!(late.try_recv().is_err());
    }
}
