//! WebSocket Event Broadcasting
//!
//! Realtime fan-out for UI clients. Tag batches, scale weights, agent
//! replies and batch state changes are pushed through a tokio broadcast
//! channel and forwarded to every connected socket as JSON text frames.
//!
//! A slow client that falls behind the channel capacity misses events and
//! receives a `Lagged` notice instead; it never blocks publishers.

use crate::telemetry::with_metrics;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use rfidgate_core::{PublishError, RealtimeEvent, RealtimePublisher};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Shared broadcast channel for realtime events.
#[derive(Clone)]
pub struct WsState {
    tx: broadcast::Sender<RealtimeEvent>,
}

impl WsState {
    /// Create a new WebSocket state with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to the event stream. The receiver must be polled to avoid
    /// lagging.
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl RealtimePublisher for WsState {
    fn publish(&self, event: RealtimeEvent) -> Result<usize, PublishError> {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(receivers) => {
                debug!(event_type, receivers, "Broadcast event");
                Ok(receivers)
            }
            Err(_) => {
                // No receivers connected
                debug!(event_type, "No receivers for event");
                Ok(0)
            }
        }
    }
}

/// WebSocket upgrade handler for `GET /ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<WsState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<WsState>) {
    info!("WebSocket connected");
    with_metrics(|m| m.ws_connected());

    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.subscribe();

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => {
                    debug!("Client sent close frame");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Err(e) = send_json(&mut sender, &event).await {
                            error!(error = %e, "Failed to send event, closing connection");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Client lagged, some events were dropped");
                        let notice = json!({ "type": "Lagged", "skipped": skipped });
                        if send_json(&mut sender, &notice).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Broadcast channel closed");
                        break;
                    }
                }
            }

            _ = &mut recv_task => {
                debug!("Receiver task finished");
                break;
            }
        }
    }

    recv_task.abort();
    with_metrics(|m| m.ws_disconnected());
    info!("WebSocket disconnected");
}

async fn send_json<T: serde::Serialize>(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    value: &T,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(value).map_err(|e| {
        error!(error = %e, "Failed to serialize event");
        axum::Error::new(e)
    })?;

    sender.send(Message::Text(json)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_batch() -> RealtimeEvent {
        RealtimeEvent::TagBatch {
            device: "dock-1".to_string(),
            ts: Some(1_700_000_000_000),
            tags: vec![json!({ "epc": "5A42AA", "ant": 1, "count": 2 })],
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let state = WsState::new(16);
        assert_eq!(state.publish(tag_batch()), Ok(0));
    }

    #[test]
    fn test_publish_reaches_subscribers() {
        let state = WsState::new(16);
        let mut first = state.subscribe();
        let mut second = state.subscribe();
        assert_eq!(state.subscriber_count(), 2);

        assert_eq!(state.publish(tag_batch()), Ok(2));
        assert_eq!(first.try_recv().ok(), Some(tag_batch()));
        assert_eq!(second.try_recv().ok(), Some(tag_batch()));
    }

    #[test]
    fn test_slow_subscriber_lags() {
        let state = WsState::new(2);
        let mut rx = state.subscribe();
        for _ in 0..4 {
            let _ = state.publish(tag_batch());
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(2))
        ));
    }
}
