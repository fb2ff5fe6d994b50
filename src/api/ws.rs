//! WebSocket relay: one hub subscription per connection.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;
use tracing::{debug, warn};

use super::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct TelemetryQuery {
    /// Only relay events for this battery
    pub battery_id: Option<String>,
}

/// GET /ws/telemetry
pub async fn telemetry_ws(
    ws: WebSocketUpgrade,
    State(st): State<AppState>,
    Query(query): Query<TelemetryQuery>,
) -> Response {
    ws.on_upgrade(move |socket| relay(socket, st, query))
}

async fn relay(mut socket: WebSocket, st: AppState, query: TelemetryQuery) {
    let mut subscription = st.manager.subscribe();
    debug!(subscriber_id = subscription.id(), filter = ?query.battery_id, "websocket client connected");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    // hub closed during shutdown
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                if let Some(filter) = &query.battery_id {
                    if event.battery_id() != filter {
                        continue;
                    }
                }
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to serialise event");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    debug!(
        subscriber_id = subscription.id(),
        dropped = subscription.dropped_count(),
        "websocket client disconnected"
    );
}
