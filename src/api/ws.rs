// =============================================================================
// WebSocket Handler: Push-based event stream
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive every bus event they asked for
// as a JSON text frame `{"event": "<name>", "data": {...}}`.
//
// Query parameters:
//   userId   only forward trade:* events belonging to this user
//   prices   "true" to also receive price:update (off by default)
//   events   comma-separated event names, replacing the default set
//
// The handler also answers Ping frames and drops its bus subscription on
// disconnect.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::events::{Event, EventKind};

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    user_id: Option<String>,
    #[serde(default)]
    prices: bool,
    events: Option<String>,
}

impl WsQuery {
    fn kinds(&self) -> Vec<EventKind> {
        if let Some(names) = &self.events {
            return names
                .split(',')
                .filter_map(|name| EventKind::from_name(name.trim()))
                .collect();
        }
        let mut kinds = vec![
            EventKind::CandleUpdate,
            EventKind::TradeOpened,
            EventKind::TradeClosed,
            EventKind::TradeUpdated,
        ];
        if self.prices {
            kinds.push(EventKind::PriceUpdate);
        }
        kinds
    }

    /// Trade events for other users are withheld when `userId` is set.
    fn wants(&self, event: &Event) -> bool {
        match (event.trade(), &self.user_id) {
            (Some(trade), Some(user_id)) => &trade.user_id == user_id,
            _ => true,
        }
    }
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    info!(user_id = ?query.user_id, prices = query.prices, "WebSocket connection accepted");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, query))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Forward bus events and process incoming frames until either side closes.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, query: WsQuery) {
    let mut events = state.bus.subscribe_many(&query.kinds());
    let (mut sender, mut receiver) = socket.split();
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("event bus closed — disconnecting");
                    break;
                };
                if !query.wants(&event) {
                    continue;
                }
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(event = %event.kind(), error = %e, "Failed to serialize event");
                        continue;
                    }
                };
                if let Err(e) = sender.send(Message::Text(json)).await {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
                sent += 1;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }

    for id in events.ids() {
        state.bus.unsubscribe(*id);
    }
    info!(sent, "WebSocket connection closed");
}
