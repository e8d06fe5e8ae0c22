use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::Utc;
use hydra_core::event::{Event, EventKind};
use serde::Deserialize;
use tracing::debug;

use crate::AppState;

#[derive(Deserialize)]
pub(crate) struct WsQuery {
    pub since: Option<u64>,
}

/// `/ws`: push-only ordered event stream. `since=<id>` replays retained
/// events after that id; a `gap` sentinel tells clients too far behind to
/// reconcile through REST first.
pub(crate) async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state, q.since))
}

async fn stream_events(mut socket: WebSocket, state: Arc<AppState>, since: Option<u64>) {
    let sub = state.hydra.bus.subscribe(since).await;

    if sub.gap {
        let floor = sub.replay.first().map(|e| e.id).unwrap_or(0);
        let sentinel = Event {
            id: 0,
            timestamp: Utc::now(),
            kind: EventKind::Gap { missed_before: floor },
        };
        if send_event(&mut socket, &sentinel).await.is_err() {
            return;
        }
    }

    for event in &sub.replay {
        if send_event(&mut socket, event).await.is_err() {
            return;
        }
    }

    let mut rx = sub.rx;
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            return;
                        }
                    }
                    // Bus dropped us (overflow); the client reconnects.
                    None => {
                        debug!("bus subscription ended");
                        return;
                    }
                }
            }
            // Clients never send; consume to notice the close handshake.
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &Event) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).map_err(axum::Error::new)?;
    socket.send(Message::Text(json)).await
}
