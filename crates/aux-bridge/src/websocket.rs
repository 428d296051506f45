//! WebSocket handler for real-time updates

use axum::extract::ws::{Message, WebSocket};
use aux_protocol::{AcEvent, AcState};
use futures::{SinkExt, StreamExt};
use serde::Serialize;

use crate::AppState;

/// WebSocket events sent to clients
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    Connected,
    StateChanged { state: AcState },
    SequenceFinished,
    SequenceAborted { reason: String },
}

impl From<AcEvent> for WsEvent {
    fn from(event: AcEvent) -> Self {
        match event {
            AcEvent::StateChanged(state) => Self::StateChanged { state },
            AcEvent::SequenceFinished => Self::SequenceFinished,
            AcEvent::SequenceAborted(err) => Self::SequenceAborted {
                reason: err.to_string(),
            },
        }
    }
}

fn to_message(event: &WsEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            tracing::warn!("Failed to encode websocket event: {}", e);
            None
        }
    }
}

/// Handle a WebSocket connection
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let Some(connected) = to_message(&WsEvent::Connected) else {
        return;
    };
    if sender.send(connected).await.is_err() {
        return;
    }

    // Forward link events until the client goes away
    let mut event_rx = state.transport.subscribe();
    let send_task = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    let Some(msg) = to_message(&WsEvent::from(event)) else {
                        continue;
                    };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Websocket client lagged, skipped {} events", skipped);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    });

    // Clients only listen; commands go through the REST API
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use aux_protocol::{Mode, SequenceError};

    #[test]
    fn test_event_tags() {
        let json = serde_json::to_value(WsEvent::Connected).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "connected" }));

        let json = serde_json::to_value(WsEvent::from(AcEvent::SequenceFinished)).unwrap();
        assert_eq!(json["type"], "sequence_finished");
    }

    #[test]
    fn test_state_changed_carries_state() {
        let state = AcState {
            power: Some(true),
            mode: Some(Mode::Cool),
            ..AcState::default()
        };
        let json = serde_json::to_value(WsEvent::from(AcEvent::StateChanged(state))).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["state"]["power"], true);
        assert_eq!(json["state"]["mode"], "cool");
    }

    #[test]
    fn test_abort_reason_is_readable() {
        let event = WsEvent::from(AcEvent::SequenceAborted(SequenceError::Busy));
        match event {
            WsEvent::SequenceAborted { reason } => assert!(!reason.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
