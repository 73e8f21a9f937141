//! WebSocket connection state machine.
//!
//! Handles the read/write loop for a single WebSocket connection,
//! dispatching incoming commands and forwarding filtered notifications.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use super::messages::{WsCommand, WsMessage, WsMessageType};
use super::subscription::SubscriptionManager;
use crate::domain::{VmChange, VmId, VmStateStore};
use crate::error::ErrorBody;

/// Runs the read/write loop for a single WebSocket connection.
///
/// - Reads commands from the client and dispatches them.
/// - Forwards matching changes from the [`broadcast::Receiver`] to the client.
pub async fn run_connection(
    socket: WebSocket,
    mut change_rx: broadcast::Receiver<VmChange>,
    store: Arc<VmStateStore>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut subs = SubscriptionManager::new();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response = handle_text_message(&text, &mut subs, &store).await;
                        if let Some(resp_json) = response
                            && ws_tx.send(Message::text(resp_json)).await.is_err() {
                                break;
                            }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
            change = change_rx.recv() => {
                match change {
                    Ok(change) => {
                        if subs.matches(change.vm_id()) {
                            let msg = WsMessage::new(
                                uuid::Uuid::new_v4().to_string(),
                                WsMessageType::Event,
                                serde_json::to_value(&change).unwrap_or_default(),
                            );
                            let json = serde_json::to_string(&msg).unwrap_or_default();
                            if ws_tx.send(Message::text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "ws client lagged behind event bus");
                        let msg = WsMessage::error(
                            String::new(),
                            410,
                            &format!("missed {n} notifications; refetch state"),
                        );
                        let json = serde_json::to_string(&msg).unwrap_or_default();
                        if ws_tx.send(Message::text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    tracing::debug!("ws connection closed");
}

/// Handles a text message from the client, returning an optional JSON response.
async fn handle_text_message(
    text: &str,
    subs: &mut SubscriptionManager,
    store: &VmStateStore,
) -> Option<String> {
    let Ok(msg) = serde_json::from_str::<WsMessage>(text) else {
        return serde_json::to_string(&WsMessage::error(String::new(), 400, "malformed JSON")).ok();
    };

    let Ok(command) = serde_json::from_value::<WsCommand>(msg.payload) else {
        return serde_json::to_string(&WsMessage::error(msg.id, 404, "unknown command")).ok();
    };

    let response = match command {
        WsCommand::Subscribe { vm_ids } => {
            let added = subs.subscribe(&vm_ids);
            WsMessage::new(
                msg.id,
                WsMessageType::Response,
                serde_json::json!({
                    "subscribed": added,
                    "count": subs.count(),
                    "wildcard": subs.is_subscribed_all(),
                }),
            )
        }
        WsCommand::Unsubscribe { vm_ids } => {
            let removed = subs.unsubscribe(&vm_ids);
            WsMessage::new(
                msg.id,
                WsMessageType::Response,
                serde_json::json!({
                    "unsubscribed": removed,
                    "remaining_count": subs.count(),
                    "wildcard": subs.is_subscribed_all(),
                }),
            )
        }
        WsCommand::GetVm { vm_id } => match store.get(&VmId::from(vm_id)).await {
            Ok(record) => WsMessage::new(
                msg.id,
                WsMessageType::Response,
                serde_json::to_value(&record).unwrap_or_default(),
            ),
            Err(err) => WsMessage::new(
                msg.id,
                WsMessageType::Error,
                serde_json::to_value(ErrorBody::from(&err)).unwrap_or_default(),
            ),
        },
    };
    serde_json::to_string(&response).ok()
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::{EventBus, PowerState, Resources, VmRecord};

    async fn store_with_vm() -> VmStateStore {
        let store = VmStateStore::new(EventBus::new(16), Duration::from_secs(60));
        store
            .upsert(VmRecord {
                id: VmId::from("vm-1"),
                name: "web".to_string(),
                power_state: PowerState::On,
                host: None,
                datastores: Vec::new(),
                resources: Resources {
                    vcpus: 2,
                    memory_mib: 1024,
                },
                is_template: false,
                revision: 1,
            })
            .await;
        store
    }

    fn reply(json: Option<String>) -> WsMessage {
        let Some(json) = json else {
            panic!("expected a reply");
        };
        let Ok(msg) = serde_json::from_str::<WsMessage>(&json) else {
            panic!("reply is not an envelope: {json}");
        };
        msg
    }

    #[tokio::test]
    async fn subscribe_then_filter() {
        let store = store_with_vm().await;
        let mut subs = SubscriptionManager::new();
        let text = r#"{"id":"1","type":"command","timestamp":"2024-01-01T00:00:00Z","payload":{"command":"subscribe","vm_ids":["vm-1"]}}"#;
        let msg = reply(handle_text_message(text, &mut subs, &store).await);
        assert_eq!(msg.msg_type, WsMessageType::Response);
        assert_eq!(msg.id, "1");
        assert!(subs.matches(&VmId::from("vm-1")));
    }

    #[tokio::test]
    async fn get_vm_returns_record_or_error() {
        let store = store_with_vm().await;
        let mut subs = SubscriptionManager::new();
        let found = r#"{"id":"2","type":"command","timestamp":"2024-01-01T00:00:00Z","payload":{"command":"get_vm","vm_id":"vm-1"}}"#;
        let msg = reply(handle_text_message(found, &mut subs, &store).await);
        assert_eq!(msg.payload["power_state"], "on");

        let missing = r#"{"id":"3","type":"command","timestamp":"2024-01-01T00:00:00Z","payload":{"command":"get_vm","vm_id":"vm-404"}}"#;
        let msg = reply(handle_text_message(missing, &mut subs, &store).await);
        assert_eq!(msg.msg_type, WsMessageType::Error);
        assert_eq!(msg.payload["code"], 2001);
    }

    #[tokio::test]
    async fn garbage_gets_malformed_error() {
        let store = store_with_vm().await;
        let mut subs = SubscriptionManager::new();
        let msg = reply(handle_text_message("not json", &mut subs, &store).await);
        assert_eq!(msg.msg_type, WsMessageType::Error);
        assert_eq!(msg.payload["code"], 400);
    }
}
