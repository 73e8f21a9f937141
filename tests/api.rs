//! HTTP and WebSocket surface tests against a server bound on an ephemeral
//! port and backed by the simulated control plane.

#![allow(clippy::panic, clippy::indexing_slicing)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use vm_orchestrator::api;
use vm_orchestrator::app_state::AppState;
use vm_orchestrator::control_plane::{ControlPlane, SimulatedControlPlane};
use vm_orchestrator::domain::{
    EventBus, EventKind, PowerState, SnapshotRegistry, VmEvent, VmId, VmStateStore,
};
use vm_orchestrator::persistence::MemoryCheckpointStore;
use vm_orchestrator::service::{
    EventMonitor, LifecycleOrchestrator, MonitorSettings, RetryPolicy, VmLocks,
};
use vm_orchestrator::ws::handler::ws_handler;

struct Server {
    addr: SocketAddr,
    client: reqwest::Client,
    monitor: Arc<EventMonitor>,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let Ok(resp) = self.client.get(self.url(path)).send().await else {
            panic!("GET {path} failed");
        };
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let Ok(resp) = self.client.post(self.url(path)).json(&body).send().await else {
            panic!("POST {path} failed");
        };
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn delete(&self, path: &str) -> (StatusCode, Value) {
        let Ok(resp) = self.client.delete(self.url(path)).send().await else {
            panic!("DELETE {path} failed");
        };
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }
}

async fn start() -> Server {
    let sim = SimulatedControlPlane::with_default_inventory();
    let _ = sim.connect().await;
    let control_plane: Arc<dyn ControlPlane> = Arc::new(sim);
    let retry = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        randomization_factor: 0.0,
    };

    let event_bus = EventBus::new(256);
    let store = Arc::new(VmStateStore::new(event_bus.clone(), Duration::from_secs(60)));
    let snapshots = Arc::new(SnapshotRegistry::new(event_bus.clone()));
    let locks = Arc::new(VmLocks::new(Duration::from_secs(5)));
    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        Arc::clone(&control_plane),
        Arc::clone(&store),
        Arc::clone(&snapshots),
        Arc::clone(&locks),
        retry,
        Duration::from_secs(2),
    ));
    let monitor = Arc::new(EventMonitor::new(
        control_plane,
        store,
        snapshots,
        locks,
        Arc::new(MemoryCheckpointStore::new()),
        MonitorSettings {
            retry,
            call_timeout: Duration::from_secs(2),
            reorder_window: 64,
        },
    ));
    let Ok(report) = monitor.reconcile().await else {
        panic!("initial reconciliation failed");
    };
    assert_eq!(report.listed, 2);

    let state = AppState {
        orchestrator,
        monitor: Arc::clone(&monitor),
        event_bus,
    };
    let app = Router::new()
        .merge(api::build_router())
        .route("/ws", get(ws_handler))
        .with_state(state);

    let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
        panic!("bind failed");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("no local address");
    };
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Server {
        addr,
        client: reqwest::Client::new(),
        monitor,
    }
}

async fn create_vm(server: &Server, name: &str) -> String {
    let (status, body) = server
        .post(
            "/api/v1/vms?wait=true",
            json!({ "name": name, "vcpus": 2, "memory_mib": 2048 }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let Some(id) = body["vm_id"].as_str() else {
        panic!("no vm_id in {body}");
    };
    id.to_string()
}

#[tokio::test]
async fn health_reports_cached_inventory() {
    let server = start().await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["vms"], 2);
}

#[tokio::test]
async fn list_and_filter_vms() {
    let server = start().await;
    let (status, body) = server.get("/api/v1/vms").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);

    let _ = create_vm(&server, "cold").await;
    let (_, body) = server.get("/api/v1/vms?power_state=off").await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["name"], "cold");

    let (_, body) = server.get("/api/v1/vms?name_contains=VM1").await;
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn unknown_vm_maps_to_structured_404() {
    let server = start().await;
    let (status, body) = server.get("/api/v1/vms/vm-404").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], 2001);
    assert_eq!(body["error"]["details"]["vm_id"], "vm-404");
}

#[tokio::test]
async fn invalid_transition_carries_last_known_state() {
    let server = start().await;
    let id = create_vm(&server, "idle").await;
    let (status, body) = server
        .post(
            &format!("/api/v1/vms/{id}/power?wait=true"),
            json!({ "action": "suspend" }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["details"]["last_known_state"], "off");
}

#[tokio::test]
async fn duplicate_name_is_a_bad_request() {
    let server = start().await;
    let (status, body) = server
        .post(
            "/api/v1/vms?wait=true",
            json!({ "name": "DC0_H0_VM0", "vcpus": 1, "memory_mib": 128 }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 1001);
}

#[tokio::test]
async fn accepted_operation_can_be_polled() {
    let server = start().await;
    let id = create_vm(&server, "web").await;
    let (status, accepted) = server
        .post(&format!("/api/v1/vms/{id}/power"), json!({ "action": "on" }))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let Some(url) = accepted["status_url"].as_str() else {
        panic!("no status url in {accepted}");
    };
    let url = url.to_string();

    let mut body = Value::Null;
    for _ in 0..100 {
        let (status, polled) = server.get(&url).await;
        assert_eq!(status, StatusCode::OK);
        body = polled;
        if body["status"] != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(body["status"], "succeeded", "{body}");
    assert_eq!(body["outcome"]["power_state"], "on");

    let (status, cancel) = server.delete(&url).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(cancel["cancellation_requested"], false);

    let (_, record) = server.get(&format!("/api/v1/vms/{id}")).await;
    assert_eq!(record["power_state"], "on");
}

#[tokio::test]
async fn unknown_operation_is_404() {
    let server = start().await;
    let (status, body) = server
        .get(&format!("/api/v1/operations/{}", uuid::Uuid::new_v4()))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], 2006);
}

#[tokio::test]
async fn snapshot_round_trip_over_http() {
    let server = start().await;
    let id = create_vm(&server, "db").await;
    let (status, created) = server
        .post(
            &format!("/api/v1/vms/{id}/snapshots?wait=true"),
            json!({ "name": "base", "description": "before upgrade" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let Some(sid) = created["snapshot_id"].as_str() else {
        panic!("no snapshot id in {created}");
    };
    let sid = sid.to_string();

    let (status, tree) = server.get(&format!("/api/v1/vms/{id}/snapshots")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tree["active"], sid.as_str());
    assert_eq!(tree["nodes"][0]["description"], "before upgrade");

    let (status, cmp) = server
        .get(&format!("/api/v1/vms/{id}/snapshots/{sid}/compare"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cmp["vcpu_delta"], 0);

    let (status, _) = server
        .post(
            &format!("/api/v1/vms/{id}/snapshots/{sid}/revert?wait=true"),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = server
        .delete(&format!("/api/v1/vms/{id}/snapshots/{sid}?wait=true"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, tree) = server.get(&format!("/api/v1/vms/{id}/snapshots")).await;
    assert_eq!(tree["nodes"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn template_and_clone_over_http() {
    let server = start().await;
    let id = create_vm(&server, "golden").await;
    let (status, _) = server
        .post(&format!("/api/v1/vms/{id}/template?wait=true"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, clone) = server
        .post(
            &format!("/api/v1/vms/{id}/clone?wait=true"),
            json!({ "name": "child", "power_on": true }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{clone}");
    assert_eq!(clone["power_state"], "on");

    let Some(child) = clone["vm_id"].as_str() else {
        panic!("no vm_id in {clone}");
    };
    let (status, deleted) = server
        .delete(&format!("/api/v1/vms/{child}?wait=true"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["power_state"], "deleted");

    let (_, listed) = server.get("/api/v1/vms?include_deleted=true&power_state=deleted").await;
    assert_eq!(listed["count"], 1);
}

#[tokio::test]
async fn clone_placement_over_http() {
    let server = start().await;
    let id = create_vm(&server, "base-image").await;
    let (status, _) = server
        .post(&format!("/api/v1/vms/{id}/template?wait=true"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, clone) = server
        .post(
            &format!("/api/v1/vms/{id}/clone?wait=true"),
            json!({ "name": "placed", "host": "DC0_H1", "datastore": "LocalDS_1" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{clone}");
    let Some(child) = clone["vm_id"].as_str() else {
        panic!("no vm_id in {clone}");
    };
    let (_, record) = server.get(&format!("/api/v1/vms/{child}")).await;
    assert_eq!(record["host"], "DC0_H1");
    assert_eq!(record["datastores"][0], "LocalDS_1");
}

#[tokio::test]
async fn recent_events_filter_by_kind() {
    let server = start().await;
    let id = create_vm(&server, "observed").await;
    let observed = VmId::from(id.as_str());
    let ghost = VmId::from("vm-ghost");
    let feed = [
        (
            1,
            &observed,
            EventKind::PowerChanged {
                power_state: PowerState::On,
            },
        ),
        (2, &ghost, EventKind::Deleted),
        (
            3,
            &observed,
            EventKind::PowerChanged {
                power_state: PowerState::Off,
            },
        ),
    ];
    for (sequence, vm_id, kind) in feed {
        server
            .monitor
            .ingest(VmEvent {
                sequence,
                vm_id: vm_id.clone(),
                revision: 1_000 + sequence,
                timestamp: Utc::now(),
                kind,
            })
            .await;
    }

    let (status, all) = server.get("/api/v1/events").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().map(Vec::len), Some(3));
    assert_eq!(all[0]["sequence"], 3);

    let (status, power) = server.get("/api/v1/events?kind=power&limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(power.as_array().map(Vec::len), Some(1));
    assert_eq!(power[0]["power_state"], "off");
    assert_eq!(power[0]["category"], "power");

    let (_, lifecycle) = server.get("/api/v1/events?kind=lifecycle").await;
    assert_eq!(lifecycle[0]["vm_id"], "vm-ghost");

    let (status, _) = server.get("/api/v1/events?kind=reboots").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn inventory_reports() {
    let server = start().await;
    let (status, hosts) = server.get("/api/v1/hosts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(hosts[0]["name"], "DC0_H0");
    assert_eq!(hosts[0]["memory_gib"], 4.0);

    let (status, datastores) = server.get("/api/v1/datastores").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(datastores[0]["used_gib"], 40.0);
}

#[tokio::test]
async fn websocket_streams_subscribed_changes() {
    let server = start().await;
    let id = create_vm(&server, "watched").await;

    let Ok((mut ws, _)) = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr)).await
    else {
        panic!("ws connect failed");
    };
    let subscribe = json!({
        "id": "sub-1",
        "type": "command",
        "timestamp": "2024-01-01T00:00:00Z",
        "payload": { "command": "subscribe", "vm_ids": [id] }
    });
    assert!(ws.send(Message::text(subscribe.to_string())).await.is_ok());

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["id"], "sub-1");
    assert_eq!(reply["payload"]["count"], 1);

    let (status, _) = server
        .post(
            &format!("/api/v1/vms/{id}/power?wait=true"),
            json!({ "action": "on" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let mut saw_on = false;
    for _ in 0..10 {
        let event = next_json(&mut ws).await;
        assert_eq!(event["type"], "event");
        let payload = &event["payload"];
        let on = payload["to"] == "on" || payload["record"]["power_state"] == "on";
        if on {
            saw_on = true;
            break;
        }
    }
    assert!(saw_on, "no power-on notification");
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let next = tokio::time::timeout(Duration::from_secs(5), ws.next()).await;
    let Ok(Some(Ok(msg))) = next else {
        panic!("no websocket message");
    };
    let Ok(text) = msg.to_text() else {
        panic!("non-text websocket message");
    };
    serde_json::from_str(text).unwrap_or(Value::Null)
}
