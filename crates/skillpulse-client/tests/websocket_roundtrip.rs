use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use skillpulse_client::{
    ClientConfig, ClientEvent, ConnectionState, EventClient, RememberScope, ResolutionReason,
};
use skillpulse_core::{ConfirmationResponsePayload, OutboundMessage};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

#[derive(Clone)]
struct Orchestrator {
    greeting: Arc<Vec<String>>,
    hang_up: bool,
    received: mpsc::Sender<String>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Orchestrator>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: Orchestrator) {
    for frame in state.greeting.iter() {
        if socket.send(Message::Text(frame.clone())).await.is_err() {
            return;
        }
    }
    if state.hang_up {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "orchestrator restarting".into(),
            })))
            .await;
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => {
                let _ = state.received.send(text).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn start_orchestrator(greeting: Vec<String>, hang_up: bool) -> (SocketAddr, mpsc::Receiver<String>) {
    let (received_tx, received_rx) = mpsc::channel(64);
    let state = Orchestrator {
        greeting: Arc::new(greeting),
        hang_up,
        received: received_tx,
    };
    let app = Router::new().route("/ws", get(ws_handler)).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, received_rx)
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<ClientEvent>, mut matches: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event stream failed: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_client_round_trip() {
    let greeting = vec![
        json!({
            "type": "connected",
            "data": {
                "running_executions": [
                    {"skill_id": "s1", "skill_name": "deploy", "total_steps": 3}
                ],
                "pending_confirmations": [{
                    "id": "c1",
                    "skill_id": "s1",
                    "step_index": 0,
                    "prompt": "Apply migration?",
                    "options": ["yes", "no"],
                    "timeout_seconds": 30
                }]
            }
        })
        .to_string(),
        json!({
            "type": "step_started",
            "data": {"skill_id": "s1", "step_index": 0, "step_name": "migrate"}
        })
        .to_string(),
    ];
    let (addr, mut received) = start_orchestrator(greeting, false).await;

    let client = EventClient::connect_ws(ClientConfig::with_url(format!("ws://{addr}/ws")))
        .expect("client");
    let mut events = client.subscribe();
    let _ = wait_for(&mut events, |event| {
        matches!(event, ClientEvent::StepUpdated { .. })
    })
    .await;

    assert_eq!(
        client.connection_state().await.expect("client"),
        ConnectionState::Connected
    );
    let execution = client.snapshot("s1").await.expect("client").expect("s1");
    assert_eq!(execution.current_step_name.as_deref(), Some("migrate"));
    assert_eq!(client.list_pending().await.expect("client").len(), 1);

    assert!(client
        .respond("c1", "yes", RememberScope::Always)
        .await
        .expect("client"));
    let frame = timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("timed out waiting for response")
        .expect("server gone");
    let message: OutboundMessage = serde_json::from_str(&frame).expect("outbound json");
    assert_eq!(
        message,
        OutboundMessage::ConfirmationResponse(ConfirmationResponsePayload {
            id: "c1".to_string(),
            response: "yes".to_string(),
            remember: RememberScope::Always,
        })
    );

    let resolved = wait_for(&mut events, |event| {
        matches!(event, ClientEvent::ConfirmationResolved { .. })
    })
    .await;
    assert_eq!(
        resolved,
        ClientEvent::ConfirmationResolved {
            id: "c1".to_string(),
            reason: ResolutionReason::Responded
        }
    );
    assert!(client.shutdown().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_close_reports_connectivity_down() {
    let (addr, _received) = start_orchestrator(Vec::new(), true).await;

    let client = EventClient::connect_ws(ClientConfig::with_url(format!("ws://{addr}/ws")))
        .expect("client");
    let mut events = client.subscribe();
    let _ = wait_for(&mut events, |event| {
        matches!(event, ClientEvent::Connectivity { connected: true })
    })
    .await;
    let _ = wait_for(&mut events, |event| {
        matches!(event, ClientEvent::Connectivity { connected: false })
    })
    .await;

    assert_eq!(
        client.connection_state().await.expect("client"),
        ConnectionState::Disconnected
    );
    assert!(client.shutdown().await);
}

#[tokio::test]
async fn invalid_url_is_rejected_up_front() {
    assert!(EventClient::connect_ws(ClientConfig::with_url("http://127.0.0.1:1")).is_err());
}
