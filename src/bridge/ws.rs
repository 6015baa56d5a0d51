use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::{AppState, SharedState};
use super::models::{AgentStatus, ErrorInfo, Task, TaskMetadata, TaskStatus};
use super::prompts;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

/// Outbound events. Wire format is a flat JSON object tagged by a
/// snake_case `type` field (`{"type":"task_queued","task_id":...}`).
/// Delivery is fire-and-forget: a disconnected caller never affects the
/// queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Connection {
        status: String,
        message: String,
    },
    Pong {
        timestamp: String,
    },
    Error {
        message: String,
    },
    History {
        data: Vec<Task>,
    },
    TaskQueued {
        task_id: i64,
        queue_position: usize,
        total_in_queue: usize,
        metadata: TaskMetadata,
    },
    AgentCreated {
        agent_id: String,
        agent_status: AgentStatus,
        agent_url: Option<String>,
        branch_name: Option<String>,
        metadata: TaskMetadata,
    },
    AgentStatusUpdate {
        agent_id: String,
        agent_status: AgentStatus,
        response: serde_json::Value,
    },
    AgentCompleted {
        agent_id: String,
        agent_status: AgentStatus,
        branch_name: Option<String>,
        message: String,
    },
    AgentError {
        agent_id: String,
        agent_status: AgentStatus,
    },
    /// Remote dispatch failed; a fallback path was taken (or manual action
    /// is required).
    AgentFailed {
        message: String,
        file: Option<String>,
    },
    DeploymentSuccess {
        agent_id: String,
        status: TaskStatus,
        branch_name: Option<String>,
        message: String,
    },
    DeploymentError {
        agent_id: String,
        status: TaskStatus,
        message: String,
        retry_count: u32,
    },
    /// A client-reported deployment error whose analysis says it is not
    /// auto-fixable; the UI should offer a manual fix action.
    DeploymentErrorManual {
        deployment: Option<serde_json::Value>,
        message: String,
    },
    DeploymentRetry {
        original_agent_id: String,
        new_agent_id: String,
        retry_count: u32,
        max_retries: u32,
        message: String,
    },
    DeploymentTimeout {
        agent_id: String,
        message: String,
    },
    TaskCompleted {
        agent_id: String,
        status: TaskStatus,
        message: String,
    },
}

/// Inbound client messages, same tagging scheme.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    SendPrompt {
        prompt: String,
        #[serde(default)]
        metadata: TaskMetadata,
    },
    GetHistory,
    CheckAgentStatus {
        agent_id: String,
    },
    /// Deployment error pushed by a client with a log analysis attached;
    /// auto-fixable errors go straight to the editor fix path.
    DeploymentError {
        #[serde(default)]
        deployment: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<ErrorInfo>,
    },
    /// Manual fix trigger from the UI's "fix it" action.
    TriggerFixAgent {
        #[serde(default)]
        error_info: Option<ErrorInfo>,
    },
}

pub fn parse_client_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, receiver) = socket.split();
    let rx = state.ws_tx.subscribe();

    // Connection confirmation before entering the loop.
    let hello = WsMessage::Connection {
        status: "success".to_string(),
        message: "Connected to task bridge".to_string(),
    };
    if send_direct(&mut sender, &hello).await.is_err() {
        return;
    }
    eprintln!("[ws] client connected");

    run_socket_loop(sender, receiver, rx, state).await;
    eprintln!("[ws] client disconnected");
}

async fn send_direct(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &WsMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            eprintln!("[ws] Failed to serialize WsMessage: {}", e);
            Ok(())
        }
    }
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, inbound message dispatch, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    state: SharedState,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Broadcast forwarding ────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed some messages; continue receiving
                        continue;
                    }
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(text.as_str(), &mut sender, &state).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore Binary and Ping frames from the client
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

/// Dispatch one inbound message. Direct replies (pong, history, validation
/// errors) go to this socket only; everything the pipeline emits afterwards
/// is broadcast.
async fn handle_client_message(
    text: &str,
    sender: &mut SplitSink<WebSocket, Message>,
    state: &Arc<AppState>,
) {
    let message = match parse_client_message(text) {
        Ok(message) => message,
        Err(e) => {
            eprintln!("[ws] unparseable client message: {}", e);
            let _ = send_direct(
                sender,
                &WsMessage::Error {
                    message: "Failed to process message".to_string(),
                },
            )
            .await;
            return;
        }
    };

    match message {
        ClientMessage::Ping => {
            let _ = send_direct(
                sender,
                &WsMessage::Pong {
                    timestamp: chrono::Utc::now().to_rfc3339(),
                },
            )
            .await;
        }
        ClientMessage::SendPrompt { prompt, metadata } => {
            if prompt.trim().is_empty() {
                let _ = send_direct(
                    sender,
                    &WsMessage::Error {
                        message: "Prompt cannot be empty".to_string(),
                    },
                )
                .await;
                return;
            }
            let task = Task::new(prompt.trim().to_string(), metadata);
            eprintln!("[ws] prompt received (id: {})", task.id);
            if let Err(e) = state.history.record(&task).await {
                eprintln!("[ws] failed to record history: {:#}", e);
            }
            Arc::clone(&state.orchestrator).enqueue(task).await;
        }
        ClientMessage::GetHistory => {
            let _ = send_direct(
                sender,
                &WsMessage::History {
                    data: state.history.snapshot(),
                },
            )
            .await;
        }
        ClientMessage::CheckAgentStatus { agent_id } => {
            let orchestrator = Arc::clone(&state.orchestrator);
            tokio::spawn(async move {
                orchestrator.sync_agent_status(&agent_id).await;
            });
        }
        ClientMessage::DeploymentError { deployment, error } => {
            let info = error.unwrap_or_default();
            if info.analysis.as_ref().is_some_and(|a| a.is_auto_fixable) {
                eprintln!("[ws] deployment error is auto-fixable, dispatching fix to editor");
                let prompt = prompts::editor_fix_prompt(&info);
                let orchestrator = Arc::clone(&state.orchestrator);
                tokio::spawn(async move {
                    orchestrator.dispatch_fix_to_editor(&prompt).await;
                });
            } else {
                eprintln!("[ws] deployment error requires manual review");
                let _ = send_direct(
                    sender,
                    &WsMessage::DeploymentErrorManual {
                        deployment,
                        message: "Deployment error requires manual review".to_string(),
                    },
                )
                .await;
            }
        }
        ClientMessage::TriggerFixAgent { error_info } => {
            eprintln!("[ws] manual fix agent triggered");
            let prompt = prompts::editor_fix_prompt(&error_info.unwrap_or_default());
            let orchestrator = Arc::clone(&state.orchestrator);
            tokio::spawn(async move {
                orchestrator.dispatch_fix_to_editor(&prompt).await;
            });
        }
    }
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to all connected WebSocket clients.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json); // Ignore error if no receivers
        }
        Err(e) => {
            eprintln!("[ws] Failed to serialize WsMessage: {}", e);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
