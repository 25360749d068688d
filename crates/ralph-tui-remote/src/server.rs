//! The axum WebSocket server implementing the remote control protocol
//! (spec.md §4.7). Grounded on the teacher's `gateway::{routes, ws}` axum
//! router plus upgrade handler, generalized from a single chat WebSocket
//! route to the full auth → subscribe → request/response → event-push
//! connection lifecycle.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use ralph_tui_core::config::{save_config, EngineConfig};
use ralph_tui_core::graph::{analyze_task_graph, recommend_parallelism};
use ralph_tui_core::log_sink::ParallelEvent;
use ralph_tui_core::parallel::ParallelExecutor;
use ralph_tui_core::plugins::tracker::GetTasksFilter;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth;
use crate::protocol::{ClientRequest, ConfigScope, ServerPush, ServerResponse, TokenType};
use crate::session::GatewayState;
use crate::RemoteError;

/// Transport envelope wrapping every request/response, per spec.md §4.7:
/// `{type, id, timestamp}` plus the payload's own fields flattened in.
#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    id: Option<String>,
    #[serde(flatten)]
    request: ClientRequest,
}

#[derive(Debug, Serialize)]
struct OutboundEnvelope<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    payload: T,
}

fn envelope<T: Serialize>(id: Option<String>, payload: T) -> String {
    serde_json::to_string(&OutboundEnvelope {
        id,
        timestamp: Utc::now(),
        payload,
    })
    .unwrap_or_else(|e| format!("{{\"type\":\"error\",\"error\":\"serialize failure: {e}\"}}"))
}

/// Run the remote control server, binding per spec.md §4.7's port-retry and
/// address-selection rules. `max_port_retries` additional ports are tried,
/// starting at `port`, only when the bind fails with `AddrInUse`. Binds to
/// loopback only when no server token file yet exists and the caller has
/// not explicitly requested one; otherwise binds all interfaces so a
/// companion viewer process on another host can connect.
pub async fn run(
    state: Arc<GatewayState>,
    port: u16,
    max_port_retries: u16,
    bind_all_interfaces: bool,
) -> Result<(), RemoteError> {
    let app = Router::new()
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let host = if bind_all_interfaces {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    };

    let mut attempt_port = port;
    let listener = loop {
        let addr = SocketAddr::new(host, attempt_port);
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(%addr, "remote control server listening");
                break listener;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if attempt_port >= port.saturating_add(max_port_retries) {
                    return Err(RemoteError::PortExhausted {
                        start: port,
                        end: port + max_port_retries,
                    });
                }
                warn!(port = attempt_port, "port in use, retrying next port");
                attempt_port += 1;
            }
            Err(e) => return Err(RemoteError::Io(e)),
        }
    };

    axum::serve(listener, app)
        .await
        .map_err(RemoteError::Io)?;
    Ok(())
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Per-connection state: whether auth has succeeded, which client id this
/// connection identifies as, and which event feed (if any) it's subscribed
/// to.
struct ConnectionState {
    client_id: String,
    authenticated: bool,
    subscribed: bool,
    /// `None` means unfiltered (forward every event type); `Some(types)`
    /// restricts forwarding to those wire `type` tags, per spec.md §4.7's
    /// `subscribe{eventTypes?}`.
    event_type_filter: Option<Vec<String>>,
}

async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let client_id = Uuid::new_v4().to_string();
    let mut conn = ConnectionState {
        client_id: client_id.clone(),
        authenticated: !state.auth.has_server_token(),
        subscribed: false,
        event_type_filter: None,
    };

    state.connected_clients.insert(client_id.clone(), Utc::now());

    let (mut sender, mut receiver) = socket.split();
    let mut engine_events = state.engine.on();
    let mut parallel_events: Option<broadcast::Receiver<ParallelEvent>> = None;

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let Some(Ok(msg)) = incoming else { break };
                let Message::Text(text) = msg else { continue };

                let parsed: Result<InboundEnvelope, _> = serde_json::from_str(&text);
                let Ok(inbound) = parsed else {
                    let _ = sender
                        .send(Message::Text(envelope_error(None, "malformed request")))
                        .await;
                    continue;
                };
                let id = inbound.id.clone();

                if !conn.authenticated {
                    match inbound.request {
                        ClientRequest::Ping => {
                            let _ = sender
                                .send(Message::Text(envelope(id, ServerResponse::Pong)))
                                .await;
                        }
                        ClientRequest::Auth { token, token_type } => {
                            let ok = authenticate(&state, &conn.client_id, &token, token_type);
                            let response = if ok {
                                conn.authenticated = true;
                                let (connection_token, expires_at) =
                                    state.auth.issue_connection_token(&conn.client_id);
                                ServerResponse::AuthResponse {
                                    success: true,
                                    connection_token: Some(connection_token),
                                    connection_token_expires_at: Some(expires_at),
                                    error: None,
                                }
                            } else {
                                ServerResponse::AuthResponse {
                                    success: false,
                                    connection_token: None,
                                    connection_token_expires_at: None,
                                    error: Some("invalid token".to_string()),
                                }
                            };
                            let _ = sender.send(Message::Text(envelope(id, response))).await;
                        }
                        _ => {
                            let _ = sender
                                .send(Message::Text(envelope(
                                    id,
                                    ServerResponse::Error {
                                        error: "authentication required".to_string(),
                                    },
                                )))
                                .await;
                        }
                    }
                    continue;
                }

                if let ClientRequest::Subscribe { event_types } = &inbound.request {
                    conn.subscribed = true;
                    conn.event_type_filter = event_types.clone();
                    if parallel_events.is_none() {
                        if let Some(executor) = current_executor(&state).await {
                            parallel_events = Some(executor.on_parallel());
                        }
                    }
                    let _ = sender
                        .send(Message::Text(envelope(id, ServerResponse::Subscribed)))
                        .await;
                    continue;
                }
                if let ClientRequest::Unsubscribe = &inbound.request {
                    conn.subscribed = false;
                    conn.event_type_filter = None;
                    let _ = sender
                        .send(Message::Text(envelope(id, ServerResponse::Unsubscribed)))
                        .await;
                    continue;
                }

                let response = handle_request(&state, &conn.client_id, inbound.request).await;
                state.audit.record(&conn.client_id, "request", "handled", None);
                let _ = sender.send(Message::Text(envelope(id, response))).await;
            }

            event = engine_events.recv() => {
                if !conn.subscribed {
                    continue;
                }
                match event {
                    Ok(event) => {
                        if !event_type_allowed(&conn.event_type_filter, event.event_type()) {
                            continue;
                        }
                        let push = ServerPush::EngineEvent { event };
                        let _ = sender.send(Message::Text(envelope(None, push))).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }

            event = recv_optional_parallel(&mut parallel_events) => {
                if !conn.subscribed {
                    continue;
                }
                if let Some(event) = event {
                    if !event_type_allowed(&conn.event_type_filter, event.event_type()) {
                        continue;
                    }
                    let orchestration_id = current_orchestration_id(&state).await.unwrap_or_default();
                    let push = ServerPush::ParallelEvent { orchestration_id, event };
                    let _ = sender.send(Message::Text(envelope(None, push))).await;
                }
            }
        }
    }

    // Spec.md §4.7 step 5: any orchestration this client owned is stopped
    // on disconnect, not left to run unattended.
    state.stop_owned_orchestration(&client_id).await;
    state.auth.revoke_client(&client_id);
    state.connected_clients.remove(&client_id);
}

/// Await the optional parallel-event receiver, never resolving while it's
/// absent so the `select!` arm stays parked instead of busy-looping.
async fn recv_optional_parallel(
    rx: &mut Option<broadcast::Receiver<ParallelEvent>>,
) -> Option<ParallelEvent> {
    match rx {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        },
        None => std::future::pending().await,
    }
}

fn authenticate(state: &GatewayState, client_id: &str, token: &str, token_type: TokenType) -> bool {
    let ok = match token_type {
        TokenType::Server => state.auth.validate_server_token(token),
        TokenType::Connection => state.auth.validate_connection_token(token).is_some(),
    };
    state.audit.record(
        client_id,
        "auth",
        if ok { "success" } else { "failure" },
        None,
    );
    ok
}

async fn current_executor(state: &GatewayState) -> Option<Arc<ParallelExecutor>> {
    match &*state.orchestration.lock().await {
        crate::session::OrchestrationSlot::Running { executor, .. } => Some(executor.clone()),
        _ => None,
    }
}

async fn current_orchestration_id(state: &GatewayState) -> Option<String> {
    match &*state.orchestration.lock().await {
        crate::session::OrchestrationSlot::Running { id, .. } => Some(id.clone()),
        _ => None,
    }
}

/// Whether an event of wire type `event_type` should be forwarded under
/// `filter`. `None` forwards everything; `Some(types)` forwards only an
/// exact match, per spec.md §4.7's `subscribe{eventTypes?}`.
fn event_type_allowed(filter: &Option<Vec<String>>, event_type: &str) -> bool {
    match filter {
        None => true,
        Some(types) => types.iter().any(|t| t == event_type),
    }
}

fn envelope_error(id: Option<String>, message: &str) -> String {
    envelope(
        id,
        ServerResponse::Error {
            error: message.to_string(),
        },
    )
}

async fn handle_request(
    state: &Arc<GatewayState>,
    client_id: &str,
    request: ClientRequest,
) -> ServerResponse {
    match request {
        ClientRequest::Auth { .. } | ClientRequest::Subscribe { .. } | ClientRequest::Unsubscribe => {
            unreachable!("handled before dispatch")
        }
        ClientRequest::Ping => ServerResponse::Pong,
        ClientRequest::GetState => {
            let value = serde_json::to_value(state.engine.get_state().await).unwrap_or_default();
            ServerResponse::State { state: value }
        }
        ClientRequest::GetTasks => match state.tracker.get_tasks(GetTasksFilter::default()).await {
            Ok(tasks) => ServerResponse::Tasks {
                tasks: serde_json::to_value(tasks).unwrap_or_default(),
            },
            Err(e) => ServerResponse::Error { error: e.to_string() },
        },
        ClientRequest::Pause => {
            state.engine.pause();
            ServerResponse::Ack { detail: None }
        }
        ClientRequest::Resume => {
            state.engine.resume();
            ServerResponse::Ack { detail: None }
        }
        ClientRequest::Interrupt => {
            state.engine.stop().await;
            ServerResponse::Ack { detail: None }
        }
        ClientRequest::Continue => match state.engine.continue_execution().await {
            Ok(reason) => ServerResponse::Ack {
                detail: Some(format!("{reason:?}")),
            },
            Err(e) => ServerResponse::Error { error: e.to_string() },
        },
        ClientRequest::RefreshTasks => match state.engine.refresh_tasks().await {
            Ok(()) => ServerResponse::Ack { detail: None },
            Err(e) => ServerResponse::Error { error: e.to_string() },
        },
        ClientRequest::AddIterations { count } => {
            state.engine.add_iterations(count).await;
            ServerResponse::Ack { detail: None }
        }
        ClientRequest::RemoveIterations { count } => {
            let applied = state.engine.remove_iterations(count).await;
            ServerResponse::Ack {
                detail: Some(applied.to_string()),
            }
        }
        ClientRequest::GetPromptPreview { task_id } => {
            let preview = state.engine.generate_prompt_preview(&task_id).await;
            ServerResponse::PromptPreview {
                success: preview.success,
                prompt: preview.prompt,
                source: preview.source,
                error: preview.error,
            }
        }
        ClientRequest::GetIterationOutput { task_id } => {
            let content = state.engine.get_iteration_output(&task_id).await;
            ServerResponse::IterationOutput { content }
        }
        ClientRequest::CheckConfig { config_content } => {
            match toml::from_str::<EngineConfig>(&config_content) {
                Ok(_) => ServerResponse::ConfigCheckResult {
                    valid: true,
                    error: None,
                },
                Err(e) => ServerResponse::ConfigCheckResult {
                    valid: false,
                    error: Some(e.to_string()),
                },
            }
        }
        ClientRequest::PushConfig {
            scope,
            config_content,
            overwrite,
        } => push_config(state, scope, &config_content, overwrite).await,
        ClientRequest::OrchestrateStart {
            max_workers,
            direct_merge,
            max_iterations,
        } => orchestrate_start(state, client_id, max_workers, direct_merge, max_iterations).await,
        ClientRequest::OrchestratePause { orchestration_id } => {
            with_executor(state, &orchestration_id, |e| e.pause()).await
        }
        ClientRequest::OrchestrateResume { orchestration_id } => {
            with_executor(state, &orchestration_id, |e| e.resume()).await
        }
        ClientRequest::OrchestrateStop { orchestration_id } => {
            with_executor(state, &orchestration_id, |e| e.stop()).await
        }
        ClientRequest::OrchestrateGetState { orchestration_id } => {
            match state.orchestration_executor(&orchestration_id).await {
                Some(executor) => ServerResponse::OrchestrationState {
                    state: serde_json::to_value(executor.get_state().await).unwrap_or_default(),
                },
                None => ServerResponse::Error {
                    error: format!("unknown orchestration id: {orchestration_id}"),
                },
            }
        }
    }
}

async fn with_executor(
    state: &Arc<GatewayState>,
    orchestration_id: &str,
    f: impl FnOnce(&ParallelExecutor),
) -> ServerResponse {
    match state.orchestration_executor(orchestration_id).await {
        Some(executor) => {
            f(&executor);
            ServerResponse::Ack { detail: None }
        }
        None => ServerResponse::Error {
            error: format!("unknown orchestration id: {orchestration_id}"),
        },
    }
}

async fn orchestrate_start(
    state: &Arc<GatewayState>,
    client_id: &str,
    max_workers: Option<usize>,
    direct_merge: Option<bool>,
    max_iterations: Option<u64>,
) -> ServerResponse {
    if let Err(e) = state.try_claim_orchestration().await {
        return ServerResponse::Error { error: e.to_string() };
    }

    let tasks = match state.tracker.get_tasks(GetTasksFilter::default()).await {
        Ok(tasks) => tasks.into_iter().filter(|t| t.is_open()).collect::<Vec<_>>(),
        Err(e) => {
            state.abandon_orchestration().await;
            return ServerResponse::Error { error: e.to_string() };
        }
    };

    let analysis = analyze_task_graph(&tasks);
    let mut config = state.parallel_defaults.clone();
    if let Some(workers) = max_workers {
        config.max_workers = workers;
    }
    if let Some(direct_merge) = direct_merge {
        config.fail_fast_merge = !direct_merge;
    }
    if let Some(max_iterations) = max_iterations {
        config.per_task_max_iterations = max_iterations;
    }
    let recommendation = recommend_parallelism(&tasks, &analysis, config.max_workers);

    let executor = Arc::new(ParallelExecutor::new(
        state.project_dir.clone(),
        state.tracker.clone(),
        state.agent.clone(),
        config,
    ));
    let orchestration_id = state
        .install_orchestration(executor.clone(), client_id.to_string())
        .await;

    let background_state = state.clone();
    let background_id = orchestration_id.clone();
    let background_executor = executor.clone();
    tokio::spawn(async move {
        if let Err(e) = background_executor.execute(None).await {
            warn!(error = %e, "parallel orchestration failed");
        }
        background_state
            .clear_orchestration_if_matches(&background_id)
            .await;
    });

    ServerResponse::OrchestrationStarted {
        orchestration_id,
        total_tasks: tasks.len(),
        total_groups: analysis.groups.len(),
        max_parallelism: analysis.max_parallelism,
        recommended_workers: recommendation.recommended_workers,
        confidence: recommendation.confidence,
    }
}

async fn push_config(
    state: &Arc<GatewayState>,
    scope: ConfigScope,
    config_content: &str,
    overwrite: bool,
) -> ServerResponse {
    let parsed: EngineConfig = match toml::from_str(config_content) {
        Ok(c) => c,
        Err(e) => {
            return ServerResponse::ConfigPushResult {
                success: false,
                backup_path: None,
                error: Some(e.to_string()),
            }
        }
    };

    let target_dir = match scope {
        ConfigScope::Project => state.project_dir.clone(),
        ConfigScope::Global => global_config_dir(),
    };
    let config_path = target_dir.join(".ralph-tui").join("engine.toml");

    let backup_path = if config_path.exists() && !overwrite {
        return ServerResponse::ConfigPushResult {
            success: false,
            backup_path: None,
            error: Some("config already exists; overwrite not requested".to_string()),
        };
    } else if config_path.exists() {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let backup = config_path.with_extension(format!("toml.{stamp}.bak"));
        if let Err(e) = std::fs::copy(&config_path, &backup) {
            return ServerResponse::ConfigPushResult {
                success: false,
                backup_path: None,
                error: Some(format!("failed to back up existing config: {e}")),
            };
        }
        Some(backup.display().to_string())
    } else {
        None
    };

    match save_config(&target_dir, &parsed) {
        Ok(()) => ServerResponse::ConfigPushResult {
            success: true,
            backup_path,
            error: None,
        },
        Err(e) => ServerResponse::ConfigPushResult {
            success: false,
            backup_path,
            error: Some(e),
        },
    }
}

fn global_config_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "ralph-tui")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".ralph-tui-global"))
}
