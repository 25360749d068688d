//! WebSocket remote control server (component K): lets a companion viewer
//! process observe and drive an [`ralph_tui_core::engine::ExecutionEngine`]
//! or [`ralph_tui_core::parallel::ParallelExecutor`] over a JSON-over-WebSocket
//! protocol, per spec.md §4.7. Grounded on the teacher's `gateway` module
//! (axum router + two-tier auth + append-only audit log), generalized from
//! a single bearer token and chat-only command set to the full engine
//! control surface.

pub mod audit;
pub mod auth;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;

use ralph_tui_core::config::RemoteServerConfig;
use ralph_tui_core::engine::ExecutionEngine;
use ralph_tui_core::parallel::ParallelConfig;
use ralph_tui_core::plugins::agent::AgentPlugin;
use ralph_tui_core::plugins::tracker::TrackerPlugin;

pub use error::RemoteError;
pub use session::GatewayState;

/// Construct the shared gateway state and run the server to completion (it
/// only returns on a bind failure or fatal I/O error — normal shutdown is
/// via the owning process's signal handler dropping the listener task).
pub async fn serve(
    project_dir: PathBuf,
    engine: Arc<ExecutionEngine>,
    tracker: Arc<dyn TrackerPlugin>,
    agent: Arc<dyn AgentPlugin>,
    parallel_defaults: ParallelConfig,
    config: RemoteServerConfig,
) -> Result<(), RemoteError> {
    let server_token = auth::load_or_create_server_token()?;
    let auth_state = auth::AuthState::new(server_token);
    let audit_log = Arc::new(audit::AuditLog::open()?);

    let state = GatewayState::new(
        engine,
        tracker,
        agent,
        parallel_defaults,
        auth_state,
        audit_log,
        project_dir,
    );

    // Bind every interface once a server token is in play so a companion
    // viewer on another host in the same trust boundary can connect;
    // loopback-only otherwise, per spec.md §4.7's bind-address rule.
    let bind_all_interfaces = config.server_token_configured;

    server::run(state, config.port, config.max_port_retries, bind_all_interfaces).await
}
