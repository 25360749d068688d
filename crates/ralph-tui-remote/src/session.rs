//! Shared server state: the adapted engine/orchestrator handles, auth, and
//! audit log every WebSocket connection reads from. Grounded on the
//! teacher's `gateway::routes::GatewayState` (a single `Arc` the router
//! hands to every handler via axum's `State` extractor).

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ralph_tui_core::engine::ExecutionEngine;
use ralph_tui_core::parallel::{ParallelConfig, ParallelExecutor};
use ralph_tui_core::plugins::agent::AgentPlugin;
use ralph_tui_core::plugins::tracker::TrackerPlugin;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::auth::AuthState;

/// Lifecycle of the single parallel orchestration this server may run at
/// once. `Starting` is set before any `.await` so two concurrent
/// `orchestrate:start` requests cannot both observe `Idle` (spec.md §4.7).
pub enum OrchestrationSlot {
    Idle,
    Starting,
    Running {
        id: String,
        executor: Arc<ParallelExecutor>,
        /// The connection whose `orchestrate:start` created this run. Used
        /// so disconnect can stop an orchestration its owner abandoned,
        /// per spec.md §4.7 step 5.
        owner_client_id: String,
    },
}

/// Everything a connection handler needs, shared across the server's
/// lifetime.
pub struct GatewayState {
    pub engine: Arc<ExecutionEngine>,
    pub tracker: Arc<dyn TrackerPlugin>,
    pub agent: Arc<dyn AgentPlugin>,
    pub parallel_defaults: ParallelConfig,
    pub orchestration: Mutex<OrchestrationSlot>,
    pub auth: Arc<AuthState>,
    pub audit: Arc<AuditLog>,
    pub project_dir: PathBuf,
    /// Currently open connections, keyed by client id, for introspection and
    /// so a future `get_state` extension can report connection count
    /// without taking any per-connection lock.
    pub connected_clients: DashMap<String, DateTime<Utc>>,
}

impl GatewayState {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        tracker: Arc<dyn TrackerPlugin>,
        agent: Arc<dyn AgentPlugin>,
        parallel_defaults: ParallelConfig,
        auth: Arc<AuthState>,
        audit: Arc<AuditLog>,
        project_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            tracker,
            agent,
            parallel_defaults,
            orchestration: Mutex::new(OrchestrationSlot::Idle),
            auth,
            audit,
            project_dir,
            connected_clients: DashMap::new(),
        })
    }

    /// Attempt to claim the orchestration slot for a new run. Returns
    /// `Err` if one is already running or starting. On success the slot is
    /// left in `Starting` until the caller installs the constructed
    /// executor with [`Self::install_orchestration`].
    pub async fn try_claim_orchestration(&self) -> Result<(), &'static str> {
        let mut slot = self.orchestration.lock().await;
        match *slot {
            OrchestrationSlot::Idle => {
                *slot = OrchestrationSlot::Starting;
                Ok(())
            }
            OrchestrationSlot::Starting => Err("orchestration is already starting"),
            OrchestrationSlot::Running { .. } => Err("orchestration is already running"),
        }
    }

    pub async fn install_orchestration(
        &self,
        executor: Arc<ParallelExecutor>,
        owner_client_id: String,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        *self.orchestration.lock().await = OrchestrationSlot::Running {
            id: id.clone(),
            executor,
            owner_client_id,
        };
        id
    }

    /// Release a `Starting` claim without ever installing an executor
    /// (construction failed).
    pub async fn abandon_orchestration(&self) {
        *self.orchestration.lock().await = OrchestrationSlot::Idle;
    }

    pub async fn orchestration_executor(&self, orchestration_id: &str) -> Option<Arc<ParallelExecutor>> {
        match &*self.orchestration.lock().await {
            OrchestrationSlot::Running { id, executor, .. } if id == orchestration_id => {
                Some(executor.clone())
            }
            _ => None,
        }
    }

    pub async fn clear_orchestration_if_matches(&self, orchestration_id: &str) {
        let mut slot = self.orchestration.lock().await;
        if let OrchestrationSlot::Running { id, .. } = &*slot {
            if id == orchestration_id {
                *slot = OrchestrationSlot::Idle;
            }
        }
    }

    /// Stop the running orchestration if (and only if) `client_id` is the
    /// connection that started it, per spec.md §4.7 step 5: "any
    /// orchestration the client owned is stopped" on disconnect. The slot
    /// itself is left `Running` until the orchestration's own background
    /// task observes the stop and calls [`Self::clear_orchestration_if_matches`].
    pub async fn stop_owned_orchestration(&self, client_id: &str) {
        let executor = match &*self.orchestration.lock().await {
            OrchestrationSlot::Running {
                executor,
                owner_client_id,
                ..
            } if owner_client_id == client_id => Some(executor.clone()),
            _ => None,
        };
        if let Some(executor) = executor {
            executor.stop();
        }
    }
}
