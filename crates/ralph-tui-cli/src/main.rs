//! `ralph-tui` — thin wiring binary for the core crate. Constructs a
//! tracker/agent plugin pair, builds an [`ExecutionEngine`], optionally
//! starts the remote control server, and installs the signal handler
//! described in spec.md §9. Owns no business logic of its own: every
//! decision of substance (task selection, retries, merges) lives in
//! `ralph-tui-core`/`ralph-tui-remote`.

mod plugins;
mod signal;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ralph_tui_core::config;
use ralph_tui_core::engine::{ExecutionEngine, InitializeOptions};
use ralph_tui_core::plugins::agent::AgentPlugin;
use ralph_tui_core::plugins::tracker::TrackerPlugin;
use ralph_tui_core::session::lock::{self, AcquireOptions};
use ralph_tui_core::session::registry::{RegistryEntry, SessionRegistry};
use ralph_tui_core::session::store::{
    detect_and_recover_stale_session, PersistedSessionState, SessionMeta, SessionStatus,
    SessionStore, TrackerState,
};
use ralph_tui_core::task::TaskId;
use tracing::{error, info, warn};

use plugins::{JsonFileTrackerPlugin, SubprocessAgentPlugin};

#[derive(Parser, Debug)]
#[command(
    name = "ralph-tui",
    about = "Workstation-local orchestrator that drives an AI coding agent through a task backlog",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory to operate in. Defaults to the current directory.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a fresh session (or resume one already in progress for this
    /// project directory).
    Run(RunArgs),
    /// Reattach to a paused/interrupted session left behind by a previous
    /// process.
    Resume(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the JSON task-list file consumed by the bundled
    /// `prd-json` tracker plugin.
    #[arg(long, default_value = "tasks.json")]
    tasks_file: PathBuf,

    /// Program invoked for the primary agent plugin.
    #[arg(long, default_value = "claude")]
    agent: String,

    /// Arguments passed to the primary agent program, before `--model`/
    /// `--variant` are appended per execution.
    #[arg(long)]
    agent_arg: Vec<String>,

    /// Break a live session lock instead of refusing to start.
    #[arg(long)]
    force: bool,

    /// Fail instead of prompting when lock staleness is ambiguous.
    #[arg(long)]
    non_interactive: bool,

    /// Start the remote control WebSocket server alongside the engine.
    #[arg(long)]
    remote: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let project_dir = cli
        .cwd
        .unwrap_or_else(|| std::env::current_dir().expect("cannot determine current directory"));

    let result = match cli.command {
        Commands::Run(args) => run(project_dir, args, false).await,
        Commands::Resume(args) => run(project_dir, args, true).await,
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "ralph-tui exited with error");
            std::process::exit(1);
        }
    }
}

async fn run(project_dir: PathBuf, args: RunArgs, resuming: bool) -> Result<(), String> {
    let engine_config = config::load_config(&project_dir)?;

    let recovered_task_ids = recover_stale_session(&project_dir);

    let existing = SessionStore::load(&project_dir).map_err(|e| e.to_string())?;
    if resuming {
        match &existing {
            Some(state) if state.status.is_resumable() => {
                info!(session_id = %state.session_id, "resuming existing session");
            }
            Some(state) => {
                return Err(format!(
                    "session {} is in terminal state {:?} and cannot be resumed",
                    state.session_id, state.status
                ));
            }
            None => return Err("no session found for this project".to_string()),
        }
    }

    let session_id = existing
        .as_ref()
        .map(|s| s.session_id.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let lock_result = lock::acquire(
        &project_dir,
        &session_id,
        AcquireOptions {
            force: args.force,
            non_interactive: args.non_interactive,
        },
    )
    .map_err(|e| e.to_string())?;
    if !lock_result.acquired {
        return Err(lock_result
            .error
            .unwrap_or_else(|| "failed to acquire session lock".to_string()));
    }

    let tracker: Arc<dyn TrackerPlugin> = Arc::new(JsonFileTrackerPlugin::new(
        project_dir.join(&args.tasks_file),
    ));
    let agent: Arc<dyn AgentPlugin> = Arc::new(SubprocessAgentPlugin::new(
        args.agent.clone(),
        args.agent_arg.clone(),
    ));

    let engine = Arc::new(ExecutionEngine::new(
        project_dir.clone(),
        session_id.clone(),
        tracker.clone(),
        vec![(args.agent.clone(), agent.clone())],
        engine_config.clone(),
        None,
    ));

    if let Err(e) = engine
        .initialize(InitializeOptions { preflight: true })
        .await
    {
        lock::release(&project_dir).map_err(|e| e.to_string())?;
        return Err(e.to_string());
    }

    // If we recovered a stale session, the tasks it left `in_progress` must
    // be reset back to `open` before selection resumes (spec.md §4.1). Use
    // the IDs `recover_stale_session` handed back directly — by now
    // `existing.active_task_ids` (loaded after recovery already cleared and
    // saved it) is empty and can't be used for this.
    if !recovered_task_ids.is_empty() {
        let ids: Vec<TaskId> = recovered_task_ids.into_iter().collect();
        let reset = engine.reset_tasks_to_open(&ids).await;
        info!(reset, "reset stale in-progress tasks back to open");
    }

    write_running_session(&project_dir, &session_id, &engine_config, existing.is_none())?;
    register_session(&project_dir, &session_id, &engine_config, args.remote);

    let remote_handle = if args.remote || engine_config.remote_server.enabled {
        let project_dir = project_dir.clone();
        let engine = engine.clone();
        let tracker = tracker.clone();
        let agent = agent.clone();
        let remote_config = engine_config.remote_server.clone();
        let parallel_defaults = ralph_tui_core::parallel::ParallelConfig {
            branch_prefix: engine_config.branch_prefix.clone(),
            ..Default::default()
        };
        Some(tokio::spawn(async move {
            if let Err(e) = ralph_tui_remote::serve(
                project_dir,
                engine,
                tracker,
                agent,
                parallel_defaults,
                remote_config,
            )
            .await
            {
                warn!(error = %e, "remote control server exited");
            }
        }))
    } else {
        None
    };

    let shutdown_engine = engine.clone();
    let shutdown = tokio::spawn(async move {
        signal::wait_for_shutdown(shutdown_engine, None).await;
    });

    let stop_reason = engine.start().await;
    shutdown.abort();
    if let Some(handle) = remote_handle {
        handle.abort();
    }

    finalize_session(&project_dir, &session_id, &engine, stop_reason).await
}

/// Detect and recover a session abandoned by a crashed process before this
/// run's own lock acquisition attempts to read it, per spec.md §4.1. Returns
/// the task IDs `detect_and_recover_stale_session` cleared from
/// `activeTaskIds` — by the time this returns, the persisted file's own copy
/// is already empty, so the caller must use this return value (not a
/// subsequent `SessionStore::load`) to reset them in the tracker.
fn recover_stale_session(project_dir: &PathBuf) -> HashSet<TaskId> {
    let lock_pid = lock::check(project_dir).ok().and_then(|c| c.lock).map(|l| l.pid);
    match detect_and_recover_stale_session(project_dir, is_pid_alive, lock_pid) {
        Ok(outcome) if outcome.was_stale => {
            warn!(
                cleared_task_count = outcome.cleared_task_count,
                "recovered stale session left by a crashed process"
            );
            outcome.cleared_task_ids
        }
        Ok(_) => HashSet::new(),
        Err(e) => {
            warn!(error = %e, "failed to inspect session for stale recovery");
            HashSet::new()
        }
    }
}

/// Record this session in the cross-project registry so a companion viewer
/// process can discover it by directory, per spec.md §3's `SessionRegistry`.
fn register_session(project_dir: &PathBuf, session_id: &str, config: &ralph_tui_core::EngineConfig, remote: bool) {
    let registry = SessionRegistry::new(SessionRegistry::default_path());
    let entry = RegistryEntry {
        cwd: project_dir.clone(),
        alias: None,
        host: sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string()),
        port: remote.then_some(config.remote_server.port),
        last_seen: chrono::Utc::now(),
    };
    if let Err(e) = registry.upsert(session_id, entry) {
        warn!(error = %e, "failed to update cross-project session registry");
    }
}

fn deregister_session(session_id: &str) {
    let registry = SessionRegistry::new(SessionRegistry::default_path());
    if let Err(e) = registry.remove(session_id) {
        warn!(error = %e, "failed to remove session from cross-project registry");
    }
}

fn is_pid_alive(pid: u32) -> bool {
    let mut system = sysinfo::System::new();
    system.refresh_all();
    system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

fn write_running_session(
    project_dir: &PathBuf,
    session_id: &str,
    config: &ralph_tui_core::EngineConfig,
    fresh: bool,
) -> Result<(), String> {
    let mut state = if fresh {
        PersistedSessionState::create(SessionMeta {
            agent_plugin: "primary".to_string(),
            model: None,
            tracker_state: TrackerState {
                plugin: "prd-json".to_string(),
                total_tasks: 0,
                epic_id: None,
                prd_path: None,
            },
            max_iterations: config.max_iterations,
        })
    } else {
        SessionStore::load(project_dir)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "session disappeared between load and write".to_string())?
    };
    state.session_id = session_id.to_string();
    state.status = SessionStatus::Running;
    SessionStore::save(project_dir, &mut state).map_err(|e| e.to_string())
}

/// Persist the terminal session status and release the lock. A normal
/// completion deletes the session file entirely (S1 in spec.md §8); any
/// other stop reason leaves it behind, resumable, for `resume`.
async fn finalize_session(
    project_dir: &PathBuf,
    session_id: &str,
    engine: &ExecutionEngine,
    stop_reason: Result<ralph_tui_core::engine::StopReason, ralph_tui_core::EngineError>,
) -> Result<(), String> {
    use ralph_tui_core::engine::StopReason;

    let outcome = match stop_reason {
        Ok(StopReason::Completed) | Ok(StopReason::NoTasks) => {
            SessionStore::delete(project_dir).map_err(|e| e.to_string())?;
            lock::release(project_dir).map_err(|e| e.to_string())?;
            deregister_session(session_id);
            Ok(())
        }
        Ok(StopReason::Interrupted) => {
            set_session_status(project_dir, SessionStatus::Interrupted)?;
            lock::release(project_dir).map_err(|e| e.to_string())?;
            Ok(())
        }
        Ok(StopReason::MaxIterations) => {
            set_session_status(project_dir, SessionStatus::Paused)?;
            lock::release(project_dir).map_err(|e| e.to_string())?;
            Ok(())
        }
        Ok(StopReason::RateLimited) | Ok(StopReason::Error) => {
            // This terminates the session rather than leaving it resumable,
            // so any task the engine activated must go back to `open` now —
            // a later fresh run would otherwise find it wedged `in_progress`.
            let active: Vec<_> = engine.get_state().await.current_task.into_iter().map(|t| t.id).collect();
            if !active.is_empty() {
                engine.reset_tasks_to_open(&active).await;
            }
            set_session_status(project_dir, SessionStatus::Failed)?;
            lock::release(project_dir).map_err(|e| e.to_string())?;
            Err("engine stopped on an unrecoverable error".to_string())
        }
        Err(e) => {
            lock::release(project_dir).map_err(|e| e.to_string())?;
            Err(e.to_string())
        }
    };

    outcome
}

fn set_session_status(project_dir: &PathBuf, status: SessionStatus) -> Result<(), String> {
    if let Some(mut state) = SessionStore::load(project_dir).map_err(|e| e.to_string())? {
        state.status = status;
        SessionStore::save(project_dir, &mut state).map_err(|e| e.to_string())?;
    }
    Ok(())
}
