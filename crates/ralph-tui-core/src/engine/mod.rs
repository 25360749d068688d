//! Execution engine (component F): the state machine that drives one agent
//! subprocess through iterations of one task at a time, per spec.md §4.2.
//! This is the pivot of the system — the parallel executor (component J)
//! composes N of these in worker mode.

pub mod output_parser;
pub mod prompt;
pub mod retry;
pub mod state;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify, RwLock};
use tracing::{instrument, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::iteration::{AgentResult, IterationResult, IterationStatus, TokenUsageSummary};
use crate::log_sink::{EngineEvent, EventBus, IterationLogSink, OutputStream};
use crate::plugins::agent::{AgentPlugin, ExecuteOptions, StreamChunk};
use crate::plugins::tracker::{GetTasksFilter, TrackerPlugin};
use crate::session::{PersistedSessionState, SessionMeta, SessionStatus, SessionStore, TrackerState};
use crate::task::{Task, TaskId, TaskStatus};

pub use state::{
    ActiveAgentState, AgentSelectReason, EngineState, EngineStatus, RateLimitState, StopReason,
    SubagentNode, SubagentStatus,
};

/// Arguments to [`ExecutionEngine::initialize`]. The forced-task assignment
/// itself is supplied to [`ExecutionEngine::new`] at construction, not here —
/// `initialize` only covers tracker resolution and optional preflight.
#[derive(Default)]
pub struct InitializeOptions {
    pub preflight: bool,
}

/// One configured agent plugin slot: primary or a named fallback.
struct AgentSlot {
    name: String,
    plugin: Arc<dyn AgentPlugin>,
}

/// Drives one agent subprocess through an iteration loop against one task
/// (or, in worker mode, exactly one pre-assigned task). Grounded on the
/// teacher's `AgentLoop` builder-style construction and
/// `LifecycleSupervisor`'s `RwLock`-guarded mutable state, generalized from
/// a stateless chat turn to a crash-persisted, pausable task loop.
pub struct ExecutionEngine {
    tracker: Arc<dyn TrackerPlugin>,
    agents: Vec<AgentSlot>,
    project_dir: PathBuf,
    config: EngineConfig,
    tracker_kind: AsyncMutex<String>,
    forced_task: Option<Task>,

    state: RwLock<EngineState>,
    persisted: AsyncMutex<PersistedSessionState>,
    bus: Arc<EventBus>,
    log_sink: Arc<IterationLogSink>,

    pause_requested: AtomicBool,
    stop_requested: AtomicBool,
    started: AtomicBool,
    resume_notify: Notify,
    /// `(plugin index, execution id)` of the in-flight execution, if any —
    /// set only while step 4/5 of the loop is awaiting the agent.
    active_execution: AsyncMutex<Option<(usize, String)>>,
    iteration_counter: AtomicU64,
    /// Usage parsed from the most recently completed execution's stream,
    /// consumed by [`Self::run_one_iteration`] to populate the
    /// [`IterationResult`]'s `usage` field.
    last_usage: AsyncMutex<Option<TokenUsageSummary>>,
}

impl ExecutionEngine {
    /// Construct a new engine. `agents` is `(name, plugin)` pairs; the first
    /// is primary, the rest are fallbacks tried in order under rate
    /// limiting, per spec.md §4.2 step 4.
    pub fn new(
        project_dir: PathBuf,
        session_id: String,
        tracker: Arc<dyn TrackerPlugin>,
        agents: Vec<(String, Arc<dyn AgentPlugin>)>,
        config: EngineConfig,
        forced_task: Option<Task>,
    ) -> Self {
        let max_iterations = config.max_iterations;
        let bus = Arc::new(EventBus::new());
        let log_sink = Arc::new(IterationLogSink::new(&project_dir));
        let persisted = PersistedSessionState::create(SessionMeta {
            agent_plugin: agents.first().map(|(n, _)| n.clone()).unwrap_or_default(),
            model: None,
            tracker_state: TrackerState {
                plugin: "unresolved".to_string(),
                total_tasks: 0,
                epic_id: None,
                prd_path: None,
            },
            max_iterations,
        });
        let mut persisted = persisted;
        persisted.session_id = session_id;

        Self {
            tracker,
            agents: agents
                .into_iter()
                .map(|(name, plugin)| AgentSlot { name, plugin })
                .collect(),
            project_dir,
            config,
            tracker_kind: AsyncMutex::new("generic".to_string()),
            forced_task,
            state: RwLock::new(EngineState::new(max_iterations, 0)),
            persisted: AsyncMutex::new(persisted),
            bus,
            log_sink,
            pause_requested: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            resume_notify: Notify::new(),
            active_execution: AsyncMutex::new(None),
            iteration_counter: AtomicU64::new(0),
            last_usage: AsyncMutex::new(None),
        }
    }

    /// Subscribe to this engine's event stream. Listeners are expected to be
    /// non-blocking; a lagged receiver simply misses older events rather
    /// than stalling the engine (spec.md §4.2's "exceptions must not
    /// propagate" guarantee is met by the channel being fire-and-forget).
    pub fn on(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        self.bus.publish(event);
    }

    /// Resolve the tracker, seed `totalTasks`, and optionally preflight the
    /// primary agent. In worker mode (`forced_task` set) the tracker is
    /// still initialized but never consulted for selection.
    #[instrument(skip_all, fields(project = %self.project_dir.display()))]
    pub async fn initialize(&self, options: InitializeOptions) -> Result<(), EngineError> {
        let kind = self
            .tracker
            .initialize(serde_json::Value::Null)
            .await
            .map_err(|e| EngineError::InitializationFailed(e.to_string()))?;
        *self.tracker_kind.lock().await = kind.clone();

        if options.preflight {
            if let Some(primary) = self.agents.first() {
                let result = primary.plugin.preflight(std::time::Duration::from_secs(30)).await;
                if !result.success {
                    return Err(EngineError::InitializationFailed(
                        result.error.unwrap_or_else(|| "preflight failed".to_string()),
                    ));
                }
            } else {
                return Err(EngineError::NoAgentPlugin);
            }
        }

        let tasks = self
            .tracker
            .get_tasks(GetTasksFilter::default())
            .await
            .map_err(|e| EngineError::Tracker(e.to_string()))?;

        {
            let mut state = self.state.write().await;
            state.total_tasks = tasks.len() as u64;
        }
        {
            let mut persisted = self.persisted.lock().await;
            persisted.tracker_state.total_tasks = tasks.len() as u64;
            persisted.tracker_state.plugin = kind;
        }

        Ok(())
    }

    /// Read-only snapshot of the full engine state.
    pub async fn get_state(&self) -> EngineState {
        self.state.read().await.clone()
    }

    pub async fn get_subagent_tree(&self) -> Vec<SubagentNode> {
        self.state.read().await.subagent_tree.clone()
    }

    /// Read back the most recent completed iteration's full log for
    /// `task_id`, if one exists.
    pub async fn get_iteration_output(&self, task_id: &TaskId) -> Option<String> {
        let (session_id, iteration) = {
            let state = self.state.read().await;
            let iteration = state
                .iterations
                .iter()
                .rev()
                .find(|r| &r.task.id == task_id)?
                .iteration;
            (self.persisted.lock().await.session_id.clone(), iteration)
        };
        self.log_sink.read(&session_id, iteration, task_id).ok()?
    }

    /// Run the prompt builder for `task_id` without executing the agent.
    pub async fn generate_prompt_preview(&self, task_id: &TaskId) -> prompt::PromptPreview {
        let task = match self.tracker.get_task(task_id).await {
            Ok(t) => t,
            Err(e) => {
                return prompt::PromptPreview {
                    success: false,
                    prompt: None,
                    source: None,
                    error: Some(e.to_string()),
                }
            }
        };
        let kind = self.tracker_kind.lock().await.clone();
        let progress_path = self.project_dir.join(".ralph-tui").join("progress.md");
        let progress_path = progress_path.exists().then_some(progress_path);
        let previous = self.state.read().await.iterations.last().cloned();

        prompt::generate_prompt_preview(
            &kind,
            task.as_ref(),
            progress_path.as_deref(),
            previous.as_ref(),
        )
    }

    /// Re-fetch tasks from the tracker and emit `tasks:refreshed`.
    pub async fn refresh_tasks(&self) -> Result<(), EngineError> {
        let tasks = self
            .tracker
            .get_tasks(GetTasksFilter::default())
            .await
            .map_err(|e| EngineError::Tracker(e.to_string()))?;
        let total = tasks.len() as u64;
        self.state.write().await.total_tasks = total;
        self.emit(EngineEvent::TasksRefreshed { total });
        Ok(())
    }

    /// Best-effort reset of `task_ids` back to `open`, used during graceful
    /// shutdown. Returns the count actually reset.
    pub async fn reset_tasks_to_open(&self, task_ids: &[TaskId]) -> usize {
        let mut reset_count = 0;
        for id in task_ids {
            if self
                .tracker
                .update_task_status(id, TaskStatus::Open)
                .await
                .is_ok()
            {
                reset_count += 1;
            }
        }
        reset_count
    }

    /// Increase `maxIterations` by `n`; returns whether the engine can now
    /// continue.
    pub async fn add_iterations(&self, n: u64) -> bool {
        let mut state = self.state.write().await;
        state.max_iterations += n;
        self.emit(EngineEvent::EngineIterationsAdded {
            count: n,
            new_max: state.max_iterations,
        });
        state.can_continue()
    }

    /// Decrease `maxIterations` by `n`, refusing to go below
    /// `max(currentIteration, 1)`.
    pub async fn remove_iterations(&self, n: u64) -> bool {
        let mut state = self.state.write().await;
        let floor = state.current_iteration.max(1);
        if state.max_iterations <= floor {
            return false;
        }
        let new_max = state.max_iterations.saturating_sub(n).max(floor);
        state.max_iterations = new_max;
        self.emit(EngineEvent::EngineIterationsRemoved {
            count: n,
            new_max,
        });
        true
    }

    /// Request a pause at the next loop boundary. A no-op while already
    /// `pausing`; has no effect once `paused`. If an iteration is currently
    /// `executing`, flips the observable status to `pausing` immediately so
    /// the `executing → pausing → paused` sequence (spec.md §8 S2) is
    /// visible to listeners before the in-flight iteration actually ends.
    pub fn pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
        if let Ok(mut state) = self.state.try_write() {
            if state.status == EngineStatus::Executing {
                state.status = EngineStatus::Pausing;
            }
        }
    }

    /// Cancel a pending pause request, or resume from `paused`. Reverts a
    /// mid-iteration `pausing` status back to `executing` if the pause
    /// request is being cancelled before the loop boundary was reached.
    pub fn resume(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
        if let Ok(mut state) = self.state.try_write() {
            if state.status == EngineStatus::Pausing {
                state.status = EngineStatus::Executing;
            }
        }
        self.resume_notify.notify_waiters();
    }

    /// Interrupt the in-flight agent execution immediately and exit the
    /// loop with reason `interrupted`. Flips the observable status to
    /// `stopping` while the in-flight agent is being interrupted, mirroring
    /// `pause()`'s `executing → pausing` transition.
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.write().await;
            if state.status == EngineStatus::Executing {
                state.status = EngineStatus::Stopping;
            }
        }
        if let Some((idx, execution_id)) = self.active_execution.lock().await.clone() {
            if let Some(slot) = self.agents.get(idx) {
                slot.plugin.interrupt(&execution_id).await;
            }
        }
        self.resume_notify.notify_waiters();
    }

    /// Run the iteration loop until a terminal stop condition. May be called
    /// at most once per engine lifetime.
    #[instrument(skip_all)]
    pub async fn start(&self) -> Result<StopReason, EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }
        {
            let mut state = self.state.write().await;
            state.started_at = Some(Utc::now());
        }
        self.emit(EngineEvent::EngineStarted);
        self.run_loop().await
    }

    /// Resume the loop after `stopped`/`idle-complete`, provided the
    /// iteration budget allows it.
    pub async fn continue_execution(&self) -> Result<StopReason, EngineError> {
        {
            let state = self.state.read().await;
            if !state.can_continue() {
                return Err(EngineError::InitializationFailed(
                    "iteration budget exhausted".to_string(),
                ));
            }
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.run_loop().await
    }

    async fn run_loop(&self) -> Result<StopReason, EngineError> {
        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                self.state.write().await.status = EngineStatus::Stopped;
                self.emit(EngineEvent::EngineStopped {
                    reason: "interrupted".to_string(),
                });
                return Ok(StopReason::Interrupted);
            }

            self.state.write().await.status = EngineStatus::Selecting;
            let task = match self.select_task().await? {
                Some(task) => task,
                None => {
                    self.state.write().await.status = EngineStatus::IdleComplete;
                    // Worker mode has exactly one forced task; `select_task`
                    // returning `None` there means that task is already
                    // `completed`, not that the backlog is empty.
                    let reason = if self.forced_task.is_some() {
                        self.emit(EngineEvent::AllComplete);
                        StopReason::Completed
                    } else {
                        StopReason::NoTasks
                    };
                    self.emit(EngineEvent::EngineStopped {
                        reason: format!("{reason:?}"),
                    });
                    return Ok(reason);
                }
            };

            self.emit(EngineEvent::TaskSelected { task: task.clone() });
            self.activate_task(&task).await?;

            match self.run_one_iteration(task).await? {
                ControlFlow::Continue => {}
                ControlFlow::Stop(reason) => {
                    let status = match reason {
                        StopReason::Completed => EngineStatus::IdleComplete,
                        StopReason::Error | StopReason::RateLimited => EngineStatus::Error,
                        _ => EngineStatus::Stopped,
                    };
                    self.state.write().await.status = status;
                    self.emit(EngineEvent::EngineStopped {
                        reason: format!("{reason:?}"),
                    });
                    return Ok(reason);
                }
            }

            if self.maybe_pause().await {
                // resumed; continue the loop
            }
        }
    }

    /// Block in `paused` until `resume()`/`stop()`. Returns `true` if the
    /// caller paused and has since resumed.
    async fn maybe_pause(&self) -> bool {
        if !self.pause_requested.load(Ordering::SeqCst) {
            return false;
        }
        self.state.write().await.status = EngineStatus::Paused;
        {
            let mut persisted = self.persisted.lock().await;
            persisted.is_paused = true;
            persisted.paused_at = Some(Utc::now());
            let _ = SessionStore::save(&self.project_dir, &mut persisted);
        }
        self.emit(EngineEvent::EnginePaused);
        self.resume_notify.notified().await;
        {
            let mut persisted = self.persisted.lock().await;
            persisted.is_paused = false;
            persisted.paused_at = None;
            let _ = SessionStore::save(&self.project_dir, &mut persisted);
        }
        self.emit(EngineEvent::EngineResumed);
        self.state.write().await.status = EngineStatus::Selecting;
        true
    }

    async fn select_task(&self) -> Result<Option<Task>, EngineError> {
        if let Some(task) = &self.forced_task {
            // Worker mode is pinned to exactly one task; once the tracker
            // reports it `completed` there is nothing left for this worker
            // to do, so stop selecting rather than re-activating it.
            let still_open = self
                .tracker
                .get_task(&task.id)
                .await
                .map_err(|e| EngineError::Tracker(e.to_string()))?
                .map(|t| t.status != TaskStatus::Completed)
                .unwrap_or(true);
            return Ok(still_open.then(|| task.clone()));
        }

        let mut tasks = self
            .tracker
            .get_tasks(GetTasksFilter {
                status: Some([TaskStatus::Open].into_iter().collect()),
            })
            .await
            .map_err(|e| EngineError::Tracker(e.to_string()))?;

        tasks.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(tasks.into_iter().next())
    }

    async fn activate_task(&self, task: &Task) -> Result<(), EngineError> {
        self.tracker
            .update_task_status(&task.id, TaskStatus::InProgress)
            .await
            .map_err(|e| EngineError::Tracker(e.to_string()))?;

        {
            let mut state = self.state.write().await;
            state.status = EngineStatus::Executing;
            state.current_task = Some(task.clone());
        }
        {
            let mut persisted = self.persisted.lock().await;
            persisted.active_task_ids.insert(task.id.clone());
            let _ = SessionStore::save(&self.project_dir, &mut persisted);
        }
        self.emit(EngineEvent::TaskActivated {
            task_id: task.id.clone(),
        });
        Ok(())
    }

    async fn run_one_iteration(&self, task: Task) -> Result<ControlFlow, EngineError> {
        let iteration = self.iteration_counter.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.state.write().await;
            state.current_iteration = iteration;
        }
        self.emit(EngineEvent::IterationStarted {
            iteration,
            task_id: task.id.clone(),
        });

        let mut result = IterationResult::starting(iteration, task.clone());
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.execute_once(&task).await {
                Ok(agent_result) => {
                    let interrupted = agent_result.interrupted;
                    let succeeded = !interrupted && agent_result.exit_code == Some(0);
                    result.agent_result = Some(agent_result);
                    result.usage = self.last_usage.lock().await.take();

                    if interrupted {
                        result.finish(IterationStatus::Failed, false);
                        self.persist_iteration(&result).await;
                        return Ok(ControlFlow::Stop(StopReason::Interrupted));
                    }

                    if succeeded {
                        let task_completed = self.detect_completion(&task, &mut result).await?;
                        result.finish(IterationStatus::Succeeded, task_completed);
                        self.persist_iteration(&result).await;
                        self.emit(EngineEvent::IterationCompleted {
                            result: Box::new(result.clone()),
                        });
                        return Ok(self.check_termination(task_completed).await);
                    }

                    // Non-zero exit: apply retry policy.
                    if self.config.retry_policy.should_retry(attempt) {
                        self.emit(EngineEvent::IterationRetrying { iteration, attempt });
                        result.status = IterationStatus::Retrying;
                        tokio::time::sleep(self.config.retry_policy.backoff_for_attempt(attempt))
                            .await;
                        continue;
                    }

                    result.finish(IterationStatus::Failed, false);
                    self.persist_iteration(&result).await;
                    self.emit(EngineEvent::IterationFailed {
                        iteration,
                        task_id: task.id.clone(),
                        error: "agent exited non-zero after exhausting retries".to_string(),
                    });
                    return Ok(match self.config.retry_policy.on_exhaustion {
                        retry::ExhaustionAction::Abort => ControlFlow::Stop(StopReason::Error),
                        retry::ExhaustionAction::Continue => ControlFlow::Continue,
                    });
                }
                Err(EngineError::AllAgentsLimited) => {
                    self.emit(EngineEvent::AgentAllLimited);
                    return Ok(ControlFlow::Stop(StopReason::RateLimited));
                }
                Err(EngineError::RateLimited(_, _)) => {
                    // Mid-stream rate-limit signal: `execute_once` has already
                    // recorded the limit and the fallback switch, if any, was
                    // emitted by `choose_agent`. Retry the same iteration
                    // immediately without consuming retry budget.
                    attempt -= 1;
                    continue;
                }
                Err(e) => {
                    if self.config.retry_policy.should_retry(attempt) {
                        self.emit(EngineEvent::IterationRetrying { iteration, attempt });
                        tokio::time::sleep(self.config.retry_policy.backoff_for_attempt(attempt))
                            .await;
                        continue;
                    }
                    result.finish(IterationStatus::Failed, false);
                    self.persist_iteration(&result).await;
                    self.emit(EngineEvent::IterationFailed {
                        iteration,
                        task_id: task.id.clone(),
                        error: e.to_string(),
                    });
                    return Ok(ControlFlow::Stop(StopReason::Error));
                }
            }
        }
    }

    /// Choose primary or fallback under rate limiting, execute, and stream
    /// output into `currentOutput`/`currentStderr`, per spec.md §4.2 steps
    /// 4-5.
    async fn execute_once(&self, task: &Task) -> Result<AgentResult, EngineError> {
        let (idx, reason) = self.choose_agent().await?;
        let slot = &self.agents[idx];

        {
            let mut state = self.state.write().await;
            state.active_agent = Some(ActiveAgentState {
                plugin: slot.name.clone(),
                reason,
                since: Utc::now(),
            });
            state.current_output.clear();
            state.current_stderr.clear();
        }

        let kind = self.tracker_kind.lock().await.clone();
        let progress_path = self.project_dir.join(".ralph-tui").join("progress.md");
        let progress_path = progress_path.exists().then_some(progress_path);
        let previous = self.state.read().await.iterations.last().cloned();
        let (prompt_text, _source) =
            prompt::build_prompt(&kind, task, progress_path.as_deref(), previous.as_ref());

        let mut handle = slot
            .plugin
            .execute(prompt_text, None, ExecuteOptions::default())
            .await
            .map_err(|e| EngineError::AgentSpawn(e.to_string()))?;

        *self.active_execution.lock().await = Some((idx, handle.execution_id.clone()));

        let mut stream_parser = output_parser::StreamParser::new();
        let mut usage = TokenUsageSummary::default();

        while let Some(chunk) = handle.stream.recv().await {
            let (text, stream) = match chunk {
                StreamChunk::Stdout(s) => (s, OutputStream::Stdout),
                StreamChunk::Stderr(s) => (s, OutputStream::Stderr),
            };
            {
                let mut state = self.state.write().await;
                match stream {
                    OutputStream::Stdout => state.current_output.push_str(&text),
                    OutputStream::Stderr => state.current_stderr.push_str(&text),
                }
            }
            self.emit(EngineEvent::AgentOutput {
                execution_id: handle.execution_id.clone(),
                chunk: text.clone(),
                stream,
            });

            if stream == OutputStream::Stdout {
                let outcome = stream_parser.feed(&text);
                if let Some(model) = outcome.model {
                    self.state.write().await.current_model = Some(model.clone());
                    self.emit(EngineEvent::AgentModel {
                        execution_id: handle.execution_id.clone(),
                        model,
                    });
                }
                if let Some((input_tokens, output_tokens)) = outcome.usage {
                    usage.merge(input_tokens, output_tokens);
                    self.emit(EngineEvent::AgentUsage {
                        execution_id: handle.execution_id.clone(),
                        input_tokens,
                        output_tokens,
                    });
                }
                self.state.write().await.subagent_tree = stream_parser.subagent_tree();

                if let Some(retry_after) = outcome.rate_limited {
                    slot.plugin.interrupt(&handle.execution_id).await;
                    while handle.stream.recv().await.is_some() {}
                    let _ = handle.completion.await;
                    *self.active_execution.lock().await = None;
                    self.mark_rate_limited(&slot.name, retry_after).await;
                    return Err(EngineError::RateLimited(slot.name.clone(), retry_after));
                }
            }
        }

        let agent_result = handle
            .completion
            .await
            .map_err(|_| EngineError::AgentRuntime("execution channel closed".to_string()))?;

        *self.active_execution.lock().await = None;
        *self.last_usage.lock().await = (usage.events > 0).then_some(usage);

        if reason == AgentSelectReason::Recovery {
            let succeeded = !agent_result.interrupted && agent_result.exit_code == Some(0);
            if succeeded {
                self.state.write().await.rate_limit_state.remove(&slot.name);
            } else {
                let retry_after =
                    Utc::now() + chrono::Duration::milliseconds(self.config.retry_policy.initial_delay_ms as i64);
                self.state.write().await.rate_limit_state.insert(
                    slot.name.clone(),
                    RateLimitState {
                        limited: true,
                        retry_after: Some(retry_after),
                    },
                );
            }
            self.emit(EngineEvent::AgentRecoveryAttempted { success: succeeded });
        }

        Ok(agent_result)
    }

    /// Select primary or the first unlimited fallback, per spec.md §4.2
    /// step 4. Returns `EngineError::AllAgentsLimited` if every configured
    /// agent is currently rate-limited.
    async fn choose_agent(&self) -> Result<(usize, AgentSelectReason), EngineError> {
        let now = Utc::now();
        let state = self.state.read().await;

        if let Some(primary_limit) = state.rate_limit_state.get(&self.agents[0].name) {
            if primary_limit.limited {
                match primary_limit.retry_after {
                    Some(retry_after) if retry_after > now => {
                        for (idx, slot) in self.agents.iter().enumerate().skip(1) {
                            let limited = state
                                .rate_limit_state
                                .get(&slot.name)
                                .map(|l| l.limited)
                                .unwrap_or(false);
                            if !limited {
                                let to_plugin = slot.name.clone();
                                drop(state);
                                self.emit(EngineEvent::AgentSwitched {
                                    reason: "fallback".to_string(),
                                    to_plugin,
                                });
                                return Ok((idx, AgentSelectReason::Fallback));
                            }
                        }
                        return Err(EngineError::AllAgentsLimited);
                    }
                    // `retry_after` has passed (or is unset): opportunistically
                    // retry primary once, per spec.md §4.2 step 4.
                    _ => return Ok((0, AgentSelectReason::Recovery)),
                }
            }
        }
        Ok((0, AgentSelectReason::Primary))
    }

    /// Mark an agent as rate-limited until `retry_after`, recording the
    /// change for [`Self::choose_agent`]'s next call.
    pub async fn mark_rate_limited(&self, agent_name: &str, retry_after: chrono::DateTime<Utc>) {
        self.state.write().await.rate_limit_state.insert(
            agent_name.to_string(),
            RateLimitState {
                limited: true,
                retry_after: Some(retry_after),
            },
        );
        self.emit(EngineEvent::EngineWarning {
            message: format!("agent '{agent_name}' rate-limited until {retry_after}"),
        });
    }

    /// After the agent exits, consult the tracker for the task's new
    /// status. If `completed`, update counters; if still `in_progress` and
    /// auto-commit is enabled, commit any working-tree changes.
    async fn detect_completion(
        &self,
        task: &Task,
        result: &mut IterationResult,
    ) -> Result<bool, EngineError> {
        let refreshed = self
            .tracker
            .get_task(&task.id)
            .await
            .map_err(|e| EngineError::Tracker(e.to_string()))?;

        let completed = refreshed
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false);

        if completed {
            {
                let mut state = self.state.write().await;
                state.tasks_completed += 1;
                state.current_task = None;
            }
            {
                let mut persisted = self.persisted.lock().await;
                persisted.active_task_ids.remove(&task.id);
                persisted.completed_task_ids.insert(task.id.clone());
                let _ = SessionStore::save(&self.project_dir, &mut persisted);
            }
            self.emit(EngineEvent::TaskCompleted {
                task_id: task.id.clone(),
            });
        } else if self.config.auto_commit {
            if let Some(sha) = self.maybe_auto_commit(task).await {
                result.commit_sha = Some(sha.clone());
                self.emit(EngineEvent::TaskAutoCommitted {
                    task_id: task.id.clone(),
                    commit_sha: sha,
                });
            }
        }

        Ok(completed)
    }

    async fn maybe_auto_commit(&self, task: &Task) -> Option<String> {
        let repo = git2::Repository::open(&self.project_dir).ok()?;
        let mut index = repo.index().ok()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None).ok()?;
        index.write().ok()?;
        let statuses = repo.statuses(None).ok()?;
        if statuses.is_empty() {
            return None;
        }

        let tree_id = index.write_tree().ok()?;
        let tree = repo.find_tree(tree_id).ok()?;
        let signature = repo
            .signature()
            .or_else(|_| git2::Signature::now("ralph-tui", "ralph-tui@localhost"))
            .ok()?;
        let parent = repo.head().ok()?.peel_to_commit().ok()?;
        let sha = repo
            .commit(
                Some("HEAD"),
                &signature,
                &signature,
                &format!("ralph-tui: progress on {}", task.title),
                &tree,
                &[&parent],
            )
            .ok()?;
        Some(sha.to_string())
    }

    async fn persist_iteration(&self, result: &IterationResult) {
        let session_id = self.persisted.lock().await.session_id.clone();
        let content = serde_json::to_string(result).unwrap_or_default() + "\n";
        if let Err(e) = self
            .log_sink
            .append(&session_id, result.iteration, &result.task.id, &content)
        {
            warn!(error = %e, "failed to append iteration log");
        }

        let mut state = self.state.write().await;
        state.iterations.push(result.clone());
        drop(state);

        let mut persisted = self.persisted.lock().await;
        persisted.current_iteration = result.iteration;
        if let Err(e) = SessionStore::save(&self.project_dir, &mut persisted) {
            warn!(error = %e, "failed to persist session state");
        }
    }

    /// Check `maxIterations`/all-complete termination conditions after a
    /// successful iteration, per spec.md §4.2 step 9.
    async fn check_termination(&self, task_completed: bool) -> ControlFlow {
        let state = self.state.read().await;
        if !state.can_continue() {
            return ControlFlow::Stop(StopReason::MaxIterations);
        }
        // Worker mode is pinned to exactly one task; its completion ends
        // this engine's run regardless of the tracker's *global* task
        // count, which `select_task` would otherwise re-check on the next
        // loop pass only to find the same task already `completed`.
        if task_completed && self.forced_task.is_some() {
            drop(state);
            self.emit(EngineEvent::AllComplete);
            return ControlFlow::Stop(StopReason::Completed);
        }
        if task_completed && state.tasks_completed >= state.total_tasks && state.total_tasks > 0 {
            drop(state);
            self.emit(EngineEvent::AllComplete);
            return ControlFlow::Stop(StopReason::Completed);
        }
        ControlFlow::Continue
    }
}

enum ControlFlow {
    Continue,
    Stop(StopReason),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::agent::mock::{MockAgentPlugin, ScriptedRun};
    use crate::plugins::tracker::mock::MockTrackerPlugin;
    use std::collections::{HashMap as Map, HashSet};

    fn task(id: &str, priority: i64) -> Task {
        Task {
            id: id.to_string(),
            title: format!("Task {id}"),
            status: TaskStatus::Open,
            priority,
            description: None,
            labels: vec![],
            r#type: None,
            assignee: None,
            parent_id: None,
            created_at: None,
            updated_at: None,
            metadata: Map::new(),
            depends_on: HashSet::new(),
            blocks: HashSet::new(),
        }
    }

    /// A tracker wrapper that flips a task to `completed` after one
    /// `update_task_status(in_progress)` call, simulating an agent that
    /// finishes its task in a single iteration.
    struct AutoCompletingTracker {
        inner: MockTrackerPlugin,
    }

    #[async_trait::async_trait]
    impl TrackerPlugin for AutoCompletingTracker {
        async fn initialize(&self, options: serde_json::Value) -> Result<String, EngineError> {
            self.inner.initialize(options).await
        }

        async fn get_tasks(
            &self,
            filter: GetTasksFilter,
        ) -> Result<Vec<Task>, EngineError> {
            self.inner.get_tasks(filter).await
        }

        async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, EngineError> {
            self.inner.get_task(id).await
        }

        async fn update_task_status(
            &self,
            id: &TaskId,
            status: TaskStatus,
        ) -> Result<(), EngineError> {
            self.inner.update_task_status(id, status).await?;
            if status == TaskStatus::InProgress {
                self.inner.update_task_status(id, TaskStatus::Completed).await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn single_task_single_iteration_completes() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(AutoCompletingTracker {
            inner: MockTrackerPlugin::new(vec![task("t1", 0)]),
        });
        let agent = Arc::new(MockAgentPlugin::new(vec![ScriptedRun::default()]));
        let engine = ExecutionEngine::new(
            dir.path().to_path_buf(),
            "session-1".to_string(),
            tracker,
            vec![("primary".to_string(), agent)],
            EngineConfig::default(),
            None,
        );

        engine.initialize(InitializeOptions::default()).await.unwrap();
        let reason = engine.start().await.unwrap();
        assert_eq!(reason, StopReason::Completed);

        let state = engine.get_state().await;
        assert_eq!(state.tasks_completed, 1);
        assert_eq!(state.iterations.len(), 1);
    }

    #[tokio::test]
    async fn no_tasks_stops_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(MockTrackerPlugin::new(vec![]));
        let agent = Arc::new(MockAgentPlugin::new(vec![]));
        let engine = ExecutionEngine::new(
            dir.path().to_path_buf(),
            "session-1".to_string(),
            tracker,
            vec![("primary".to_string(), agent)],
            EngineConfig::default(),
            None,
        );

        engine.initialize(InitializeOptions::default()).await.unwrap();
        let reason = engine.start().await.unwrap();
        assert_eq!(reason, StopReason::NoTasks);
    }

    #[tokio::test]
    async fn starting_twice_errors() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(MockTrackerPlugin::new(vec![]));
        let agent = Arc::new(MockAgentPlugin::new(vec![]));
        let engine = ExecutionEngine::new(
            dir.path().to_path_buf(),
            "session-1".to_string(),
            tracker,
            vec![("primary".to_string(), agent)],
            EngineConfig::default(),
            None,
        );
        engine.initialize(InitializeOptions::default()).await.unwrap();
        engine.start().await.unwrap();
        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyStarted));
    }

    #[tokio::test]
    async fn add_and_remove_iterations_respects_floor() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(MockTrackerPlugin::new(vec![]));
        let agent = Arc::new(MockAgentPlugin::new(vec![]));
        let mut config = EngineConfig::default();
        config.max_iterations = 5;
        let engine = ExecutionEngine::new(
            dir.path().to_path_buf(),
            "session-1".to_string(),
            tracker,
            vec![("primary".to_string(), agent)],
            config,
            None,
        );

        assert!(engine.add_iterations(5).await);
        assert_eq!(engine.get_state().await.max_iterations, 10);

        assert!(!engine.remove_iterations(20).await);
        assert_eq!(engine.get_state().await.max_iterations, 1.max(engine.get_state().await.current_iteration));
    }

    /// S2: pause fires at the next loop boundary (after the in-flight
    /// iteration finishes), not mid-iteration; `resume()` unblocks it.
    #[tokio::test]
    async fn pause_blocks_then_resume_continues_loop() {
        let dir = tempfile::tempdir().unwrap();
        // Task never transitions to `completed` in the tracker, so the loop
        // keeps looping (and keeps finding no further open task) rather than
        // stopping via `all:complete` before we get a chance to pause.
        let tracker = Arc::new(MockTrackerPlugin::new(vec![task("t1", 0)]));
        let agent = Arc::new(MockAgentPlugin::new(vec![ScriptedRun::default()]));
        let mut config = EngineConfig::default();
        config.max_iterations = 5;
        let engine = Arc::new(ExecutionEngine::new(
            dir.path().to_path_buf(),
            "session-1".to_string(),
            tracker,
            vec![("primary".to_string(), agent)],
            config,
            None,
        ));
        engine.initialize(InitializeOptions::default()).await.unwrap();
        engine.pause();

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.start().await });

        let mut paused = false;
        for _ in 0..200 {
            if engine.get_state().await.status == EngineStatus::Paused {
                paused = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(paused, "engine never reached paused status");
        assert_eq!(engine.get_state().await.iterations.len(), 1);

        engine.resume();
        let reason = handle.await.unwrap().unwrap();
        // With no further open task (status is stuck at in_progress), the
        // resumed loop finds nothing to select and stops cleanly.
        assert_eq!(reason, StopReason::NoTasks);
    }

    /// S3: stopping mid-iteration interrupts the agent and records the
    /// iteration as `failed`+`interrupted`.
    #[tokio::test]
    async fn stop_mid_iteration_interrupts_and_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(MockTrackerPlugin::new(vec![task("t1", 0)]));
        let agent = Arc::new(MockAgentPlugin::new(vec![ScriptedRun {
            stdout: "working".to_string(),
            exit_code: Some(0),
            delay: std::time::Duration::from_millis(500),
        }]));
        let engine = Arc::new(ExecutionEngine::new(
            dir.path().to_path_buf(),
            "session-1".to_string(),
            tracker,
            vec![("primary".to_string(), agent)],
            EngineConfig::default(),
            None,
        ));
        engine.initialize(InitializeOptions::default()).await.unwrap();

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.start().await });

        let mut executing = false;
        for _ in 0..200 {
            if engine.get_state().await.status == EngineStatus::Executing {
                executing = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(executing, "engine never reached executing status");
        // Give `execute_once` a moment past the status flip to register the
        // in-flight execution id before we try to interrupt it.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        engine.stop().await;
        let reason = handle.await.unwrap().unwrap();
        assert_eq!(reason, StopReason::Interrupted);

        let state = engine.get_state().await;
        assert_eq!(state.iterations.len(), 1);
        let last = &state.iterations[0];
        assert_eq!(last.status, IterationStatus::Failed);
        assert!(last.agent_result.as_ref().unwrap().interrupted);
    }

    /// S5: a mid-stream rate-limit marker from the primary switches the
    /// current iteration onto the fallback without counting as a retry; once
    /// the primary's `retry_after` passes, the engine probes it again.
    #[tokio::test]
    async fn rate_limit_marker_fails_over_to_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(AutoCompletingTracker {
            inner: MockTrackerPlugin::new(vec![task("t1", 0)]),
        });
        let retry_after = Utc::now() + chrono::Duration::milliseconds(50);
        let primary = Arc::new(MockAgentPlugin::new(vec![ScriptedRun {
            stdout: format!("[[rate_limited retry_after={}]]\n", retry_after.to_rfc3339()),
            exit_code: Some(1),
            delay: std::time::Duration::from_millis(0),
        }]));
        let fallback = Arc::new(MockAgentPlugin::new(vec![ScriptedRun::default()]));
        let engine = ExecutionEngine::new(
            dir.path().to_path_buf(),
            "session-1".to_string(),
            tracker,
            vec![
                ("primary".to_string(), primary.clone()),
                ("fallback".to_string(), fallback.clone()),
            ],
            EngineConfig::default(),
            None,
        );

        engine.initialize(InitializeOptions::default()).await.unwrap();
        let mut events = engine.on();
        let reason = engine.start().await.unwrap();
        assert_eq!(reason, StopReason::Completed);

        assert_eq!(primary.executions(), 1);
        assert_eq!(fallback.executions(), 1);

        let mut saw_switch = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::AgentSwitched { reason, .. } = event {
                assert_eq!(reason, "fallback");
                saw_switch = true;
            }
        }
        assert!(saw_switch, "expected an agent:switched{{reason:\"fallback\"}} event");

        let state = engine.get_state().await;
        assert_eq!(state.iterations.len(), 1);
        assert_eq!(state.active_agent.as_ref().unwrap().plugin, "fallback");
    }
}
