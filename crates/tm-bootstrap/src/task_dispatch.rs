// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Subagent task dispatcher — runs a batch of focused tasks against an agent
//! persona, each in its own in-process sub-session, and aggregates results.
//!
//! Lives in `tm-bootstrap` for the same reason [`crate::task_tool::TaskTool`]
//! does: it needs `build_tool_registry` and would create a circular
//! dependency if it lived in `tm-core`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

use tm_config::{AgentConfig, AgentMode, Config};
use tm_core::{Agent, AgentEvent, AgentRuntimeContext};
use tm_runtime::AgentInfo;
use tm_tools::{
    events::TodoItem,
    SubmitResultTool, SubmittedResult,
    ToolRegistry,
};

use crate::context::ToolSetProfile;
use crate::registry::build_tool_registry;

/// Depth past which a worker's own tool set can no longer include anything
/// capable of spawning further children. Workers always run with
/// [`ToolSetProfile::SubAgent`], which never registers `task` or
/// `dispatch_tasks`, so in practice this limit is enforced structurally —
/// this constant documents and asserts that decision rather than policing it.
const MAX_DISPATCH_DEPTH: usize = 3;

// ─── Data model (SPEC §3.2) ──────────────────────────────────────────────────

/// Which child agent names a spawned worker may itself spawn, if anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnPolicy {
    All,
    None,
    List(Vec<String>),
}

impl SpawnPolicy {
    fn allows(&self, name: &str) -> bool {
        match self {
            SpawnPolicy::All => true,
            SpawnPolicy::None => false,
            SpawnPolicy::List(names) => names.iter().any(|n| n.eq_ignore_ascii_case(name)),
        }
    }
}

/// A named persona a task batch can be dispatched against.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub allowed_tools: Option<Vec<String>>,
    pub spawnable_children: SpawnPolicy,
    pub preferred_model: Option<String>,
    pub thinking_level: Option<String>,
    pub output_schema: Option<Value>,
}

impl AgentDefinition {
    /// Build a dispatcher persona from a discovered `AGENTS.md`-style
    /// subagent. Fields `AgentInfo` doesn't carry get conservative defaults:
    /// no spawn rights, no tool allowlist narrowing, no output schema.
    pub fn from_agent_info(info: &AgentInfo) -> Self {
        Self {
            name: info.name.clone(),
            description: info.description.clone(),
            system_prompt: info.content.clone(),
            allowed_tools: None,
            spawnable_children: SpawnPolicy::None,
            preferred_model: info.model.clone().filter(|m| m != "inherit"),
            thinking_level: None,
            output_schema: None,
        }
    }
}

/// One unit of work within a batch.
///
/// Field names follow the wire contract of §6.1 (`skills`, not
/// `requested_skills`) so `TaskBatch` deserializes directly from the
/// `dispatch_tasks` tool call arguments and from `run-batch` JSON/YAML files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: String,
    pub description: String,
    pub assignment: String,
    #[serde(default, rename = "skills")]
    pub requested_skills: Vec<String>,
}

/// A set of tasks dispatched together against the same agent persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBatch {
    #[serde(rename = "agent")]
    pub agent_name: String,
    #[serde(default, rename = "context")]
    pub shared_context: Option<String>,
    #[serde(default)]
    pub isolated: bool,
    #[serde(default, rename = "schema")]
    pub output_schema: Option<Value>,
    pub tasks: Vec<TaskItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

/// Live, coalesced state for a single in-flight task.
#[derive(Debug, Clone, Serialize)]
pub struct SubagentProgress {
    pub index: usize,
    pub id: String,
    pub status: TaskStatus,
    pub tool_count: usize,
    pub tokens: u64,
    pub current_tool: Option<String>,
    pub current_tool_args: Option<Value>,
    pub current_tool_start_ms: Option<u64>,
    pub recent_tools: VecDeque<String>,
    pub recent_output: VecDeque<String>,
    pub extracted_tool_data: std::collections::HashMap<String, Vec<Value>>,
}

impl SubagentProgress {
    fn new(index: usize, id: String) -> Self {
        Self {
            index,
            id,
            status: TaskStatus::Pending,
            tool_count: 0,
            tokens: 0,
            current_tool: None,
            current_tool_args: None,
            current_tool_start_ms: None,
            recent_tools: VecDeque::with_capacity(5),
            recent_output: VecDeque::with_capacity(8),
            extracted_tool_data: std::collections::HashMap::new(),
        }
    }

    fn push_tool(&mut self, name: String) {
        if self.recent_tools.len() == 5 {
            self.recent_tools.pop_front();
        }
        self.recent_tools.push_back(name);
    }

    fn push_output_line(&mut self, line: String) {
        if line.is_empty() {
            return;
        }
        if self.recent_output.len() == 8 {
            self.recent_output.pop_front();
        }
        self.recent_output.push_back(line);
    }
}

/// Terminal state for a single task.
#[derive(Debug, Clone, Serialize)]
pub struct SingleResult {
    pub index: usize,
    pub id: String,
    pub agent: String,
    pub exit_code: i32,
    pub output: String,
    pub stderr: String,
    pub truncated: bool,
    pub duration_ms: u64,
    pub tokens: u64,
    pub usage: Option<UsageTotals>,
    pub output_path: Option<PathBuf>,
    pub patch_path: Option<PathBuf>,
    pub extracted_tool_data: Option<std::collections::HashMap<String, Vec<Value>>>,
    pub aborted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    pub total: f64,
}

/// Additive token/cost accounting across a batch.
///
/// There is no pricing catalog anywhere in this workspace, so `cost` is
/// always zero — a declared simplification, not an omission (see DESIGN.md).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total_tokens: u64,
    pub cost: Cost,
}

impl std::ops::AddAssign<&UsageTotals> for UsageTotals {
    fn add_assign(&mut self, rhs: &UsageTotals) {
        self.input += rhs.input;
        self.output += rhs.output;
        self.cache_read += rhs.cache_read;
        self.cache_write += rhs.cache_write;
        self.total_tokens += rhs.total_tokens;
    }
}

pub struct BatchDetails {
    pub results: Vec<SingleResult>,
    pub totals: UsageTotals,
    pub progress_snapshots: Vec<SubagentProgress>,
}

pub type BatchOutcome = (String, BatchDetails);

// ─── Dispatcher ──────────────────────────────────────────────────────────────

/// Everything `execute` needs that isn't carried on the batch itself.
pub struct DispatchContext {
    pub config: Arc<Config>,
    pub model: Arc<dyn tm_model::ModelProvider>,
    pub runtime: AgentRuntimeContext,
    /// Agent personas known to the parent session.
    pub agents: Vec<AgentDefinition>,
    /// Comma-separated whitelist the parent declared for child spawns
    /// (`""` = deny all, `"*"` = allow all).
    pub spawn_whitelist: String,
    /// Shared depth counter, the same one `TaskTool` increments, so the two
    /// dispatch mechanisms agree on nesting depth.
    pub depth: Arc<AtomicUsize>,
}

/// Caller-supplied cancellation handle for an entire batch.
#[derive(Clone)]
pub struct BatchSignal {
    inner: Arc<tokio::sync::Notify>,
    tripped: Arc<std::sync::atomic::AtomicBool>,
}

impl BatchSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(tokio::sync::Notify::new()),
            tripped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn trip(&self) {
        self.tripped.store(true, Ordering::SeqCst);
        self.inner.notify_waiters();
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        if self.is_tripped() {
            return;
        }
        self.inner.notified().await;
    }
}

impl Default for BatchSignal {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_allowed(whitelist: &str, name: &str) -> bool {
    let whitelist = whitelist.trim();
    if whitelist == "*" {
        return true;
    }
    if whitelist.is_empty() {
        return false;
    }
    whitelist.split(',').any(|n| n.trim().eq_ignore_ascii_case(name))
}

/// Run admission checks and, if they pass, execute the batch.
///
/// On an admission failure this returns `Ok` with a single synthetic failed
/// result carrying the error text — per §6.1, validation errors are reported
/// results, not `Err`.
pub async fn execute(
    batch: TaskBatch,
    signal: BatchSignal,
    ctx: &DispatchContext,
) -> anyhow::Result<BatchOutcome> {
    if let Err(reason) = admit(&batch, ctx) {
        let result = SingleResult {
            index: 0,
            id: String::new(),
            agent: batch.agent_name.clone(),
            exit_code: 2,
            output: String::new(),
            stderr: reason.clone(),
            truncated: false,
            duration_ms: 0,
            tokens: 0,
            usage: None,
            output_path: None,
            patch_path: None,
            extracted_tool_data: None,
            aborted: false,
        };
        return Ok((
            format!("batch rejected: {reason}"),
            BatchDetails { results: vec![result], totals: UsageTotals::default(), progress_snapshots: vec![] },
        ));
    }

    let agent_def = ctx
        .agents
        .iter()
        .find(|a| a.name == batch.agent_name)
        .expect("admit() already verified the agent exists")
        .clone();

    let batch_span = info_span!("task_batch", agent = %batch.agent_name, tasks = batch.tasks.len());

    let baseline = if batch.isolated {
        Some(capture_git_baseline(&ctx.runtime).await?)
    } else {
        None
    };

    let max_concurrency = ctx.config.task.max_concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(max_concurrency));

    ctx.depth.fetch_add(1, Ordering::Relaxed);
    let depth_guard = scopeguard(ctx.depth.clone());

    let mut handles = Vec::with_capacity(batch.tasks.len());
    for (index, task) in batch.tasks.iter().cloned().enumerate() {
        let permit_sem = semaphore.clone();
        let ctx_config = ctx.config.clone();
        let ctx_model = ctx.model.clone();
        let ctx_runtime = ctx.runtime.clone();
        let agent_def = agent_def.clone();
        let shared_context = batch.shared_context.clone();
        let output_schema = batch.output_schema.clone().or_else(|| agent_def.output_schema.clone());
        let isolated_root = baseline.clone().filter(|_| batch.isolated);
        let signal = signal.clone();
        let span = info_span!(parent: &batch_span, "task", id = %task.id, index);

        let handle = tokio::spawn(
            async move {
                if signal.is_tripped() {
                    return placeholder_result(index, &task.id, &agent_def.name, "Skipped (cancelled before start)");
                }
                let _permit = tokio::select! {
                    p = permit_sem.acquire_owned() => match p {
                        Ok(p) => p,
                        Err(_) => return placeholder_result(index, &task.id, &agent_def.name, "Skipped (semaphore closed)"),
                    },
                    _ = signal.wait() => {
                        return placeholder_result(index, &task.id, &agent_def.name, "Skipped (cancelled before start)");
                    }
                };
                run_one_task(
                    index,
                    task,
                    agent_def,
                    shared_context,
                    output_schema,
                    isolated_root,
                    ctx_config,
                    ctx_model,
                    ctx_runtime,
                    signal,
                )
                .await
            }
            .instrument(span),
        );
        handles.push(handle);
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!(error = %e, "subagent task worker panicked");
                results.push(SingleResult {
                    index: results.len(),
                    id: String::new(),
                    agent: batch.agent_name.clone(),
                    exit_code: 1,
                    output: String::new(),
                    stderr: format!("worker task panicked: {e}"),
                    truncated: false,
                    duration_ms: 0,
                    tokens: 0,
                    usage: None,
                    output_path: None,
                    patch_path: None,
                    extracted_tool_data: None,
                    aborted: true,
                });
            }
        }
    }
    drop(depth_guard);

    if let Some(root) = baseline.filter(|_| batch.isolated) {
        reconcile_patches(&root, &results).await;
    }

    let mut totals = UsageTotals::default();
    for r in &results {
        if let Some(u) = &r.usage {
            totals += u;
        }
    }

    let completed = results.iter().filter(|r| !r.aborted && r.exit_code == 0).count();
    let summary = format!(
        "{completed}/{} tasks completed for agent '{}'",
        results.len(),
        batch.agent_name
    );

    Ok((
        summary,
        BatchDetails { results, totals, progress_snapshots: vec![] },
    ))
}

/// RAII depth decrement, since `?`-early-returns happen above this point too.
fn scopeguard(depth: Arc<AtomicUsize>) -> impl Drop {
    struct Guard(Arc<AtomicUsize>);
    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::Relaxed);
        }
    }
    Guard(depth)
}

fn placeholder_result(index: usize, id: &str, agent: &str, reason: &str) -> SingleResult {
    SingleResult {
        index,
        id: id.to_string(),
        agent: agent.to_string(),
        exit_code: 1,
        output: String::new(),
        stderr: reason.to_string(),
        truncated: false,
        duration_ms: 0,
        tokens: 0,
        usage: None,
        output_path: None,
        patch_path: None,
        extracted_tool_data: None,
        aborted: true,
    }
}

// ─── Admission checks (§4.2) ─────────────────────────────────────────────────

fn admit(batch: &TaskBatch, ctx: &DispatchContext) -> Result<(), String> {
    // 1. Agent exists.
    let agent_def = ctx
        .agents
        .iter()
        .find(|a| a.name == batch.agent_name)
        .ok_or_else(|| format!("unknown agent '{}'", batch.agent_name))?;

    // 2. Spawn restriction.
    if !spawn_allowed(&ctx.spawn_whitelist, &batch.agent_name) {
        return Err(format!(
            "spawning agent '{}' is not permitted by this session's spawn whitelist",
            batch.agent_name
        ));
    }

    // 3. Self-recursion block.
    if let Some(blocked) = &ctx.config.task.blocked_agent {
        if blocked.eq_ignore_ascii_case(&batch.agent_name) {
            return Err(format!("agent '{}' is blocked from self-recursion", batch.agent_name));
        }
    }

    // 4. Task-list validity.
    if batch.tasks.is_empty() {
        return Err("task batch has no tasks".to_string());
    }
    let mut seen = std::collections::HashSet::new();
    for t in &batch.tasks {
        if t.id.trim().is_empty() {
            return Err("task id must not be empty".to_string());
        }
        if t.id.len() > 32 {
            return Err(format!("task id '{}' exceeds 32 characters", t.id));
        }
        if !seen.insert(t.id.to_lowercase()) {
            return Err(format!("duplicate task id '{}' (case-insensitive)", t.id));
        }
    }

    // 5. Recursion depth.
    if ctx.depth.load(Ordering::Relaxed) >= MAX_DISPATCH_DEPTH {
        return Err(format!("maximum dispatch depth ({MAX_DISPATCH_DEPTH}) reached"));
    }

    // 6. Isolated batches require a git repository.
    if batch.isolated && ctx.runtime.project_root.is_none() {
        return Err("isolated batches require a project root under git".to_string());
    }

    // 7. Requested skills must exist.
    let known_skills = ctx.runtime.skills.get();
    for t in &batch.tasks {
        for skill in &t.requested_skills {
            if !known_skills.iter().any(|s| &s.command == skill) {
                return Err(format!("task '{}' requests unknown skill '{}'", t.id, skill));
            }
        }
    }

    let _ = agent_def;
    Ok(())
}

// ─── Isolated mode (§4.2, §5) ────────────────────────────────────────────────

#[derive(Clone)]
struct GitBaseline {
    repo_root: PathBuf,
}

async fn capture_git_baseline(runtime: &AgentRuntimeContext) -> anyhow::Result<GitBaseline> {
    let root = runtime
        .project_root
        .clone()
        .ok_or_else(|| anyhow::anyhow!("isolated mode requires a project root"))?;
    Ok(GitBaseline { repo_root: root })
}

/// Run `git diff` inside a worker's own checkout and return it as a patch, if
/// non-empty. Workers are told (via their system prompt) to do their edits
/// under the repo root directly; true per-worker worktree sandboxing would
/// require plumbing a per-call cwd through every file-editing tool, which
/// this workspace's tools don't currently support — see DESIGN.md.
async fn capture_worker_patch(repo_root: &PathBuf) -> Option<String> {
    let root = repo_root.clone();
    let output = tokio::task::spawn_blocking(move || {
        std::process::Command::new("git")
            .args(["diff", "--no-color"])
            .current_dir(&root)
            .output()
    })
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    let patch = String::from_utf8_lossy(&output.stdout).to_string();
    if patch.trim().is_empty() {
        None
    } else {
        Some(patch)
    }
}

async fn reconcile_patches(_baseline: &GitBaseline, results: &[SingleResult]) {
    let unreconciled: Vec<_> = results.iter().filter(|r| r.patch_path.is_some()).collect();
    if !unreconciled.is_empty() {
        debug!(count = unreconciled.len(), "isolated batch left patch artifacts for manual reconciliation");
    }
}

// ─── Per-task execution (§4.2) ───────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn run_one_task(
    index: usize,
    task: TaskItem,
    agent_def: AgentDefinition,
    shared_context: Option<String>,
    output_schema: Option<Value>,
    isolated_root: Option<GitBaseline>,
    config: Arc<Config>,
    model: Arc<dyn tm_model::ModelProvider>,
    runtime: AgentRuntimeContext,
    signal: BatchSignal,
) -> SingleResult {
    let started = Instant::now();

    let model = match &agent_def.preferred_model {
        Some(m) => match tm_model::from_config(&tm_model::resolve_model_from_config(
            &config_for_override(&config),
            m,
        )) {
            Ok(provider) => Arc::from(provider),
            Err(_) => model,
        },
        None => model,
    };

    let mut sub_config: AgentConfig = config.agent.clone();
    sub_config.system_prompt = Some(build_system_prompt(&agent_def, &task, shared_context.as_deref()));

    let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));
    let profile = ToolSetProfile::SubAgent { todos };
    let mode_lock = Arc::new(Mutex::new(AgentMode::Agent));
    let (tool_event_tx, tool_event_rx) = mpsc::channel(64);

    let mut tools = build_tool_registry(
        &config,
        model.clone(),
        profile,
        mode_lock.clone(),
        tool_event_tx,
        AgentRuntimeContext::default(),
    );
    if let Some(allowed) = &agent_def.allowed_tools {
        tools.retain_only(allowed);
    }
    let (submit_tool, captured) = SubmitResultTool::new(output_schema.clone());
    tools.register(submit_tool);
    let tools = Arc::new(tools);

    let mut agent = Agent::new(
        model,
        tools.clone(),
        Arc::new(sub_config),
        runtime,
        mode_lock,
        tool_event_rx,
        128_000,
    );

    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let mut progress = SubagentProgress::new(index, task.id.clone());
    progress.status = TaskStatus::Running;

    let (cancel_tx, cancel_rx) = oneshot::channel();
    let watcher_signal = signal.clone();
    tokio::spawn(async move {
        watcher_signal.wait().await;
        let _ = cancel_tx.send(());
    });

    let submit_fut = agent.submit_with_cancel(&task.assignment, tx, cancel_rx);
    tokio::pin!(submit_fut);

    let mut output_buf = String::new();
    let mut stderr_buf = String::new();
    let mut aborted = false;
    let mut last_usage: Option<UsageTotals> = None;

    let submit_result = loop {
        tokio::select! {
            biased;
            ev = rx.recv() => {
                match ev {
                    Some(event) => reduce_event(event, &mut progress, &mut output_buf, &mut last_usage),
                    None => {}
                }
            }
            res = &mut submit_fut => {
                while let Ok(event) = rx.try_recv() {
                    reduce_event(event, &mut progress, &mut output_buf, &mut last_usage);
                }
                break res;
            }
        }
    };

    if let Err(e) = submit_result {
        stderr_buf.push_str(&format!("agent error: {e}\n"));
    }

    // "submit result" contract: if the worker never called submit_result,
    // narrow its tools and give it up to `submit_result_reminders` chances.
    if captured.lock().await.is_none() {
        agent.set_tools(Arc::new({
            let mut only = ToolRegistry::new();
            let (tool, _h) = SubmitResultTool::new(output_schema.clone());
            only.register(tool);
            only
        }));
        let reminders = config.task.submit_result_reminders;
        for _ in 0..reminders {
            if captured.lock().await.is_some() {
                break;
            }
            let (tx2, mut rx2) = mpsc::channel::<AgentEvent>(128);
            let reminder = "You did not call `submit_result`. Call it now with your final output.";
            if agent.submit(reminder, tx2).await.is_err() {
                break;
            }
            while let Ok(event) = rx2.try_recv() {
                reduce_event(event, &mut progress, &mut output_buf, &mut last_usage);
            }
        }
    }

    let submitted = captured.lock().await.take();
    let (exit_code, final_output, final_stderr, reported_aborted) = finalize_output(
        submitted,
        output_buf,
        stderr_buf,
        output_schema.is_some(),
    );
    aborted = aborted || reported_aborted;

    let max_bytes = config.task.max_output_bytes;
    let max_lines = config.task.max_output_lines;
    let (preview, truncated) = truncate_preview(&final_output, max_bytes, max_lines);

    let patch_path = if let Some(root) = &isolated_root {
        capture_worker_patch(&root.repo_root).await.map(|_patch| {
            // Artifact persistence is handled by the caller (CLI / tool
            // wrapper); the dispatcher only reports that a patch exists.
            root.repo_root.join(format!("{}.patch", task.id))
        })
    } else {
        None
    };

    progress.status = if aborted {
        TaskStatus::Aborted
    } else if exit_code == 0 {
        TaskStatus::Completed
    } else {
        TaskStatus::Failed
    };

    SingleResult {
        index,
        id: task.id,
        agent: agent_def.name,
        exit_code,
        output: preview,
        stderr: final_stderr,
        truncated,
        duration_ms: started.elapsed().as_millis() as u64,
        tokens: last_usage.as_ref().map(|u| u.total_tokens).unwrap_or(0),
        usage: last_usage,
        output_path: None,
        patch_path,
        extracted_tool_data: if progress.extracted_tool_data.is_empty() {
            None
        } else {
            Some(progress.extracted_tool_data.clone())
        },
        aborted,
    }
}

/// `resolve_model_from_config` wants the full `Config` to check named
/// provider aliases; workers only ever override bare provider/model strings
/// so cloning here is cheap relative to the HTTP calls the turn will make.
fn config_for_override(config: &Config) -> Config {
    config.clone()
}

fn build_system_prompt(agent_def: &AgentDefinition, task: &TaskItem, shared_context: Option<&str>) -> String {
    let mut prompt = agent_def.system_prompt.clone();
    prompt.push_str("\n\n## Assigned task\n");
    prompt.push_str(&task.description);
    if let Some(ctx) = shared_context {
        prompt.push_str("\n\n## Shared context\n");
        prompt.push_str(ctx);
    }
    prompt.push_str(
        "\n\nWhen you are done, call `submit_result` exactly once with your final output. \
         Do not stop without calling it.",
    );
    prompt
}

fn reduce_event(
    event: AgentEvent,
    progress: &mut SubagentProgress,
    output_buf: &mut String,
    last_usage: &mut Option<UsageTotals>,
) {
    match event {
        AgentEvent::TextDelta(delta) => {
            output_buf.push_str(&delta);
            for line in delta.split('\n') {
                progress.push_output_line(line.to_string());
            }
        }
        AgentEvent::ToolCallStarted(call) => {
            progress.tool_count += 1;
            progress.current_tool = Some(call.name.clone());
            progress.current_tool_args = Some(call.args.clone());
            progress.current_tool_start_ms = Some(started_ms());
            progress.push_tool(call.name);
        }
        AgentEvent::ToolCallFinished { tool_name, .. } => {
            progress.current_tool = None;
            progress.current_tool_args = None;
            progress.current_tool_start_ms = None;
            let _ = tool_name;
        }
        AgentEvent::TokenUsage { input, output, cache_read, cache_write, .. } => {
            let usage = last_usage.get_or_insert_with(UsageTotals::default);
            usage.input = input as u64;
            usage.output = output as u64;
            usage.cache_read = cache_read as u64;
            usage.cache_write = cache_write as u64;
            usage.total_tokens = usage.input + usage.output;
            progress.tokens = usage.total_tokens;
        }
        _ => {}
    }
}

fn started_ms() -> u64 {
    // Coarse monotonic marker for "how long has the current tool call been
    // running" progress reporting; not wall-clock epoch time.
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Resolve the worker's terminal output per the "submit result" contract
/// (§4.2): a captured `submit_result` call wins; otherwise fall back to the
/// raw assistant text with a visible warning prepended.
fn finalize_output(
    submitted: Option<SubmittedResult>,
    raw_output: String,
    stderr: String,
    schema_enforced: bool,
) -> (i32, String, String, bool) {
    match submitted {
        Some(SubmittedResult { output, status, .. }) => {
            let aborted = status.as_deref() == Some("aborted");
            (0, output, stderr, aborted)
        }
        None => {
            let mut out = String::from("[warning] submit_result was not called; reporting raw assistant output.\n");
            out.push_str(&raw_output);
            let exit_code = if !raw_output.trim().is_empty() && !schema_enforced { 0 } else { 1 };
            (exit_code, out, stderr, false)
        }
    }
}

fn truncate_preview(text: &str, max_bytes: usize, max_lines: usize) -> (String, bool) {
    let mut truncated = false;
    let mut result = text.to_string();
    if result.len() > max_bytes {
        let mut cut = max_bytes.min(result.len());
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        if let Some(nl) = result[..cut].rfind('\n') {
            cut = nl;
        }
        result.truncate(cut);
        truncated = true;
    }
    let line_count = result.lines().count();
    if line_count > max_lines {
        result = result.lines().take(max_lines).collect::<Vec<_>>().join("\n");
        truncated = true;
    }
    (result, truncated)
}

// ─── DispatchTasksTool ───────────────────────────────────────────────────────

/// Exposes [`execute`] as a model-invocable tool alongside `task`, for
/// batches of focused sub-tasks run against a named agent persona.
pub struct DispatchTasksTool {
    model: Arc<dyn tm_model::ModelProvider>,
    config: Arc<Config>,
    runtime: AgentRuntimeContext,
    depth: Arc<AtomicUsize>,
    spawn_whitelist: String,
}

impl DispatchTasksTool {
    pub fn new(
        model: Arc<dyn tm_model::ModelProvider>,
        config: Arc<Config>,
        runtime: AgentRuntimeContext,
        depth: Arc<AtomicUsize>,
        spawn_whitelist: String,
    ) -> Self {
        Self { model, config, runtime, depth, spawn_whitelist }
    }

    fn known_agents(&self) -> Vec<AgentDefinition> {
        self.runtime
            .agents
            .get()
            .iter()
            .map(AgentDefinition::from_agent_info)
            .collect()
    }
}

#[async_trait::async_trait]
impl tm_tools::Tool for DispatchTasksTool {
    fn name(&self) -> &str {
        "dispatch_tasks"
    }

    fn description(&self) -> &str {
        "Run a batch of focused sub-tasks against a named agent persona, each in its own \
         sub-session, and return their aggregated results. Useful for fanning a large job out \
         across several independent workers."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "agent": { "type": "string", "description": "Name of the agent persona to run each task as" },
                "context": { "type": "string", "description": "Shared context prepended for every task" },
                "isolated": { "type": "boolean", "description": "Run each task in its own git worktree" },
                "schema": { "type": "object", "description": "JSON schema each task's structured result must match" },
                "tasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "description": { "type": "string" },
                            "assignment": { "type": "string" },
                            "skills": { "type": "array", "items": { "type": "string" } }
                        },
                        "required": ["id", "description", "assignment"]
                    }
                }
            },
            "required": ["agent", "tasks"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> tm_tools::ApprovalPolicy {
        tm_tools::ApprovalPolicy::Ask
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &tm_tools::ToolCall) -> tm_tools::ToolOutput {
        let batch: TaskBatch = match serde_json::from_value(call.args.clone()) {
            Ok(b) => b,
            Err(e) => return tm_tools::ToolOutput::err(&call.id, format!("invalid task batch: {e}")),
        };

        let ctx = DispatchContext {
            config: self.config.clone(),
            model: self.model.clone(),
            runtime: self.runtime.clone(),
            agents: self.known_agents(),
            spawn_whitelist: self.spawn_whitelist.clone(),
            depth: self.depth.clone(),
        };

        match execute(batch, BatchSignal::new(), &ctx).await {
            Ok((summary, details)) => {
                let json = serde_json::to_string_pretty(&details_as_value(&details))
                    .unwrap_or_else(|_| "{}".to_string());
                tm_tools::ToolOutput::ok(&call.id, format!("{summary}\n\n{json}"))
            }
            Err(e) => tm_tools::ToolOutput::err(&call.id, format!("dispatch failed: {e}")),
        }
    }
}

fn details_as_value(details: &BatchDetails) -> Value {
    serde_json::json!({
        "results": details.results,
        "totals": details.totals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agent() -> AgentDefinition {
        AgentDefinition {
            name: "reviewer".into(),
            description: "reviews code".into(),
            system_prompt: "You review code.".into(),
            allowed_tools: None,
            spawnable_children: SpawnPolicy::None,
            preferred_model: None,
            thinking_level: None,
            output_schema: None,
        }
    }

    fn sample_ctx(depth: usize) -> DispatchContext {
        DispatchContext {
            config: Arc::new(Config::default()),
            model: Arc::new(tm_model::MockProvider::default()),
            runtime: AgentRuntimeContext::default(),
            agents: vec![sample_agent()],
            spawn_whitelist: "*".into(),
            depth: Arc::new(AtomicUsize::new(depth)),
        }
    }

    fn batch_with(ids: &[&str]) -> TaskBatch {
        TaskBatch {
            agent_name: "reviewer".into(),
            shared_context: None,
            isolated: false,
            output_schema: None,
            tasks: ids
                .iter()
                .map(|id| TaskItem {
                    id: id.to_string(),
                    description: "do the thing".into(),
                    assignment: "do the thing".into(),
                    requested_skills: vec![],
                })
                .collect(),
        }
    }

    #[test]
    fn admit_rejects_unknown_agent() {
        let ctx = sample_ctx(0);
        let batch = TaskBatch { agent_name: "ghost".into(), ..batch_with(&["a"]) };
        assert!(admit(&batch, &ctx).unwrap_err().contains("unknown agent"));
    }

    #[test]
    fn admit_rejects_disallowed_spawn() {
        let mut ctx = sample_ctx(0);
        ctx.spawn_whitelist = "".into();
        let batch = batch_with(&["a"]);
        assert!(admit(&batch, &ctx).unwrap_err().contains("spawn whitelist"));
    }

    #[test]
    fn admit_rejects_self_recursion() {
        let mut ctx = sample_ctx(0);
        let mut cfg = (*ctx.config).clone();
        cfg.task.blocked_agent = Some("reviewer".into());
        ctx.config = Arc::new(cfg);
        let batch = batch_with(&["a"]);
        assert!(admit(&batch, &ctx).unwrap_err().contains("blocked"));
    }

    #[test]
    fn admit_rejects_empty_batch() {
        let ctx = sample_ctx(0);
        let batch = batch_with(&[]);
        assert!(admit(&batch, &ctx).unwrap_err().contains("no tasks"));
    }

    #[test]
    fn admit_rejects_duplicate_case_folded_ids() {
        let ctx = sample_ctx(0);
        let batch = batch_with(&["Foo", "foo"]);
        assert!(admit(&batch, &ctx).unwrap_err().contains("duplicate"));
    }

    #[test]
    fn admit_rejects_overlong_id() {
        let ctx = sample_ctx(0);
        let batch = batch_with(&["this-id-is-definitely-longer-than-32-chars"]);
        assert!(admit(&batch, &ctx).unwrap_err().contains("32 characters"));
    }

    #[test]
    fn admit_rejects_at_max_depth() {
        let ctx = sample_ctx(MAX_DISPATCH_DEPTH);
        let batch = batch_with(&["a"]);
        assert!(admit(&batch, &ctx).unwrap_err().contains("maximum dispatch depth"));
    }

    #[test]
    fn admit_rejects_isolated_without_project_root() {
        let ctx = sample_ctx(0);
        let batch = TaskBatch { isolated: true, ..batch_with(&["a"]) };
        assert!(admit(&batch, &ctx).unwrap_err().contains("project root"));
    }

    #[test]
    fn admit_rejects_unknown_skill() {
        let ctx = sample_ctx(0);
        let mut batch = batch_with(&["a"]);
        batch.tasks[0].requested_skills.push("nonexistent/skill".into());
        assert!(admit(&batch, &ctx).unwrap_err().contains("unknown skill"));
    }

    #[test]
    fn admit_accepts_well_formed_batch() {
        let ctx = sample_ctx(0);
        let batch = batch_with(&["a", "b"]);
        assert!(admit(&batch, &ctx).is_ok());
    }

    #[test]
    fn spawn_policy_list_is_case_insensitive() {
        let policy = SpawnPolicy::List(vec!["Reviewer".into()]);
        assert!(policy.allows("reviewer"));
        assert!(!policy.allows("other"));
    }

    #[test]
    fn truncate_preview_marks_oversized_text() {
        let text = "a".repeat(100);
        let (preview, truncated) = truncate_preview(&text, 10, 100);
        assert!(truncated);
        assert!(preview.len() <= 10);
    }

    #[test]
    fn truncate_preview_leaves_short_text_untouched() {
        let (preview, truncated) = truncate_preview("short", 100, 100);
        assert!(!truncated);
        assert_eq!(preview, "short");
    }

    #[test]
    fn finalize_output_prefers_submitted_result() {
        let submitted = SubmittedResult { output: "done".into(), status: None, data: None };
        let (code, out, _, aborted) = finalize_output(Some(submitted), "raw".into(), String::new(), false);
        assert_eq!(code, 0);
        assert_eq!(out, "done");
        assert!(!aborted);
    }

    #[test]
    fn finalize_output_marks_aborted_status() {
        let submitted = SubmittedResult { output: "gave up".into(), status: Some("aborted".into()), data: None };
        let (code, _, _, aborted) = finalize_output(Some(submitted), String::new(), String::new(), false);
        assert_eq!(code, 0);
        assert!(aborted);
    }

    #[test]
    fn finalize_output_falls_back_to_warning_on_missing_submission() {
        let (code, out, _, aborted) = finalize_output(None, "assistant text".into(), String::new(), false);
        assert_eq!(code, 0);
        assert!(out.contains("[warning]"));
        assert!(out.contains("assistant text"));
        assert!(!aborted);
    }

    #[test]
    fn finalize_output_nonzero_when_schema_enforced_and_missing() {
        let (code, _, _, _) = finalize_output(None, "text".into(), String::new(), true);
        assert_eq!(code, 1);
    }

    #[test]
    fn usage_totals_add_assign_is_additive() {
        let mut totals = UsageTotals::default();
        let a = UsageTotals { input: 10, output: 5, total_tokens: 15, ..Default::default() };
        let b = UsageTotals { input: 3, output: 2, total_tokens: 5, ..Default::default() };
        totals += &a;
        totals += &b;
        assert_eq!(totals.input, 13);
        assert_eq!(totals.total_tokens, 20);
    }

    #[test]
    fn batch_signal_trip_is_observed() {
        let signal = BatchSignal::new();
        assert!(!signal.is_tripped());
        signal.trip();
        assert!(signal.is_tripped());
    }
}
