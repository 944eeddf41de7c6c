//! Execution Agent
//!
//! The entity's acting half. Dequeues delegated commands one at a time and
//! drives each to completion through tool calls, direct responses, or the
//! legacy sandbox path. One task is in flight at any moment; the next
//! command stays queued until the active task reaches a terminal state.
//!
//! Task state machine: IDLE -> ACTIVE -> {CONTINUING}* -> COMPLETE|ABANDONED
//! -> IDLE. A failed step gets exactly one recovery round; a second failure
//! abandons the task. Failures never requeue the command.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::compressor::ContextReducer;
use crate::deliberation::{Command, CommandKind};
use crate::executor::{ExecutionOutcome, SandboxExecutor};
use crate::focus::{FocusModule, TaskPriority};
use crate::memory::MemoryStore;
use crate::prompts;
use crate::request::{parse_structured, Requester};
use crate::tools::ToolRegistry;

/// Recorded actions kept before the oldest is evicted
const MAX_ACTION_HISTORY: usize = 50;

/// Kind of a recorded action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    ToolCall,
    Response,
    /// Legacy sandbox code path
    Code,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolCall => "tool_call",
            Self::Response => "response",
            Self::Code => "code",
        }
    }
}

/// One requested tool invocation inside a tool_call action
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool: String,
    pub args: Map<String, Value>,
}

/// Validated action payload, parsed from the model's structured response.
/// Unknown action types fail at this boundary, not deep in execution logic.
#[derive(Debug, Clone)]
pub enum ActionPayload {
    ToolCall { calls: Vec<ToolInvocation> },
    Response { text: String },
    Code { code: String },
}

impl ActionPayload {
    /// Parse a structured response value into a payload.
    ///
    /// A missing `action_type` defaults to `response`; an unknown one is an
    /// error the caller treats as a local step failure.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let action_type = value
            .get("action_type")
            .and_then(Value::as_str)
            .unwrap_or("response");

        match action_type {
            "tool_call" => {
                let calls = value
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|entry| {
                                let tool = entry.get("tool")?.as_str()?.to_string();
                                let args = entry
                                    .get("args")
                                    .and_then(Value::as_object)
                                    .cloned()
                                    .unwrap_or_default();
                                Some(ToolInvocation { tool, args })
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                Ok(Self::ToolCall { calls })
            }
            "response" => Ok(Self::Response {
                text: value
                    .get("response")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "code" => Ok(Self::Code {
                code: value
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            other => Err(format!("unknown action type: {other}")),
        }
    }
}

/// A recorded unit of work. Immutable once pushed to the history ring.
#[derive(Debug, Clone)]
pub struct Action {
    pub kind: ActionKind,
    pub content: String,
    pub outcome: ExecutionOutcome,
    pub timestamp: DateTime<Utc>,
}

impl Action {
    fn new(kind: ActionKind, content: String, outcome: ExecutionOutcome) -> Self {
        Self {
            kind,
            content,
            outcome,
            timestamp: Utc::now(),
        }
    }

    pub fn success(&self) -> bool {
        self.outcome.success
    }

    pub fn error(&self) -> Option<&str> {
        self.outcome.error.as_deref()
    }
}

/// The task currently occupying the single active slot
struct ActiveTask {
    command: Command,
    /// Accumulated continuation context; empty on the first step
    context: String,
    /// Set once the one permitted recovery round has been spent
    recovery_used: bool,
}

impl ActiveTask {
    fn new(command: Command) -> Self {
        Self {
            command,
            context: String::new(),
            recovery_used: false,
        }
    }
}

type ActionObserver = Box<dyn Fn(&Action) + Send + Sync>;
type OutputCallback = Box<dyn Fn(&str) + Send + Sync>;

/// The execution half of the runtime
pub struct ExecutionAgent {
    requester: tokio::sync::Mutex<Requester>,
    memory: Arc<MemoryStore>,
    reducer: ContextReducer,
    tools: Arc<ToolRegistry>,
    executor: Arc<SandboxExecutor>,
    focus: Arc<FocusModule>,
    command_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Command>>,
    active: Mutex<Option<ActiveTask>>,
    history: Mutex<VecDeque<Action>>,
    on_action: Mutex<Option<ActionObserver>>,
    on_output: Mutex<Option<OutputCallback>>,
    running: AtomicBool,
}

impl ExecutionAgent {
    pub fn new(
        requester: Requester,
        memory: Arc<MemoryStore>,
        reducer: ContextReducer,
        tools: Arc<ToolRegistry>,
        executor: Arc<SandboxExecutor>,
        focus: Arc<FocusModule>,
        command_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            requester: tokio::sync::Mutex::new(requester),
            memory,
            reducer,
            tools,
            executor,
            focus,
            command_rx: tokio::sync::Mutex::new(command_rx),
            active: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            on_action: Mutex::new(None),
            on_output: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Register the output callback for user-facing messages.
    /// Invoked once per message, in emission order, never concurrently.
    pub fn set_output_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_output.lock() = Some(Box::new(callback));
    }

    /// Observe every recorded action (the orchestrator relays these)
    pub fn on_action(&self, observer: impl Fn(&Action) + Send + Sync + 'static) {
        *self.on_action.lock() = Some(Box::new(observer));
    }

    /// Snapshot of the bounded action history, oldest first
    pub fn get_action_history(&self) -> Vec<Action> {
        self.history.lock().iter().cloned().collect()
    }

    /// Whether a task currently occupies the active slot
    pub fn has_active_task(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Replace the system prompt (tool catalog rebuild)
    pub async fn set_system_prompt(&self, prompt: &str) {
        self.requester.lock().await.set_system_prompt(prompt);
    }

    /// Clear the action history and conversation history
    pub async fn clear_history(&self) {
        self.history.lock().clear();
        self.requester.lock().await.clear_history();
    }

    /// Request the loop to stop after its current wait
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the execution loop until `stop()`
    ///
    /// Event-driven: blocks on the command queue bounded by `interval`, so
    /// new commands are picked up immediately and stop requests are observed
    /// within one interval.
    pub async fn run_loop(self: Arc<Self>, interval: Duration) {
        self.running.store(true, Ordering::SeqCst);
        info!("Execution loop started ({}s tick)", interval.as_secs_f32());

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.clone().tick(interval).await {
                error!("Execution tick failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        info!("Execution loop stopped");
    }

    /// One tick: acquire a task if idle, then advance it by one step
    async fn tick(self: Arc<Self>, interval: Duration) -> anyhow::Result<()> {
        if !self.has_active_task() {
            let command = {
                let mut rx = self.command_rx.lock().await;
                match tokio::time::timeout(interval, rx.recv()).await {
                    Err(_) => return Ok(()), // quiet tick
                    Ok(None) => {
                        tokio::time::sleep(interval).await;
                        return Ok(());
                    }
                    Ok(Some(command)) => command,
                }
            };

            if command.kind == CommandKind::Focus {
                // Fire and forget: decomposition happens off the task slot
                let agent = Arc::clone(&self);
                tokio::spawn(async move { agent.handle_focus_command(command).await });
                return Ok(());
            }

            info!("New task: {}", prompts::preview(&command.content, 60));
            *self.active.lock() = Some(ActiveTask::new(command));
        }

        self.process_step().await;
        Ok(())
    }

    /// Advance the active task by one step
    async fn process_step(&self) {
        let (task_content, priority, continuation, recovery_used) = {
            let active = self.active.lock();
            let Some(task) = active.as_ref() else {
                return;
            };
            (
                task.command.content.clone(),
                task.command.priority,
                task.context.clone(),
                task.recovery_used,
            )
        };

        if task_content.is_empty() {
            warn!("Empty command content, dropping task");
            *self.active.lock() = None;
            return;
        }

        // First step grounds the prompt in memory; continuations carry the
        // accumulated step context instead and skip conversation history.
        let (prompt, include_history) = if continuation.is_empty() {
            let digest = self.memory.digest(&task_content, 5);
            let context = if digest.is_empty() {
                "no prior context".to_string()
            } else {
                digest
            };
            (
                prompts::action_prompt(&task_content, priority.as_str(), &context),
                true,
            )
        } else {
            (
                prompts::continuation_prompt(&continuation, "see context above"),
                false,
            )
        };

        let Some(payload) = self.think_payload(&prompt, &task_content, include_history).await
        else {
            self.abandon("unable to obtain a valid action");
            return;
        };

        let action = self.execute_payload(payload).await;
        let ended = action.outcome.task_ended;
        let succeeded = action.outcome.success;
        let summary = format!(
            "Previous action: {}\nResult: {}",
            action.content,
            if succeeded {
                prompts::preview(&action.outcome.output, 200)
            } else {
                format!("ERROR: {}", action.error().unwrap_or("unknown"))
            }
        );
        self.record_action(action);

        if ended {
            info!("Task completed: {}", prompts::preview(&task_content, 60));
            *self.active.lock() = None;
            return;
        }

        if succeeded {
            // CONTINUING: keep the task active with the new step context
            let mut active = self.active.lock();
            if let Some(task) = active.as_mut() {
                task.context.push_str(&summary);
                task.context.push('\n');
            }
            return;
        }

        // Step failed: one recovery round, then abandon
        if recovery_used {
            self.abandon("recovery step failed");
            return;
        }
        {
            let mut active = self.active.lock();
            if let Some(task) = active.as_mut() {
                task.recovery_used = true;
                task.context.push_str(&summary);
                task.context.push('\n');
            }
        }
        debug!("Step failed, attempting one recovery round");
    }

    /// Request a structured action, with one correction round-trip on
    /// malformed output. Returns None when no valid payload was obtained.
    async fn think_payload(
        &self,
        prompt: &str,
        task_content: &str,
        include_history: bool,
    ) -> Option<ActionPayload> {
        let mut requester = self.requester.lock().await;

        if self.reducer.needs_reduction(requester.history()) {
            let reduced = self.reducer.reduce(requester.history()).await;
            requester.set_history(reduced);
        }

        let response = match requester.think(prompt, None, include_history, true).await {
            Ok(response) => response,
            Err(e) => {
                error!("Execution thinking failed: {e}");
                return None;
            }
        };

        // An unknown action type is a local failure, not malformed JSON -
        // the correction round is reserved for output we could not parse.
        match parse_structured(&response).map(|value| ActionPayload::from_value(&value)) {
            Some(Ok(payload)) => return Some(payload),
            Some(Err(e)) => {
                warn!("{e}");
                return None;
            }
            None => {}
        }

        warn!("Malformed action response, requesting a correction");

        let correction = prompts::correction_prompt(&response, task_content);
        let corrected = match requester.think(&correction, None, false, true).await {
            Ok(corrected) => corrected,
            Err(e) => {
                error!("Correction round failed: {e}");
                return None;
            }
        };

        match parse_structured(&corrected).map(|value| ActionPayload::from_value(&value)) {
            Some(Ok(payload)) => {
                debug!("Correction round produced a valid action");
                Some(payload)
            }
            Some(Err(e)) => {
                warn!("{e}");
                None
            }
            None => {
                warn!("Correction round still malformed");
                None
            }
        }
    }

    /// Execute a validated payload and build the resulting action
    async fn execute_payload(&self, payload: ActionPayload) -> Action {
        match payload {
            ActionPayload::ToolCall { calls } => self.execute_tool_calls(calls),
            ActionPayload::Response { text } => {
                if !text.is_empty() {
                    self.emit_output(&text);
                }
                Action::new(
                    ActionKind::Response,
                    text.clone(),
                    ExecutionOutcome {
                        success: true,
                        task_ended: true,
                        user_messages: if text.is_empty() { vec![] } else { vec![text] },
                        output: String::new(),
                        error: None,
                    },
                )
            }
            ActionPayload::Code { code } => {
                let outcome = self.executor.execute_async(&code).await;
                for message in &outcome.user_messages {
                    self.emit_output(message);
                }
                Action::new(ActionKind::Code, code, outcome)
            }
        }
    }

    /// Run each requested tool invocation in order
    ///
    /// `{{result}}` placeholders in string arguments resolve to the previous
    /// invocation's output. The task ends only when at least one user-facing
    /// message was produced - silent tool work keeps the task alive.
    fn execute_tool_calls(&self, calls: Vec<ToolInvocation>) -> Action {
        let content = format!("Tool calls: {}", calls.len());
        let mut outputs: Vec<String> = Vec::new();
        let mut user_messages = Vec::new();
        let mut all_succeeded = true;
        let mut first_error = None;

        for invocation in calls {
            let mut args = invocation.args;
            if let Some(previous) = outputs.last() {
                substitute_result(&mut args, previous);
            }

            debug!("Calling tool: {}", invocation.tool);
            let result = self.tools.execute(&invocation.tool, &args);

            if result.success {
                if invocation.tool == "say_to_user" {
                    if let Some(text) = args.get("text").and_then(Value::as_str) {
                        user_messages.push(text.to_string());
                    }
                }
                outputs.push(result.output);
            } else {
                all_succeeded = false;
                if first_error.is_none() {
                    first_error = result.error.clone();
                }
                warn!(
                    "Tool {} failed: {}",
                    result.tool_name,
                    result.error.as_deref().unwrap_or("unknown")
                );
            }
        }

        for message in &user_messages {
            self.emit_output(message);
        }

        let outcome = ExecutionOutcome {
            success: all_succeeded,
            task_ended: !user_messages.is_empty(),
            user_messages,
            output: outputs.join("\n"),
            error: first_error,
        };

        Action::new(ActionKind::ToolCall, content, outcome)
    }

    /// Decompose a focus command into tracked steps (off the task slot)
    async fn handle_focus_command(&self, command: Command) {
        let priority = match command.priority {
            crate::deliberation::Priority::High => TaskPriority::High,
            crate::deliberation::Priority::Medium => TaskPriority::Medium,
            crate::deliberation::Priority::Low => TaskPriority::Low,
        };

        let title = prompts::preview(&command.content, 50);
        let task_id = self.focus.create_task(&title, &command.content, priority);

        let prompt = prompts::decomposition_prompt(&command.content);
        let response = {
            let mut requester = self.requester.lock().await;
            match requester.think(&prompt, None, false, true).await {
                Ok(response) => response,
                Err(e) => {
                    error!("Focus decomposition failed: {e}");
                    return;
                }
            }
        };

        let steps = parse_structured(&response)
            .and_then(|value| {
                value.get("steps").and_then(Value::as_array).map(|entries| {
                    entries
                        .iter()
                        .filter_map(|entry| {
                            let id = entry.get("id")?.as_str()?.to_string();
                            let description = entry.get("description")?.as_str()?.to_string();
                            Some((id, description))
                        })
                        .collect::<Vec<_>>()
                })
            })
            .unwrap_or_default();

        if steps.is_empty() {
            warn!("Focus task produced no usable steps");
            return;
        }

        let count = steps.len();
        self.focus.decompose(&task_id, steps);
        self.focus.start_task(&task_id);
        info!("Focus task created with {count} steps");
    }

    /// Record an action to the bounded ring and notify the observer
    fn record_action(&self, action: Action) {
        {
            let mut history = self.history.lock();
            history.push_back(action.clone());
            while history.len() > MAX_ACTION_HISTORY {
                history.pop_front();
            }
        }

        if let Some(observer) = self.on_action.lock().as_ref() {
            observer(&action);
        }
    }

    /// Clear the active task after an unrecoverable failure
    fn abandon(&self, reason: &str) {
        error!("Task abandoned: {reason}");
        *self.active.lock() = None;
    }

    fn emit_output(&self, text: &str) {
        if let Some(callback) = self.on_output.lock().as_ref() {
            callback(text);
        }
    }
}

/// Replace `{{result}}` in string arguments with the previous tool output
fn substitute_result(args: &mut Map<String, Value>, previous: &str) {
    for value in args.values_mut() {
        if let Value::String(s) = value {
            if s.contains("{{result}}") {
                *value = Value::String(s.replace("{{result}}", previous));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::deliberation::Priority;
    use crate::llm::testing::ScriptedProvider;
    use serde_json::json;

    struct Fixture {
        agent: Arc<ExecutionAgent>,
        command_tx: mpsc::UnboundedSender<Command>,
        outputs: Arc<Mutex<Vec<String>>>,
        _workspace: tempfile::TempDir,
        _sandbox: tempfile::TempDir,
    }

    fn fixture(responses: Vec<&str>) -> Fixture {
        let provider = Arc::new(ScriptedProvider::new(responses));
        let requester = Requester::new(provider.clone(), AgentConfig::default());
        let memory = Arc::new(MemoryStore::open_in_memory().unwrap());
        let reducer = ContextReducer::new(provider, Some(100_000), 0.8);

        let workspace = tempfile::tempdir().unwrap();
        let sandbox = tempfile::tempdir().unwrap();
        let tools = Arc::new(ToolRegistry::new(workspace.path()));
        let executor = Arc::new(SandboxExecutor::new(sandbox.path(), false).unwrap());
        let focus = Arc::new(FocusModule::new());

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let agent = Arc::new(ExecutionAgent::new(
            requester, memory, reducer, tools, executor, focus, command_rx,
        ));

        let outputs = Arc::new(Mutex::new(Vec::new()));
        let sink = outputs.clone();
        agent.set_output_callback(move |text| sink.lock().push(text.to_string()));

        Fixture {
            agent,
            command_tx,
            outputs,
            _workspace: workspace,
            _sandbox: sandbox,
        }
    }

    fn delegate(content: &str) -> Command {
        Command {
            kind: CommandKind::Delegate,
            content: content.to_string(),
            priority: Priority::Medium,
        }
    }

    async fn run_ticks(fixture: &Fixture, n: usize) {
        for _ in 0..n {
            fixture
                .agent
                .clone()
                .tick(Duration::from_millis(20))
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_payload_parsing_variants() {
        let tool_call = json!({
            "action_type": "tool_call",
            "tool_calls": [{"tool": "get_time", "args": {}}]
        });
        assert!(matches!(
            ActionPayload::from_value(&tool_call).unwrap(),
            ActionPayload::ToolCall { .. }
        ));

        let response = json!({"action_type": "response", "response": "hi"});
        assert!(matches!(
            ActionPayload::from_value(&response).unwrap(),
            ActionPayload::Response { .. }
        ));

        // Missing action_type defaults to response
        let bare = json!({"response": "hi"});
        assert!(ActionPayload::from_value(&bare).is_ok());

        let unknown = json!({"action_type": "teleport"});
        assert!(ActionPayload::from_value(&unknown).is_err());
    }

    #[tokio::test]
    async fn test_response_action_ends_task() {
        let fixture = fixture(vec![r#"{"action_type": "response", "response": "hello!"}"#]);

        fixture.command_tx.send(delegate("greet the user")).unwrap();
        run_ticks(&fixture, 2).await;

        assert!(!fixture.agent.has_active_task());
        assert_eq!(fixture.outputs.lock().as_slice(), ["hello!".to_string()]);

        let history = fixture.agent.get_action_history();
        assert_eq!(history.len(), 1);
        assert!(history[0].outcome.task_ended);
    }

    #[tokio::test]
    async fn test_silent_tool_calls_continue_until_user_message() {
        // Step 1: silent tool work (no say_to_user) - must NOT end the task.
        // Step 2: says something - ends the task.
        let fixture = fixture(vec![
            r#"{"action_type": "tool_call", "tool_calls": [{"tool": "get_time", "args": {}}]}"#,
            r#"{"action_type": "tool_call", "tool_calls": [{"tool": "say_to_user", "args": {"text": "done"}}]}"#,
        ]);

        fixture.command_tx.send(delegate("check the clock")).unwrap();

        run_ticks(&fixture, 1).await;
        // First tick dequeues and runs the silent step: still active
        assert!(fixture.agent.has_active_task());
        let history = fixture.agent.get_action_history();
        assert_eq!(history.len(), 1);
        assert!(!history[0].outcome.task_ended);
        assert!(fixture.outputs.lock().is_empty());

        run_ticks(&fixture, 1).await;
        assert!(!fixture.agent.has_active_task());
        assert_eq!(fixture.outputs.lock().as_slice(), ["done".to_string()]);
    }

    #[tokio::test]
    async fn test_result_placeholder_substitution() {
        let fixture = fixture(vec![
            r#"{"action_type": "tool_call", "tool_calls": [
                {"tool": "get_time", "args": {}},
                {"tool": "say_to_user", "args": {"text": "the time is {{result}}"}}
            ]}"#,
        ]);

        fixture.command_tx.send(delegate("tell the time")).unwrap();
        run_ticks(&fixture, 2).await;

        let outputs = fixture.outputs.lock();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].starts_with("the time is "));
        assert!(!outputs[0].contains("{{result}}"));
    }

    #[tokio::test]
    async fn test_failure_gets_one_recovery_then_abandon() {
        // Both steps call a missing tool; after the failed recovery the task
        // is abandoned, not retried again.
        let failing = r#"{"action_type": "tool_call", "tool_calls": [{"tool": "nope", "args": {}}]}"#;
        let fixture = fixture(vec![failing, failing, failing]);

        fixture.command_tx.send(delegate("break things")).unwrap();

        run_ticks(&fixture, 1).await;
        // First failure recorded, recovery pending
        assert!(fixture.agent.has_active_task());

        run_ticks(&fixture, 1).await;
        // Recovery also failed: abandoned
        assert!(!fixture.agent.has_active_task());

        let history = fixture.agent.get_action_history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|a| !a.success()));
    }

    #[tokio::test]
    async fn test_recovery_step_can_complete_task() {
        let fixture = fixture(vec![
            r#"{"action_type": "tool_call", "tool_calls": [{"tool": "nope", "args": {}}]}"#,
            r#"{"action_type": "response", "response": "recovered"}"#,
        ]);

        fixture.command_tx.send(delegate("wobble")).unwrap();
        run_ticks(&fixture, 2).await;

        assert!(!fixture.agent.has_active_task());
        assert_eq!(fixture.outputs.lock().as_slice(), ["recovered".to_string()]);
    }

    #[tokio::test]
    async fn test_correction_round_trip_fixes_malformed_output() {
        let fixture = fixture(vec![
            "not json at all",
            r#"{"action_type": "response", "response": "fixed"}"#,
        ]);

        fixture.command_tx.send(delegate("say something")).unwrap();
        run_ticks(&fixture, 1).await;

        assert!(!fixture.agent.has_active_task());
        assert_eq!(fixture.outputs.lock().as_slice(), ["fixed".to_string()]);
    }

    #[tokio::test]
    async fn test_unparseable_after_correction_abandons() {
        let fixture = fixture(vec!["garbage", "still garbage"]);

        fixture.command_tx.send(delegate("hopeless")).unwrap();
        run_ticks(&fixture, 1).await;

        assert!(!fixture.agent.has_active_task());
        assert!(fixture.agent.get_action_history().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_type_abandons_without_correction() {
        let fixture = fixture(vec![r#"{"action_type": "teleport", "destination": "mars"}"#]);

        fixture.command_tx.send(delegate("impossible")).unwrap();
        run_ticks(&fixture, 1).await;

        // Abandoned directly - no correction round was spent on it
        assert!(!fixture.agent.has_active_task());
        assert!(fixture.agent.get_action_history().is_empty());
    }

    #[tokio::test]
    async fn test_code_action_flows_through_executor() {
        let fixture = fixture(vec![
            r#"{"action_type": "code", "code": "echo '::say ran in sandbox'"}"#,
        ]);

        fixture.command_tx.send(delegate("run a snippet")).unwrap();
        run_ticks(&fixture, 2).await;

        assert!(!fixture.agent.has_active_task());
        assert_eq!(
            fixture.outputs.lock().as_slice(),
            ["ran in sandbox".to_string()]
        );

        let history = fixture.agent.get_action_history();
        assert_eq!(history[0].kind, ActionKind::Code);
        assert!(history[0].outcome.task_ended);
    }

    #[tokio::test]
    async fn test_focus_command_frees_slot_immediately() {
        let fixture = fixture(vec![
            r#"{"steps": [{"id": "s1", "description": "first"}, {"id": "s2", "description": "second"}]}"#,
        ]);

        fixture
            .command_tx
            .send(Command {
                kind: CommandKind::Focus,
                content: "big multi step project".to_string(),
                priority: Priority::High,
            })
            .unwrap();

        run_ticks(&fixture, 1).await;
        assert!(!fixture.agent.has_active_task());

        // Let the spawned decomposition finish
        tokio::time::sleep(Duration::from_millis(50)).await;

        let active = fixture.agent.focus.active_tasks();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].steps.len(), 2);
    }

    #[tokio::test]
    async fn test_action_history_ring_bounded() {
        let mut responses = Vec::new();
        for _ in 0..60 {
            responses.push(r#"{"action_type": "response", "response": "ok"}"#);
        }
        let fixture = fixture(responses);

        for i in 0..60 {
            fixture.command_tx.send(delegate(&format!("task {i}"))).unwrap();
        }
        run_ticks(&fixture, 60).await;

        assert_eq!(fixture.agent.get_action_history().len(), MAX_ACTION_HISTORY);
    }

    #[tokio::test]
    async fn test_on_action_observer_notified() {
        let fixture = fixture(vec![r#"{"action_type": "response", "response": "hi"}"#]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        fixture.agent.on_action(move |action| sink.lock().push(action.kind));

        fixture.command_tx.send(delegate("wave")).unwrap();
        run_ticks(&fixture, 2).await;

        assert_eq!(seen.lock().as_slice(), [ActionKind::Response]);
    }
}
