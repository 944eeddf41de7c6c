//! Orchestrator
//!
//! Owns both agents and their shared collaborators, wires deliberation's
//! command queue into execution, relays execution outcomes back as
//! low-priority signals, and runs the two loops as cooperatively scheduled
//! tokio tasks.
//!
//! Information hiding is deliberate: deliberation sees what execution DID
//! (action type, result, preview), never its internal reasoning.

use anyhow::Result;
use futures_util::future::join;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::compressor::ContextReducer;
use crate::config::SystemParams;
use crate::deliberation::{DeliberationAgent, Priority, Signal, Thought};
use crate::execution::{Action, ExecutionAgent};
use crate::executor::SandboxExecutor;
use crate::focus::FocusModule;
use crate::llm::LlmProvider;
use crate::memory::MemoryStore;
use crate::prompts;
use crate::request::Requester;
use crate::tools::{Tool, ToolRegistry};

/// How long `stop()` waits for the loops before cancelling them
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Personality lines shorter than this are noise, not memories
const MIN_PERSONALITY_LINE: usize = 10;

type OutputCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Serialized fan-out to registered output callbacks. Holding the lock
/// through the calls keeps emissions ordered and non-overlapping.
struct OutputSink {
    callbacks: Mutex<Vec<OutputCallback>>,
}

impl OutputSink {
    fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, callback: OutputCallback) {
        self.callbacks.lock().push(callback);
    }

    fn emit(&self, text: &str) {
        for callback in self.callbacks.lock().iter() {
            callback(text);
        }
    }
}

/// The entity: two agents, shared memory, and an external signal API
pub struct Orchestrator {
    params: SystemParams,
    memory: Arc<MemoryStore>,
    tools: Arc<ToolRegistry>,
    executor: Arc<SandboxExecutor>,
    focus: Arc<FocusModule>,
    deliberation: Arc<DeliberationAgent>,
    execution: Arc<ExecutionAgent>,
    output: Arc<OutputSink>,
    personality_suffix: Mutex<Option<String>>,
    running: AtomicBool,
    loops: tokio::sync::Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Orchestrator {
    /// Build the entity around a provider.
    ///
    /// Construction validates `params` and fails on any out-of-range value.
    /// `personality` is bootstrapped into foundational memories and appended
    /// to both system prompts.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        params: SystemParams,
        personality: Option<&str>,
    ) -> Result<Self> {
        params.validate()?;

        let memory = Arc::new(MemoryStore::open(&params.memory_path)?);
        Self::with_memory(provider, params, personality, memory)
    }

    /// Build with an externally created memory store (tests use in-memory)
    pub fn with_memory(
        provider: Arc<dyn LlmProvider>,
        params: SystemParams,
        personality: Option<&str>,
        memory: Arc<MemoryStore>,
    ) -> Result<Self> {
        params.validate()?;

        let tools = Arc::new(ToolRegistry::new(&params.workspace_path));
        let executor = Arc::new(SandboxExecutor::new(&params.sandbox_path, params.unsafe_mode)?);
        let focus = Arc::new(FocusModule::new());

        // Personality is folded into both base prompts before the agents
        // are built, and its lines become foundational memories.
        let personality_suffix = personality.map(|text| {
            let mut saved = 0;
            for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if line.len() < MIN_PERSONALITY_LINE {
                    continue;
                }
                match memory.save(line, "personality", 0.9, "foundational") {
                    Ok(Some(_)) => saved += 1,
                    Ok(None) => {}
                    Err(e) => warn!("Personality memory save failed: {e}"),
                }
            }
            info!("Personality processed: {saved} foundational memories created");

            format!("\n\n## My personality and context:\n{text}")
        });

        let mut deliberation_prompt = prompts::DELIBERATION_SYSTEM_PROMPT.to_string();
        let mut execution_prompt = prompts::execution_system_prompt(&tools.describe());
        if let Some(suffix) = &personality_suffix {
            deliberation_prompt.push_str(suffix);
            execution_prompt.push_str(suffix);
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let mut deliberation_requester =
            Requester::new(provider.clone(), params.deliberation_config());
        deliberation_requester.set_system_prompt(deliberation_prompt);

        let mut execution_requester = Requester::new(provider.clone(), params.execution_config());
        execution_requester.set_system_prompt(execution_prompt);

        let deliberation = Arc::new(DeliberationAgent::new(
            deliberation_requester,
            memory.clone(),
            ContextReducer::new(
                provider.clone(),
                params.max_context_tokens,
                params.compression_threshold,
            ),
            command_tx,
        ));

        let execution = Arc::new(ExecutionAgent::new(
            execution_requester,
            memory.clone(),
            ContextReducer::new(
                provider,
                params.max_context_tokens,
                params.compression_threshold,
            ),
            tools.clone(),
            executor.clone(),
            focus.clone(),
            command_rx,
        ));

        let output = Arc::new(OutputSink::new());

        // User-facing messages flow through the shared sink
        let sink = output.clone();
        execution.set_output_callback(move |text| sink.emit(text));

        // Execution outcomes become low-priority signals for deliberation.
        // The report carries type/result/preview - not reasoning.
        let relay_target = deliberation.clone();
        execution.on_action(move |action| {
            let signal = Signal::new(action_report(action), "execution", Priority::Low);
            debug!("Relaying {} action to deliberation", action.kind.as_str());
            relay_target.receive_signal(signal);
        });

        Ok(Self {
            params,
            memory,
            tools,
            executor,
            focus,
            deliberation,
            execution,
            output,
            personality_suffix: Mutex::new(personality_suffix),
            running: AtomicBool::new(false),
            loops: tokio::sync::Mutex::new(None),
        })
    }

    /// Start both loops. Idempotent; runs a one-time retention sweep first.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Entity already running");
            return;
        }

        info!("Starting entity...");

        if let Err(e) = self.memory.sweep() {
            warn!("Retention sweep failed: {e}");
        }

        let deliberation_loop = tokio::spawn(
            self.deliberation
                .clone()
                .run_loop(self.params.deliberation_interval),
        );
        let execution_loop = tokio::spawn(
            self.execution
                .clone()
                .run_loop(self.params.execution_interval),
        );

        *self.loops.lock().await = Some((deliberation_loop, execution_loop));

        info!(
            "Entity started - deliberation: {:?}, execution: {:?}",
            self.params.deliberation_interval, self.params.execution_interval
        );
    }

    /// Stop both loops, bounded by a shutdown timeout with cancellation as
    /// the fallback, then flush memory. Idempotent; a no-op when not running.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping entity...");

        self.deliberation.stop();
        self.execution.stop();

        if let Some((deliberation_loop, execution_loop)) = self.loops.lock().await.take() {
            let abort_deliberation = deliberation_loop.abort_handle();
            let abort_execution = execution_loop.abort_handle();

            let joined = tokio::time::timeout(
                SHUTDOWN_TIMEOUT,
                join(deliberation_loop, execution_loop),
            )
            .await;

            if joined.is_err() {
                warn!("Loops did not stop in time, cancelling");
                abort_deliberation.abort();
                abort_execution.abort();
            }
        }

        if let Err(e) = self.memory.flush() {
            warn!("Memory flush failed: {e}");
        }

        info!("Entity stopped");
    }

    /// Feed external input into the entity. Dropped when not running.
    pub fn input_signal(&self, text: &str, source: &str) {
        if !self.running.load(Ordering::SeqCst) {
            warn!("Entity not running, signal ignored");
            return;
        }

        info!("Input signal from {source}: {}", prompts::preview(text, 50));
        self.deliberation.receive_input(text, source);
    }

    /// Register a callback for user-facing output
    pub fn on_output(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.output.push(Box::new(callback));
    }

    /// Observe deliberation thoughts (observability)
    pub fn on_thought(&self, observer: impl Fn(&Thought) + Send + Sync + 'static) {
        self.deliberation.on_thought(observer);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register a custom tool. Call `rebuild_prompts` afterwards so the
    /// execution agent sees the updated catalog.
    pub fn register_tool(&self, tool: Tool) {
        self.tools.register(tool);
    }

    /// Rebuild the execution system prompt from the current tool catalog
    pub async fn rebuild_prompts(&self) {
        let mut prompt = prompts::execution_system_prompt(&self.tools.describe());
        if let Some(suffix) = self.personality_suffix.lock().as_ref() {
            prompt.push_str(suffix);
        }
        self.execution.set_system_prompt(&prompt).await;

        info!("Rebuilt execution prompt with {} tools", self.tools.list().len());
    }

    /// Formatted tool catalog
    pub fn tool_catalog(&self) -> String {
        self.tools.describe()
    }

    /// Number of stored memories
    pub fn memory_count(&self) -> usize {
        self.memory.count().unwrap_or(0)
    }

    /// Search shared memory
    pub fn search_memory(
        &self,
        query: &str,
        max_results: usize,
    ) -> Vec<crate::memory::MemoryHit> {
        self.memory
            .search(query, 0.3, max_results)
            .unwrap_or_default()
    }

    /// Save directly to shared memory
    pub fn save_memory(&self, text: &str, source: &str) -> Option<String> {
        self.memory.save(text, source, 0.5, "general").ok().flatten()
    }

    /// Deliberation's rolling narrative context
    pub fn get_context(&self) -> Vec<String> {
        self.deliberation.get_context()
    }

    /// Execution's recorded action history
    pub fn get_action_history(&self) -> Vec<Action> {
        self.execution.get_action_history()
    }

    /// Clear all context, histories and sandbox files
    pub async fn clear_all(&self) {
        self.deliberation.clear_context();
        self.deliberation.clear_history().await;
        self.execution.clear_history().await;
        if let Err(e) = self.executor.clear() {
            warn!("Sandbox clear failed: {e}");
        }
    }

    /// Active focus tasks
    pub fn focus_tasks(&self) -> Vec<crate::focus::FocusTask> {
        self.focus.active_tasks()
    }
}

/// Build the relayed report for one action: type, content preview, result -
/// never the model's reasoning.
fn action_report(action: &Action) -> String {
    let result = if action.success() {
        let output = &action.outcome.output;
        if output.is_empty() {
            "ok".to_string()
        } else {
            format!("ok: {}", prompts::preview(output, 200))
        }
    } else {
        format!("error: {}", action.error().unwrap_or("unknown"))
    };

    let user_context = if action.outcome.user_messages.is_empty() {
        String::new()
    } else {
        format!(
            "\nTold the user: {}",
            prompts::preview(&action.outcome.user_messages.join("; "), 150)
        )
    };

    format!(
        "[execution report]\naction: {}\ncontent: {}\nresult: {result}{user_context}",
        action.kind.as_str(),
        prompts::preview(&action.content, 100),
    )
}
