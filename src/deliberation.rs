//! Deliberation Agent
//!
//! The entity's deciding half. Consumes signals (user input, relayed
//! execution reports), reflects over memory and its rolling narrative
//! context, and emits commands: remember something, delegate a task, focus
//! on a complex one, or wait.
//!
//! Signals are consumed in FIFO order, exactly once. A tick that fails to
//! parse the model's thought leaves the context untouched and moves on.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::compressor::ContextReducer;
use crate::memory::MemoryStore;
use crate::prompts::{self, FRESHNESS_WINDOW_SECS};
use crate::request::{parse_structured, Requester};

/// Narrative context entries kept before the oldest is evicted
const MAX_CONTEXT_ENTRIES: usize = 50;
/// Importance assigned to remembered facts
const REMEMBER_IMPORTANCE: f64 = 0.7;

/// Signal priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// An event delivered to the deliberation agent
#[derive(Debug, Clone)]
pub struct Signal {
    pub content: String,
    pub source: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(content: impl Into<String>, source: impl Into<String>, priority: Priority) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            priority,
            timestamp: Utc::now(),
        }
    }

    /// Age of the signal at this moment
    pub fn age(&self) -> ChronoDuration {
        Utc::now() - self.timestamp
    }

    /// Whether the signal has outlived the freshness window
    pub fn is_stale(&self) -> bool {
        self.age().num_seconds() > FRESHNESS_WINDOW_SECS
    }
}

/// Command kind emitted by a thought
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Store a fact locally; never forwarded to execution
    Remember,
    /// Hand a task to the execution agent
    Delegate,
    /// Complex task for step decomposition
    Focus,
    /// Nothing to do this tick
    Wait,
}

/// A directive produced by deliberation for the execution side
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub priority: Priority,
}

/// Structured reasoning output of one deliberation tick
#[derive(Debug, Clone, Default)]
pub struct Thought {
    pub thought: String,
    pub analysis: String,
    pub commands: Vec<Command>,
}

impl Thought {
    /// Build a thought from a parsed structured response.
    ///
    /// Command entries that fail to deserialize (unknown type, wrong shape)
    /// are skipped with a warning instead of poisoning the whole thought.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }

        let text = |key: &str| {
            value
                .get(key)
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let commands = value
            .get("commands")
            .and_then(serde_json::Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        match serde_json::from_value::<Command>(entry.clone()) {
                            Ok(command) => Some(command),
                            Err(e) => {
                                warn!("Skipping malformed command: {e}");
                                None
                            }
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            thought: text("thought"),
            analysis: text("analysis"),
            commands,
        })
    }
}

type ThoughtObserver = Box<dyn Fn(&Thought) + Send + Sync>;

/// The deliberation half of the runtime
pub struct DeliberationAgent {
    requester: tokio::sync::Mutex<Requester>,
    memory: Arc<MemoryStore>,
    reducer: ContextReducer,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Signal>>,
    command_tx: mpsc::UnboundedSender<Command>,
    context: Mutex<Vec<String>>,
    on_thought: Mutex<Option<ThoughtObserver>>,
    running: AtomicBool,
}

impl DeliberationAgent {
    /// Create the agent. `command_tx` is the execution agent's queue.
    pub fn new(
        requester: Requester,
        memory: Arc<MemoryStore>,
        reducer: ContextReducer,
        command_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        Self {
            requester: tokio::sync::Mutex::new(requester),
            memory,
            reducer,
            signal_tx,
            signal_rx: tokio::sync::Mutex::new(signal_rx),
            command_tx,
            context: Mutex::new(Vec::new()),
            on_thought: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Enqueue external input as a medium-priority signal. Non-blocking.
    pub fn receive_input(&self, text: &str, source: &str) {
        self.receive_signal(Signal::new(text, source, Priority::Medium));
    }

    /// Enqueue a signal. Non-blocking; FIFO order is preserved.
    pub fn receive_signal(&self, signal: Signal) {
        if self.signal_tx.send(signal).is_err() {
            warn!("Signal dropped: deliberation queue closed");
        }
    }

    /// Observe each parsed thought (observability hook)
    pub fn on_thought(&self, observer: impl Fn(&Thought) + Send + Sync + 'static) {
        *self.on_thought.lock() = Some(Box::new(observer));
    }

    /// Rolling narrative context, oldest first
    pub fn get_context(&self) -> Vec<String> {
        self.context.lock().clone()
    }

    pub fn clear_context(&self) {
        self.context.lock().clear();
    }

    /// Clear the conversation history
    pub async fn clear_history(&self) {
        self.requester.lock().await.clear_history();
    }

    /// Request the loop to stop after its current wait
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the deliberation loop until `stop()`
    ///
    /// Each iteration waits for a signal, bounded by `interval`, so a stop
    /// request is observed promptly even on a silent queue.
    pub async fn run_loop(self: Arc<Self>, interval: Duration) {
        self.running.store(true, Ordering::SeqCst);
        info!("Deliberation loop started ({}s tick)", interval.as_secs_f32());

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.tick(interval).await {
                error!("Deliberation tick failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        info!("Deliberation loop stopped");
    }

    /// One tick: dequeue a signal (if any), think, route commands
    async fn tick(&self, interval: Duration) -> anyhow::Result<()> {
        let signal = {
            let mut rx = self.signal_rx.lock().await;
            match tokio::time::timeout(interval, rx.recv()).await {
                Err(_) => return Ok(()), // quiet tick
                Ok(None) => {
                    tokio::time::sleep(interval).await;
                    return Ok(());
                }
                Ok(Some(signal)) => signal,
            }
        };

        debug!(
            "Processing signal from {} ({}s old): {}",
            signal.source,
            signal.age().num_seconds(),
            prompts::preview(&signal.content, 60)
        );

        let mut requester = self.requester.lock().await;

        if self.reducer.needs_reduction(requester.history()) {
            let reduced = self.reducer.reduce(requester.history()).await;
            requester.set_history(reduced);
        }

        let narrative = self.get_context().join("\n");
        let memories = self.memory.digest(&signal.content, 5);
        let prompt = prompts::analysis_prompt(Utc::now(), &narrative, &memories, &signal);

        let response = requester.think(&prompt, None, true, true).await?;
        drop(requester);

        let Some(value) = parse_structured(&response) else {
            warn!("Unparseable thought, skipping tick");
            return Ok(());
        };
        let Some(thought) = Thought::from_value(&value) else {
            warn!("Thought is not an object, skipping tick");
            return Ok(());
        };

        if !thought.thought.is_empty() {
            let mut context = self.context.lock();
            context.push(thought.thought.clone());
            if context.len() > MAX_CONTEXT_ENTRIES {
                let excess = context.len() - MAX_CONTEXT_ENTRIES;
                context.drain(..excess);
            }
        }

        if let Some(observer) = self.on_thought.lock().as_ref() {
            observer(&thought);
        }

        self.route_commands(thought.commands);
        Ok(())
    }

    /// Apply remember commands locally, forward delegate/focus in order
    fn route_commands(&self, commands: Vec<Command>) {
        for command in commands {
            match command.kind {
                CommandKind::Remember => {
                    let content = command.content.trim();
                    if content.len() < 4 {
                        debug!("Skipping trivial remember command");
                        continue;
                    }
                    match self.memory.save(content, "spirit", REMEMBER_IMPORTANCE, "general") {
                        Ok(Some(_)) => debug!("Remembered: {}", prompts::preview(content, 50)),
                        Ok(None) => debug!("Remember suppressed as duplicate"),
                        Err(e) => warn!("Memory save failed: {e}"),
                    }
                }
                CommandKind::Delegate | CommandKind::Focus => {
                    debug!(
                        "Forwarding {:?} command: {}",
                        command.kind,
                        prompts::preview(&command.content, 60)
                    );
                    if self.command_tx.send(command).is_err() {
                        warn!("Command dropped: execution queue closed");
                    }
                }
                CommandKind::Wait => {
                    debug!("Wait command - tick ends");
                }
            }
        }
    }
}
