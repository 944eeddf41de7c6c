//! Animus - autonomous cognitive-agent runtime
//!
//! Two LLM-backed agents cooperate over shared memory: a **deliberation**
//! agent decides what should happen next, an **execution** agent carries it
//! out through callable tools. Both run as cooperatively scheduled tokio
//! tasks coordinated by the orchestrator.
//!
//! # Architecture
//!
//! ```text
//! input ──► Orchestrator ──► Deliberation ──► command queue ──► Execution
//!                │            (signals)                          (tools)
//!                │               ▲                                  │
//!                │               └───────── action reports ─────────┤
//!                │                                                  ▼
//!                ├── MemoryStore (SQLite)                    output callback
//!                ├── ToolRegistry
//!                ├── SandboxExecutor (legacy code path)
//!                └── ContextReducer (token budget)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use animus::{Orchestrator, OpenAiCompatClient, SystemParams};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let provider = Arc::new(OpenAiCompatClient::new("key", None, "gpt-4o-mini"));
//! let entity = Orchestrator::new(provider, SystemParams::default(), None)?;
//!
//! entity.on_output(|text| println!("{text}"));
//! entity.start().await;
//! entity.input_signal("Hello!", "user");
//! # Ok(())
//! # }
//! ```

pub mod compressor;
pub mod config;
pub mod deliberation;
pub mod execution;
pub mod executor;
pub mod focus;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod prompts;
pub mod request;
pub mod tokenizer;
pub mod tools;

pub use compressor::ContextReducer;
pub use config::{AgentConfig, ConfigError, ProviderConfig, SystemParams};
pub use deliberation::{Command, CommandKind, DeliberationAgent, Priority, Signal, Thought};
pub use execution::{Action, ActionKind, ActionPayload, ExecutionAgent, ToolInvocation};
pub use executor::{ExecutionOutcome, SandboxExecutor};
pub use focus::{FocusModule, FocusTask, TaskPriority, TaskStatus};
pub use llm::{ChatMessage, LlmError, LlmProvider, OpenAiCompatClient, Role, SamplingParams};
pub use memory::{MemoryHit, MemoryRecord, MemoryStore};
pub use orchestrator::Orchestrator;
pub use request::{parse_structured, RequestError, Requester};
pub use tokenizer::TokenCounter;
pub use tools::{Tool, ToolRegistry, ToolResult};
