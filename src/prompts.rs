//! Agent prompts
//!
//! System prompts and per-tick prompt builders for both agents. The
//! deliberation side reasons about signals; the execution side is pushed
//! hard toward acting through tools instead of narrating plans.

use crate::deliberation::Signal;

/// Freshness window after which a signal is treated as possibly already
/// answered (seconds).
pub const FRESHNESS_WINDOW_SECS: i64 = 5;

pub const DELIBERATION_SYSTEM_PROMPT: &str = r#"You are the deliberative mind of an autonomous entity.

## Your Nature:
You observe incoming signals, reflect, remember important things, and decide
what should happen next. You do not act directly - you issue commands.

## Your Memory:
Remember only NEW important facts:
- Facts about the person you are talking to ("Their name is...", "They like...")
- Your own new conclusions ("I realized that...")
- New rules and constraints

Do NOT remember what is already in your personality, verbatim user messages,
or technical dialogue details.

## Response Format:
Respond STRICTLY as JSON:

```json
{
    "thought": "Your internal reflection",
    "analysis": "Your analysis of the situation",
    "commands": [
        {
            "type": "remember|delegate|focus|wait",
            "content": "What to remember, or the task to execute",
            "priority": "high|medium|low"
        }
    ]
}
```

## Command Types:
- remember: store a NEW fact (never duplicate what you already know)
- delegate: hand a task to the executor - describe WHAT, not HOW
- focus: a complex task that needs decomposition into steps
- wait: nothing to do - wait for the next signal

## Timing Rules:
- Compare the signal time with the current time.
- A signal older than the freshness window has POSSIBLY been answered
  already. Do NOT respond to it again - prefer "wait".
- After delegating a response, ALWAYS add a "wait" command."#;

pub const EXECUTION_SYSTEM_PROMPT: &str = r#"You are the executive mind of an autonomous entity. You ACT.

## Critical Behavior:
- When asked to create something - create it IMMEDIATELY with create_file.
- NEVER say "I will do X" - just do X, then report what you DID (past tense).
- NEVER output partial code or placeholders.
- One command = one complete result.

## Available tools:
{tools}

## Response Format:
Respond STRICTLY as JSON:

```json
{
    "action_type": "tool_call",
    "reasoning": "Brief explanation",
    "tool_calls": [
        {"tool": "create_file", "args": {"path": "page.html", "content": "...full content..."}},
        {"tool": "say_to_user", "args": {"text": "Done! Created page.html"}}
    ]
}
```

Other action types: "response" with a "response" field for a plain reply,
"code" with a "code" field for a shell snippet in the sandbox.

A later tool call may reference the previous tool's output as {{result}}.
Always finish a task by telling the user what happened via say_to_user."#;

/// Build the execution system prompt with the current tool catalog injected
pub fn execution_system_prompt(tool_catalog: &str) -> String {
    EXECUTION_SYSTEM_PROMPT.replace("{tools}", tool_catalog)
}

/// Per-tick analysis prompt for the deliberation agent
pub fn analysis_prompt(
    now: chrono::DateTime<chrono::Utc>,
    narrative: &str,
    memories: &str,
    signal: &Signal,
) -> String {
    let age_secs = signal.age().num_seconds();
    let staleness = if signal.is_stale() {
        format!(
            "\nNOTE: this signal is {age_secs}s old - past the freshness window. \
             You have POSSIBLY answered it already. Prefer \"wait\" over responding again."
        )
    } else {
        String::new()
    };

    format!(
        "## Current Time: {now}\n\n\
         ## Current Context:\n{context}\n\n\
         ## Relevant Memories:\n{memories}\n\n\
         ## Incoming Signal:\n\
         Source: {source}\n\
         Age: {age_secs}s\n\
         Message: {content}{staleness}\n\n\
         ## Task:\n\
         1. Check the signal age against the freshness window.\n\
         2. Analyze the message.\n\
         3. If it is NEW, add a \"delegate\" command describing the task for the executor.\n\
         4. ALWAYS add a \"wait\" command after responding.\n\
         Respond STRICTLY as JSON.",
        now = now.format("%Y-%m-%d %H:%M:%S UTC"),
        context = if narrative.is_empty() { "(empty)" } else { narrative },
        memories = if memories.is_empty() { "(none)" } else { memories },
        source = signal.source,
        content = signal.content,
    )
}

/// First-step action prompt for the execution agent
pub fn action_prompt(task: &str, priority: &str, context: &str) -> String {
    format!(
        "## Task to Execute NOW:\n{task}\n\n\
         ## Priority: {priority}\n\n\
         ## Context:\n{context}\n\n\
         Execute the task immediately with tool_calls. Make reasonable \
         assumptions instead of asking questions. After executing, tell the \
         user what you DID via say_to_user. Respond as JSON."
    )
}

/// Continuation prompt after a step that did not end the task
pub fn continuation_prompt(previous_action: &str, result: &str) -> String {
    format!(
        "## Previous Action:\n{previous_action}\n\n\
         ## Execution Result:\n{result}\n\n\
         If the task is now complete - use say_to_user to inform the user.\n\
         If more work is needed - execute the next step immediately.\n\
         Respond as JSON."
    )
}

/// One-shot correction prompt for malformed structured output
pub fn correction_prompt(malformed: &str, task: &str) -> String {
    format!(
        "Your previous response contained invalid JSON. Here is the malformed response:\n\n\
         {malformed}\n\n\
         Provide a corrected, valid JSON response for the same task.\n\n\
         Task: {task}\n\n\
         Respond with valid JSON only, following the required format."
    )
}

/// Decomposition prompt for focus tasks
pub fn decomposition_prompt(task: &str) -> String {
    format!(
        "Break the following complex task into simple sequential steps:\n\n\
         Task: {task}\n\n\
         Respond as JSON:\n\
         {{\n    \"steps\": [\n        {{\"id\": \"step_1\", \"description\": \"...\"}},\n        {{\"id\": \"step_2\", \"description\": \"...\"}}\n    ]\n}}"
    )
}

/// History compression prompt
pub fn compression_prompt(history: &str) -> String {
    format!(
        "Compress the following dialogue, keeping the key information:\n\
         - important facts and decisions\n\
         - the user's key questions\n\
         - results of performed actions\n\
         - context needed to continue\n\n\
         Reply with a brief summary in the same language as the dialogue.\n\n\
         DIALOGUE:\n{history}\n\n\
         SUMMARY:"
    )
}

/// Truncate to a character budget for log lines and relayed previews
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}
