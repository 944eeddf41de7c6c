//! Tool Registry
//!
//! Named, described functions the execution agent can call. The catalog
//! description is injected into the execution system prompt; call this
//! module's `describe()` and rebuild prompts after registering new tools.
//!
//! File tools are rooted in a workspace directory and refuse paths that
//! escape it.

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error};

/// Handler signature: named JSON arguments in, output text out
pub type ToolHandler = Box<dyn Fn(&Map<String, Value>) -> Result<String> + Send + Sync>;

/// A registered tool
pub struct Tool {
    pub name: String,
    pub description: String,
    /// (name, description) pairs, in declaration order
    pub parameters: Vec<(String, String)>,
    pub returns: String,
    pub category: String,
    pub handler: ToolHandler,
}

/// Builder-style construction keeps registration sites readable.
impl Tool {
    pub fn new(
        name: &str,
        description: &str,
        handler: impl Fn(&Map<String, Value>) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
            returns: String::new(),
            category: "general".to_string(),
            handler: Box::new(handler),
        }
    }

    pub fn param(mut self, name: &str, description: &str) -> Self {
        self.parameters.push((name.to_string(), description.to_string()));
        self
    }

    pub fn returns(mut self, description: &str) -> Self {
        self.returns = description.to_string();
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }
}

/// Result of one tool execution
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub tool_name: String,
    pub elapsed_ms: u64,
}

/// Registry of callable tools
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Tool>>,
    workspace: PathBuf,
}

impl ToolRegistry {
    /// Create a registry with the built-in tools, rooting file operations
    /// at `workspace`.
    pub fn new(workspace: &Path) -> Self {
        let registry = Self {
            tools: RwLock::new(BTreeMap::new()),
            workspace: workspace.to_path_buf(),
        };
        registry.register_builtins();
        registry
    }

    fn register_builtins(&self) {
        let workspace = self.workspace.clone();
        self.register(
            Tool::new("create_file", "Create a file with the given content.", move |args| {
                let path = required_str(args, "path")?;
                let content = required_str(args, "content")?;
                let full = resolve_workspace_path(&workspace, path)?;
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&full, content)?;
                Ok(format!("Created {}", full.display()))
            })
            .param("path", "File path relative to the workspace")
            .param("content", "File content")
            .returns("Confirmation with the created path")
            .category("filesystem"),
        );

        let workspace = self.workspace.clone();
        self.register(
            Tool::new("read_file", "Read the content of a file.", move |args| {
                let path = required_str(args, "path")?;
                let full = resolve_workspace_path(&workspace, path)?;
                Ok(std::fs::read_to_string(&full)
                    .map_err(|e| anyhow!("cannot read {}: {e}", full.display()))?)
            })
            .param("path", "File path relative to the workspace")
            .returns("The file content")
            .category("filesystem"),
        );

        let workspace = self.workspace.clone();
        self.register(
            Tool::new("list_files", "List the contents of a directory.", move |args| {
                let path = args
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or(".");
                let full = resolve_workspace_path(&workspace, path)?;

                let mut lines = Vec::new();
                for entry in std::fs::read_dir(&full)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type()?.is_dir() {
                        lines.push(format!("{name}/"));
                    } else {
                        lines.push(format!("{name} ({} bytes)", entry.metadata()?.len()));
                    }
                }
                lines.sort();

                Ok(if lines.is_empty() {
                    "directory is empty".to_string()
                } else {
                    lines.join("\n")
                })
            })
            .param("path", "Directory path relative to the workspace (default: workspace root)")
            .returns("One entry per line")
            .category("filesystem"),
        );

        let workspace = self.workspace.clone();
        self.register(
            Tool::new("delete_file", "Delete a file.", move |args| {
                let path = required_str(args, "path")?;
                let full = resolve_workspace_path(&workspace, path)?;
                std::fs::remove_file(&full)
                    .map_err(|e| anyhow!("cannot delete {}: {e}", full.display()))?;
                Ok(format!("Deleted {}", full.display()))
            })
            .param("path", "File path relative to the workspace")
            .returns("Confirmation")
            .category("filesystem"),
        );

        self.register(
            Tool::new("get_time", "Get the current date and time.", |_args| {
                Ok(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string())
            })
            .returns("Current date and time")
            .category("utility"),
        );

        // The agent loop collects this tool's text for the output callback;
        // the handler itself only echoes so the message is emitted once.
        self.register(
            Tool::new("say_to_user", "Say something to the user. Use for replies and updates.", |args| {
                Ok(required_str(args, "text")?.to_string())
            })
            .param("text", "Message text for the user")
            .returns("The message text")
            .category("communication"),
        );
    }

    /// Register (or replace) a tool
    pub fn register(&self, tool: Tool) {
        debug!("Registered tool: {}", tool.name);
        self.tools.write().insert(tool.name.clone(), tool);
    }

    /// Remove a tool. Returns true if it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.tools.write().remove(name).is_some()
    }

    /// All registered tool names
    pub fn list(&self) -> Vec<String> {
        self.tools.read().keys().cloned().collect()
    }

    /// Execute a tool by name
    pub fn execute(&self, name: &str, args: &Map<String, Value>) -> ToolResult {
        let start = Instant::now();
        let tools = self.tools.read();

        let Some(tool) = tools.get(name) else {
            return ToolResult {
                success: false,
                output: String::new(),
                error: Some(format!("tool not found: {name}")),
                tool_name: name.to_string(),
                elapsed_ms: 0,
            };
        };

        match (tool.handler)(args) {
            Ok(output) => {
                debug!("Tool {} succeeded ({}ms)", name, start.elapsed().as_millis());
                ToolResult {
                    success: true,
                    output,
                    error: None,
                    tool_name: name.to_string(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                }
            }
            Err(e) => {
                error!("Tool {} failed: {e}", name);
                ToolResult {
                    success: false,
                    output: String::new(),
                    error: Some(e.to_string()),
                    tool_name: name.to_string(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                }
            }
        }
    }

    /// Human-readable catalog grouped by category, for prompt injection
    pub fn describe(&self) -> String {
        let tools = self.tools.read();

        let mut by_category: BTreeMap<&str, Vec<&Tool>> = BTreeMap::new();
        for tool in tools.values() {
            by_category.entry(tool.category.as_str()).or_default().push(tool);
        }

        let mut lines = Vec::new();
        for (category, tools) in by_category {
            lines.push(format!("### {category}:"));
            for tool in tools {
                let params = tool
                    .parameters
                    .iter()
                    .map(|(name, _)| name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                lines.push(format!("- {}({params}) - {}", tool.name, tool.description));
                for (name, desc) in &tool.parameters {
                    lines.push(format!("    {name}: {desc}"));
                }
                if !tool.returns.is_empty() {
                    lines.push(format!("    returns: {}", tool.returns));
                }
            }
            lines.push(String::new());
        }

        lines.join("\n").trim_end().to_string()
    }
}

fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required argument: {key}"))
}

/// Join a caller-supplied path onto the workspace, rejecting absolute paths
/// and parent-directory escapes.
fn resolve_workspace_path(workspace: &Path, raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);

    if path.is_absolute() {
        return Err(anyhow!("absolute paths are not allowed: {raw}"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(anyhow!("path escapes the workspace: {raw}"));
    }

    Ok(workspace.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn test_create_and_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path());

        let result = registry.execute(
            "create_file",
            &args(&[("path", "notes/hello.txt"), ("content", "hi there")]),
        );
        assert!(result.success, "{:?}", result.error);

        let read = registry.execute("read_file", &args(&[("path", "notes/hello.txt")]));
        assert!(read.success);
        assert_eq!(read.output, "hi there");
    }

    #[test]
    fn test_path_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path());

        let escape = registry.execute(
            "create_file",
            &args(&[("path", "../outside.txt"), ("content", "x")]),
        );
        assert!(!escape.success);

        let absolute = registry.execute(
            "create_file",
            &args(&[("path", "/tmp/outside.txt"), ("content", "x")]),
        );
        assert!(!absolute.success);
    }

    #[test]
    fn test_missing_tool() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path());

        let result = registry.execute("no_such_tool", &Map::new());
        assert!(!result.success);
        assert!(result.error.unwrap().contains("tool not found"));
    }

    #[test]
    fn test_say_to_user_echoes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path());

        let result = registry.execute("say_to_user", &args(&[("text", "hello!")]));
        assert!(result.success);
        assert_eq!(result.output, "hello!");
    }

    #[test]
    fn test_describe_lists_registered_tools() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path());

        registry.register(
            Tool::new("add", "Add two numbers.", |args| {
                let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok((a + b).to_string())
            })
            .param("a", "First number")
            .param("b", "Second number")
            .category("math"),
        );

        let catalog = registry.describe();
        assert!(catalog.contains("### math:"));
        assert!(catalog.contains("add(a, b)"));
        assert!(catalog.contains("say_to_user(text)"));
    }

    #[test]
    fn test_custom_tool_execution() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path());

        registry.register(Tool::new("shout", "Uppercase the input.", |args| {
            Ok(required_str(args, "text")?.to_uppercase())
        }));

        let result = registry.execute("shout", &args(&[("text", "quiet")]));
        assert_eq!(result.output, "QUIET");
    }
}
