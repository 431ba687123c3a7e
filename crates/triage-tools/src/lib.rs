use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use triage_types::{ToolResult, ToolSchema};

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult>;
    async fn execute_with_cancel(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        self.execute(args).await
    }
}

/// Tool-execution capability consumed by the engine. Implementations must be
/// safe to call concurrently.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn schemas(&self) -> Vec<ToolSchema> {
        Vec::new()
    }
    async fn execute(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// When non-empty, `run_command` only accepts commands starting with one of these.
    pub allowed_command_prefixes: Vec<String>,
    pub kubectl_binary: String,
    pub max_output_bytes: usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            allowed_command_prefixes: Vec::new(),
            kubectl_binary: "kubectl".to_string(),
            max_output_bytes: 1_048_576,
        }
    }
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new(settings: ToolSettings) -> Self {
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        let shell: Arc<dyn Tool> = Arc::new(ShellCommandTool {
            allowed_prefixes: settings.allowed_command_prefixes.clone(),
            max_output_bytes: settings.max_output_bytes,
        });
        map.insert("run_command".to_string(), shell.clone());
        map.insert("bash".to_string(), shell);
        map.insert(
            "kubectl".to_string(),
            Arc::new(KubectlTool {
                binary: settings.kubectl_binary.clone(),
                max_output_bytes: settings.max_output_bytes,
            }),
        );
        Self {
            tools: Arc::new(map),
        }
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut dedup: HashMap<String, ToolSchema> = HashMap::new();
        for schema in self.tools.values().map(|t| t.schema()) {
            dedup.entry(schema.name.clone()).or_insert(schema);
        }
        let mut schemas = dedup.into_values().collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute_with_cancel(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        let Some(tool) = self.tools.get(name).cloned() else {
            anyhow::bail!("unknown tool `{name}`");
        };
        tool.execute_with_cancel(args, cancel).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(ToolSettings::default())
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn schemas(&self) -> Vec<ToolSchema> {
        self.list().await
    }

    async fn execute(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        Ok(self.execute_with_cancel(name, args, cancel).await?.output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    for combinator in ["oneOf", "anyOf", "allOf"] {
        if let Some(children) = obj.get(combinator).and_then(|v| v.as_array()) {
            for (idx, child) in children.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}.{combinator}[{idx}]"), child)?;
            }
        }
    }

    Ok(())
}

/// Characters that let `sh -c` chain, substitute or redirect. Rejected when an
/// allowlist is configured so a permitted prefix cannot smuggle a second command.
const SHELL_METACHARACTERS: [char; 9] = [';', '&', '|', '`', '$', '>', '<', '\n', '\r'];

struct ShellCommandTool {
    allowed_prefixes: Vec<String>,
    max_output_bytes: usize,
}

impl ShellCommandTool {
    fn check_allowed(&self, cmd: &str) -> anyhow::Result<()> {
        if self.allowed_prefixes.is_empty() {
            return Ok(());
        }
        if let Some(found) = cmd.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
            anyhow::bail!("command rejected: shell operator {found:?} is not allowed here");
        }
        let trimmed = cmd.trim_start();
        if self
            .allowed_prefixes
            .iter()
            .any(|prefix| trimmed.starts_with(prefix.as_str()))
        {
            return Ok(());
        }
        anyhow::bail!(
            "command rejected: only commands starting with {} are allowed",
            self.allowed_prefixes.join(", ")
        )
    }
}

#[async_trait]
impl Tool for ShellCommandTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "run_command".to_string(),
            description: "Run a diagnostic shell command and return its output".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "cwd": {"type": "string"}
                },
                "required": ["command"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        self.execute_with_cancel(args, CancellationToken::new())
            .await
    }

    async fn execute_with_cancel(
        &self,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        let cmd = args
            .get("command")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing `command` argument"))?;
        self.check_allowed(cmd)?;
        let mut command = shell_command(cmd);
        if let Some(cwd) = args.get("cwd").and_then(|v| v.as_str()) {
            command.current_dir(cwd);
        }
        run_process(command, cancel, self.max_output_bytes).await
    }
}

struct KubectlTool {
    binary: String,
    max_output_bytes: usize,
}

#[async_trait]
impl Tool for KubectlTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "kubectl".to_string(),
            description: "Run kubectl with the given arguments (no shell expansion)".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "args": {"type": "array", "items": {"type": "string"}},
                    "namespace": {"type": "string"}
                },
                "required": ["args"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        self.execute_with_cancel(args, CancellationToken::new())
            .await
    }

    async fn execute_with_cancel(
        &self,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        let mut argv = kubectl_argv(&args)?;
        if let Some(ns) = args.get("namespace").and_then(|v| v.as_str()) {
            if !ns.trim().is_empty() && !argv.iter().any(|a| a == "-n" || a == "--namespace") {
                argv.push("-n".to_string());
                argv.push(ns.trim().to_string());
            }
        }
        let mut command = Command::new(&self.binary);
        command.args(&argv);
        run_process(command, cancel, self.max_output_bytes).await
    }
}

fn kubectl_argv(args: &Value) -> anyhow::Result<Vec<String>> {
    match args.get("args") {
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect()),
        Some(Value::String(line)) => Ok(line.split_whitespace().map(|s| s.to_string()).collect()),
        _ => anyhow::bail!("missing `args` argument"),
    }
}

fn shell_command(cmd: &str) -> Command {
    #[cfg(windows)]
    {
        let mut command = Command::new("powershell");
        command.args(["-NoProfile", "-Command", cmd]);
        command
    }
    #[cfg(not(windows))]
    {
        let mut command = Command::new("sh");
        command.args(["-c", cmd]);
        command
    }
}

async fn run_process(
    mut command: Command,
    cancel: CancellationToken,
    max_output_bytes: usize,
) -> anyhow::Result<ToolResult> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    tracing::debug!(program = ?command.as_std().get_program(), "spawning tool process");
    let child = command.spawn()?;
    let output = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!("tool process cancelled; child is killed on drop");
            anyhow::bail!("command cancelled");
        }
        result = child.wait_with_output() => result?
    };

    let stdout = clip_output(&String::from_utf8_lossy(&output.stdout), max_output_bytes);
    let stderr = clip_output(&String::from_utf8_lossy(&output.stderr), max_output_bytes);
    let code = output.status.code();
    if !output.status.success() {
        let mut detail = format!(
            "command exited with status {}",
            code.map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        if !stderr.trim().is_empty() {
            detail.push_str(&format!(": {}", stderr.trim()));
        } else if !stdout.trim().is_empty() {
            detail.push_str(&format!(": {}", stdout.trim()));
        }
        anyhow::bail!(detail);
    }

    let mut text = stdout;
    if !stderr.trim().is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str("[stderr]\n");
        text.push_str(&stderr);
    }
    Ok(ToolResult {
        output: text,
        metadata: json!({"exit_code": code}),
    })
}

fn clip_output(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return input.to_string();
    }
    let mut end = max_bytes;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...<output clipped at {} bytes>", &input[..end], max_bytes)
}
