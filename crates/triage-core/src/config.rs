use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use triage_providers::{GenerateOptions, ProviderConfig, ProvidersConfig};
use triage_tools::ToolSettings;

use crate::{ArtifactSettings, ExecutionSettings, PrepareLimits, RetryPolicy, ThrottlePolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolLoopConfig {
    /// Tool-execution rounds allowed per turn.
    pub max_iterations: usize,
    pub max_total_tool_calls: usize,
    pub max_result_bytes: usize,
    /// 0 disables the per-signature repeat limit.
    pub max_repeat_per_signature: usize,
    pub stall_threshold: usize,
    pub cycle_threshold: usize,
    pub no_progress_threshold: usize,
    pub parallelism: usize,
    pub tool_call_delay_ms: u64,
    pub cache_results: bool,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            max_total_tool_calls: 40,
            max_result_bytes: 4 * 1024 * 1024,
            max_repeat_per_signature: 2,
            stall_threshold: 3,
            cycle_threshold: 2,
            no_progress_threshold: 2,
            parallelism: 4,
            tool_call_delay_ms: 0,
            cache_results: true,
        }
    }
}

impl ToolLoopConfig {
    pub fn prepare_limits(&self) -> PrepareLimits {
        PrepareLimits {
            max_repeat_per_signature: self.max_repeat_per_signature,
            max_result_bytes: self.max_result_bytes,
            cache_results: self.cache_results,
        }
    }

    pub fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            parallelism: self.parallelism.max(1),
            call_delay: Duration::from_millis(self.tool_call_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            backoff_factor: self.backoff_factor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub min_interval_ms: u64,
    /// When non-zero, takes precedence over `min_interval_ms`.
    pub requests_per_window: usize,
    pub window_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 0,
            requests_per_window: 0,
            window_ms: 60_000,
        }
    }
}

impl ThrottleConfig {
    pub fn policy(&self) -> ThrottlePolicy {
        if self.requests_per_window > 0 && self.window_ms > 0 {
            return ThrottlePolicy::Window {
                max_requests: self.requests_per_window,
                window: Duration::from_millis(self.window_ms),
            };
        }
        if self.min_interval_ms > 0 {
            return ThrottlePolicy::FixedDelay(Duration::from_millis(self.min_interval_ms));
        }
        ThrottlePolicy::Disabled
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub threshold_chars: usize,
    pub preview_max_lines: usize,
    pub preview_max_cols: usize,
    pub dir: Option<PathBuf>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            threshold_chars: 16_000,
            preview_max_lines: 40,
            preview_max_cols: 200,
            dir: None,
        }
    }
}

impl ArtifactConfig {
    pub fn settings(&self, default_dir: &Path) -> ArtifactSettings {
        ArtifactSettings {
            threshold_chars: self.threshold_chars,
            preview_max_lines: self.preview_max_lines.max(1),
            preview_max_cols: self.preview_max_cols.max(1),
            dir: self
                .dir
                .clone()
                .unwrap_or_else(|| default_dir.to_path_buf()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let defaults = GenerateOptions::default();
        Self {
            model: defaults.model,
            temperature: defaults.temperature,
            max_output_tokens: defaults.max_output_tokens,
        }
    }
}

impl GenerationConfig {
    pub fn options(&self) -> GenerateOptions {
        GenerateOptions {
            model: self.model.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            ..GenerateOptions::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    pub system_prompt: Option<String>,
    pub tool_loop: ToolLoopConfig,
    pub retry: RetryConfig,
    pub throttle: ThrottleConfig,
    pub artifacts: ArtifactConfig,
    pub generation: GenerationConfig,
    pub tools: ToolSettings,
}

impl EngineConfig {
    pub fn providers_config(&self) -> ProvidersConfig {
        ProvidersConfig {
            providers: self.providers.clone(),
            default_provider: self.default_provider.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: global file, project file, environment and
/// command-line overrides, merged in that order.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path().await?;
        Self::with_layers(global_path, path, env_layer(), cli_overrides).await
    }

    pub async fn with_layers(
        global_path: PathBuf,
        project_path: impl AsRef<Path>,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        let global = read_json_file(&global_path).await?;
        let project = read_json_file(&project_path).await?;
        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(ConfigLayers {
                global,
                project,
                env,
                cli: cli_overrides.unwrap_or_else(empty_object),
            })),
        })
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }

    pub async fn get(&self) -> anyhow::Result<EngineConfig> {
        let merged = self.get_effective_value().await;
        Ok(serde_json::from_value(merged)?)
    }

    pub async fn get_effective_value(&self) -> Value {
        merge_layers(&*self.layers.read().await)
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "cli": layers.cli
        })
    }

    /// Merges `patch` into the project layer and writes it back. The patch is
    /// rejected, and nothing is written, when the merged result no longer
    /// deserializes as an `EngineConfig`.
    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            let mut candidate = layers.clone();
            deep_merge(&mut candidate.project, &patch);
            serde_json::from_value::<EngineConfig>(merge_layers(&candidate)).map_err(|err| {
                anyhow::anyhow!("config patch rejected: {err}")
            })?;
            *layers = candidate;
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }
}

fn merge_layers(layers: &ConfigLayers) -> Value {
    let mut merged = empty_object();
    deep_merge(&mut merged, &layers.global);
    deep_merge(&mut merged, &layers.project);
    deep_merge(&mut merged, &layers.env);
    deep_merge(&mut merged, &layers.cli);
    merged
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Builds a nested patch from a dotted key: `tool_loop.max_iterations` and
/// `12` become `{"tool_loop": {"max_iterations": 12}}`.
pub fn dotted_patch(key: &str, value: Value) -> anyhow::Result<Value> {
    let segments = key.trim().split('.').collect::<Vec<_>>();
    if segments.iter().any(|segment| segment.trim().is_empty()) {
        anyhow::bail!("invalid config key `{key}`");
    }
    Ok(segments.iter().rev().fold(value, |inner, segment| {
        let mut map = Map::new();
        map.insert(segment.trim().to_string(), inner);
        Value::Object(map)
    }))
}

/// Command-line config values are JSON when they parse as JSON, plain strings otherwise.
pub fn parse_config_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Masks every `api_key`/`apiKey` string so config can be printed.
pub fn redact_config_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if matches!(key.as_str(), "api_key" | "apiKey") && child.is_string() {
                    *child = Value::String("********".to_string());
                } else {
                    redact_config_secrets(child);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_config_secrets),
        _ => {}
    }
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

/// Drops provider api keys that are also available from the environment.
fn strip_persisted_secrets(value: &mut Value) {
    let Some(providers) = value
        .get_mut("providers")
        .and_then(|providers| providers.as_object_mut())
    else {
        return;
    };
    for (provider_id, cfg) in providers.iter_mut() {
        if !provider_has_runtime_secret(provider_id) {
            continue;
        }
        if let Some(cfg) = cfg.as_object_mut() {
            cfg.remove("api_key");
            cfg.remove("apiKey");
        }
    }
}

fn provider_has_runtime_secret(provider_id: &str) -> bool {
    provider_env_key(provider_id)
        .and_then(|name| std::env::var(name).ok())
        .is_some_and(|value| !value.trim().is_empty())
}

fn provider_env_key(provider_id: &str) -> Option<&'static str> {
    match provider_id.to_ascii_lowercase().as_str() {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "azure" => Some("AZURE_OPENAI_API_KEY"),
        _ => None,
    }
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unparsable config file");
            Ok(empty_object())
        }
    }
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("TRIAGE_GLOBAL_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    if let Some(config_dir) = dirs::config_dir() {
        return Ok(config_dir.join("triage").join("config.json"));
    }
    Ok(PathBuf::from(".triage/global_config.json"))
}

fn env_layer() -> Value {
    let mut root = empty_object();

    if let Some(provider) = env_string("TRIAGE_PROVIDER") {
        deep_merge(&mut root, &json!({ "default_provider": provider }));
    }
    if let Some(model) = env_string("TRIAGE_MODEL") {
        deep_merge(&mut root, &json!({ "generation": { "model": model } }));
    }
    for (var, key) in [
        ("TRIAGE_MAX_ITERATIONS", "max_iterations"),
        ("TRIAGE_MAX_TOOL_CALLS", "max_total_tool_calls"),
        ("TRIAGE_MAX_REPEAT", "max_repeat_per_signature"),
        ("TRIAGE_PARALLELISM", "parallelism"),
        ("TRIAGE_TOOL_DELAY_MS", "tool_call_delay_ms"),
    ] {
        if let Some(value) = env_string(var).and_then(|raw| raw.parse::<u64>().ok()) {
            deep_merge(&mut root, &json!({ "tool_loop": { key: value } }));
        }
    }
    if let Some(enabled) =
        env_string("TRIAGE_CACHE_RESULTS").and_then(|raw| parse_bool_like(&raw))
    {
        deep_merge(&mut root, &json!({ "tool_loop": { "cache_results": enabled } }));
    }
    if let Some(dir) = env_string("TRIAGE_ARTIFACT_DIR") {
        deep_merge(&mut root, &json!({ "artifacts": { "dir": dir } }));
    }
    if let Some(ms) =
        env_string("TRIAGE_MIN_REQUEST_INTERVAL_MS").and_then(|raw| raw.parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "throttle": { "min_interval_ms": ms } }));
    }

    add_openai_env(&mut root, "openai", "OPENAI_API_KEY");
    add_openai_env(&mut root, "openrouter", "OPENROUTER_API_KEY");
    add_openai_env(&mut root, "azure", "AZURE_OPENAI_API_KEY");
    if let Some(url) = env_string("OLLAMA_HOST") {
        let url = format!("{}/v1", url.trim_end_matches('/'));
        deep_merge(&mut root, &json!({ "providers": { "ollama": { "url": url } } }));
    }

    root
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn add_openai_env(root: &mut Value, provider: &str, key_env: &str) {
    if let Some(api_key) = env_string(key_env) {
        deep_merge(
            root,
            &json!({ "providers": { provider: { "api_key": api_key } } }),
        );
    }
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
