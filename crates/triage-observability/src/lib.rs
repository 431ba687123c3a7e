use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// One structured record on the `triage.obs` target. Unset fields are logged
/// as empty strings (or `-1` for numbers) so every line has the same shape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub turn_id: Option<&'a str>,
    pub round: Option<usize>,
    pub attempt: Option<usize>,
    pub tool_name: Option<&'a str>,
    pub provider_id: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub elapsed_ms: Option<u64>,
    pub detail: Option<&'a str>,
}

const SECRET_PREFIXES: [&str; 4] = ["sk-", "sk_", "xoxb-", "ghp_"];

/// Masks bearer tokens and API-key shaped words. Provider error bodies
/// sometimes echo the request headers back.
pub fn scrub_secrets(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut mask_next = false;
    for (i, word) in input.split(' ').enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let bare = word.trim_matches(|c: char| c == '"' || c == '\'' || c == ',');
        if mask_next && !bare.is_empty() {
            out.push_str("[redacted]");
            mask_next = false;
            continue;
        }
        if bare.eq_ignore_ascii_case("bearer") {
            mask_next = true;
            out.push_str(word);
            continue;
        }
        if SECRET_PREFIXES.iter().any(|p| bare.starts_with(p)) && bare.len() > 12 {
            out.push_str(&word.replace(bare, "[redacted]"));
            continue;
        }
        out.push_str(word);
    }
    out
}

macro_rules! obs_record {
    ($level:ident, $process:expr, $event:expr, $detail:expr) => {
        tracing::$level!(
            target: "triage.obs",
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            turn_id = $event.turn_id.unwrap_or(""),
            round = $event.round.map(|r| r as i64).unwrap_or(-1),
            attempt = $event.attempt.map(|a| a as i64).unwrap_or(-1),
            tool_name = $event.tool_name.unwrap_or(""),
            provider_id = $event.provider_id.unwrap_or(""),
            model_id = $event.model_id.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            elapsed_ms = $event.elapsed_ms.map(|ms| ms as i64).unwrap_or(-1),
            detail = $detail.as_str(),
            "observability_event"
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    let detail = event.detail.map(scrub_secrets).unwrap_or_default();
    match level {
        Level::ERROR => obs_record!(error, process, event, detail),
        Level::WARN => obs_record!(warn, process, event, detail),
        Level::DEBUG | Level::TRACE => obs_record!(debug, process, event, detail),
        _ => obs_record!(info, process, event, detail),
    }
}

/// Installs console + daily JSONL file logging. Keep the returned guard alive
/// for the lifetime of the process or buffered file output is lost.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process.as_str(), retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(format!("triage.{}", process.as_str()))
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    // The console belongs to the conversation; only warnings go to stderr.
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::filter::LevelFilter::WARN);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix: format!("triage.{}", process.as_str()),
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn cleanup_old_jsonl(logs_dir: &Path, process: &str, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("triage.{}.", process);

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if !name.starts_with(&prefix) || !name.ends_with(".jsonl") {
            continue;
        }

        // expected: triage.<proc>.YYYY-MM-DD.jsonl
        let date_part = name.trim_start_matches(&prefix).trim_end_matches(".jsonl");

        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };

        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}
