use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSettings {
    /// Results longer than this many characters are written to disk.
    pub threshold_chars: usize,
    pub preview_max_lines: usize,
    pub preview_max_cols: usize,
    pub dir: PathBuf,
}

/// A persisted tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub path: PathBuf,
    /// sha256 of the raw content.
    pub hash: String,
}

/// Per-turn map from call signature to its artifact, so the same output is
/// written only once.
#[derive(Debug, Clone, Default)]
pub struct ArtifactCache {
    entries: HashMap<String, ArtifactRef>,
}

impl ArtifactCache {
    pub fn get(&self, signature: &str) -> Option<&ArtifactRef> {
        self.entries.get(signature)
    }

    pub fn insert(&mut self, signature: String, artifact: ArtifactRef) {
        self.entries.insert(signature, artifact);
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    settings: ArtifactSettings,
}

impl ArtifactStore {
    pub fn new(settings: ArtifactSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ArtifactSettings {
        &self.settings
    }

    pub fn exceeds_threshold(&self, content: &str) -> bool {
        content.chars().count() > self.settings.threshold_chars
    }

    /// Returns the cached artifact for `signature`, or writes a new one.
    pub async fn resolve(
        &self,
        cache: &mut ArtifactCache,
        tool_name: &str,
        signature: Option<&str>,
        content: &str,
    ) -> anyhow::Result<ArtifactRef> {
        if let Some(existing) = signature.and_then(|signature| cache.get(signature)) {
            return Ok(existing.clone());
        }
        let artifact = self.persist(tool_name, signature, content, Utc::now()).await?;
        if let Some(signature) = signature {
            cache.insert(signature.to_string(), artifact.clone());
        }
        Ok(artifact)
    }

    pub async fn persist(
        &self,
        tool_name: &str,
        signature: Option<&str>,
        content: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ArtifactRef> {
        tokio::fs::create_dir_all(&self.settings.dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create tool output directory {}",
                    self.settings.dir.display()
                )
            })?;

        let hash = sha256_hex(content.as_bytes());
        let path = self
            .settings
            .dir
            .join(artifact_file_name(tool_name, signature, content, now));

        let mut body = String::with_capacity(content.len() + 256);
        body.push_str(&format!("# tool={tool_name}\n"));
        body.push_str(&format!("# timestamp={}\n", now.to_rfc3339()));
        body.push_str(&format!("# signature={}\n", signature.unwrap_or_default()));
        body.push_str(&format!("# sha256={hash}\n"));
        body.push('\n');
        body.push_str(content);
        if !content.ends_with('\n') {
            body.push('\n');
        }

        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("failed to write tool output {}", path.display()))?;
        tracing::debug!(path = %path.display(), tool = tool_name, "persisted tool output");
        Ok(ArtifactRef { path, hash })
    }

    /// What the model sees: a bounded preview plus the reference line.
    pub fn model_view(&self, content: &str, artifact: &ArtifactRef) -> String {
        let mut out = preview(
            content,
            self.settings.preview_max_lines,
            self.settings.preview_max_cols,
        );
        out.push_str("\n\n");
        out.push_str(&reference_line(artifact));
        out
    }
}

/// What the session history keeps: the full output plus the reference line.
pub fn transcript_view(content: &str, artifact: &ArtifactRef) -> String {
    format!("{content}\n\n{}", reference_line(artifact))
}

pub fn reference_line(artifact: &ArtifactRef) -> String {
    format!(
        "[full output saved to {} (sha256={})]",
        artifact.path.display(),
        artifact.hash
    )
}

/// First `max_lines` lines, each clipped to `max_cols` characters, followed by
/// a count of omitted lines.
pub fn preview(content: &str, max_lines: usize, max_cols: usize) -> String {
    let total = content.lines().count();
    let mut out = content
        .lines()
        .take(max_lines)
        .map(|line| {
            if line.chars().count() > max_cols {
                let clipped = line.chars().take(max_cols).collect::<String>();
                format!("{clipped}...")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    if total > max_lines {
        out.push_str(&format!("\n... ({} more lines)", total - max_lines));
    }
    out
}

pub fn sanitize_tool_name(name: &str) -> String {
    let cleaned = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(48)
        .collect::<String>();
    if cleaned.is_empty() {
        "tool".to_string()
    } else {
        cleaned
    }
}

/// `<tool>-<UTC timestamp>-<12 hex chars of sha256(signature, content)>.log`
fn artifact_file_name(
    tool_name: &str,
    signature: Option<&str>,
    content: &str,
    now: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signature.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let short = digest
        .iter()
        .take(6)
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!(
        "{}-{}-{short}.log",
        sanitize_tool_name(tool_name),
        now.format("%Y%m%dT%H%M%SZ")
    )
}

/// Splits a persisted artifact into its header lines and raw body.
pub fn split_artifact(text: &str) -> Option<(&str, &str)> {
    text.split_once("\n\n")
}
