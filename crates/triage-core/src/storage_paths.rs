use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub tool_output_dir: PathBuf,
}

/// Per-user data locations. `TRIAGE_HOME` overrides the platform data dir.
pub fn resolve_shared_paths() -> anyhow::Result<SharedPaths> {
    let root = match std::env::var("TRIAGE_HOME") {
        Ok(home) if !home.trim().is_empty() => PathBuf::from(home.trim()),
        _ => dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Failed to resolve data dir"))?
            .join("triage"),
    };
    Ok(shared_paths_from_root(root))
}

pub fn shared_paths_from_root(root: PathBuf) -> SharedPaths {
    SharedPaths {
        config_path: root.join("config.json"),
        tool_output_dir: root.join("tool-output"),
        root,
    }
}
