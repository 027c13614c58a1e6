use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::debug;

use crate::template::{BackendConfig, BackendOverride};

pub const USER_BACKEND_FILE: &str = ".miga_daemon.json";

/// `MIGA_HOME`, o `HOME`, o el directorio actual.
pub fn miga_home() -> PathBuf {
    env::var_os("MIGA_HOME")
        .or_else(|| env::var_os("HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn read_override(path: &Path) -> Result<BackendOverride> {
    let raw = fs::read(path).with_context(|| format!("leyendo {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parseando {}", path.display()))
}

/// Capas, de menor a mayor prioridad: default, `$MIGA_HOME/.miga_daemon.json`,
/// `<proyecto>/daemon/daemon.json`, y el `--json` explícito.
pub fn load_backend_from(
    home: &Path,
    project: &Path,
    extra: Option<&Path>,
) -> Result<BackendConfig> {
    let mut config = BackendConfig::default();

    let layers = [
        Some(home.join(USER_BACKEND_FILE)),
        Some(project.join("daemon").join("daemon.json")),
    ];
    for path in layers.into_iter().flatten() {
        if path.is_file() {
            debug!("config de backend: {}", path.display());
            config.merge(read_override(&path)?);
        }
    }
    if let Some(path) = extra {
        config.merge(read_override(path)?);
    }

    if config.scripts.is_none() {
        config.scripts = Some(home.join("scripts"));
    }
    Ok(config)
}

pub fn load_backend(project: &Path, extra: Option<&Path>) -> Result<BackendConfig> {
    load_backend_from(&miga_home(), project, extra)
}

/// Un host por línea; vacías y `#` se ignoran.
pub fn read_node_list(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("leyendo lista de nodos {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}
