use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "POSTERN_CONFIG";

/// Find the configuration file using the following precedence:
/// 1. `POSTERN_CONFIG` environment variable
/// 2. ./postern.config.ron (current working directory)
/// 3. /etc/postern/postern.config.ron (system-wide config)
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    let defaults = [
        PathBuf::from("./postern.config.ron"),
        PathBuf::from("/etc/postern/postern.config.ron"),
    ];

    find_in(std::env::var(CONFIG_ENV).ok(), &defaults)
}

fn find_in(env: Option<String>, defaults: &[PathBuf]) -> anyhow::Result<PathBuf> {
    if let Some(env_path) = env {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

/// Reads the file at `path`, mapping failures to an error naming it
pub fn read(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config from {}: {e}", path.display()))
}
