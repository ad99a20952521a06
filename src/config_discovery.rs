use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::BuildstepConfig;

pub const CONFIG_FILE_NAME: &str = "buildstep.toml";

/// Find `buildstep.toml` in `start_dir` or any ancestor, then the global config
pub fn discover_config(start_dir: &Path) -> Option<PathBuf> {
    for dir in start_dir.ancestors() {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if config_path.is_file() {
            return Some(config_path);
        }
    }

    let global_config = dirs::home_dir()?.join(".config/buildstep/config.toml");
    global_config.is_file().then_some(global_config)
}

/// Load the explicit config, else the discovered one, else defaults.
///
/// Relative paths in the config resolve against its directory; with no
/// config file they resolve against the current directory.
pub fn load_config_with_discovery(explicit_path: Option<&Path>) -> Result<BuildstepConfig> {
    if let Some(config_path) = explicit_path {
        return BuildstepConfig::from_file(config_path);
    }

    let current_dir =
        std::env::current_dir().context("Failed to get current directory for config discovery")?;

    match discover_config(&current_dir) {
        Some(config_path) => {
            tracing::debug!(config = %config_path.display(), "using discovered config");
            BuildstepConfig::from_file(&config_path)
        }
        None => {
            tracing::debug!("no configuration file found, using defaults");
            Ok(BuildstepConfig::default().with_root(current_dir))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_discover_config_finds_nearest() {
        let temp = TempDir::new().unwrap();
        let project = temp.path().join("project");
        let subdir = project.join("nested/deeper");
        fs::create_dir_all(&subdir).unwrap();

        let config_path = project.join(CONFIG_FILE_NAME);
        fs::write(&config_path, "catalog = \"ci/pipelines.toml\"\n").unwrap();

        assert_eq!(discover_config(&subdir), Some(config_path.clone()));

        let config = load_config_with_discovery(Some(&config_path)).unwrap();
        assert_eq!(config.catalog_path(), project.join("ci/pipelines.toml"));
    }
}
