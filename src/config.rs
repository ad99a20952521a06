use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::EngineOptions;

/// Complete buildstep configuration (loaded from `buildstep.toml`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildstepConfig {
    /// Pipeline catalog, relative to the config file
    #[serde(default = "default_catalog")]
    pub catalog: String,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub container: ContainerConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Directory relative paths resolve against
    #[serde(skip)]
    root: PathBuf,
}

impl Default for BuildstepConfig {
    fn default() -> Self {
        Self {
            catalog: default_catalog(),
            cache: CacheConfig::default(),
            container: ContainerConfig::default(),
            execution: ExecutionConfig::default(),
            root: PathBuf::from("."),
        }
    }
}

/// Host result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// Cache directory (default `<build-root>/cache`)
    #[serde(default)]
    pub dir: Option<String>,

    /// Appended to ids printed by `list-ids`, to version external cache keys
    #[serde(default)]
    pub version_suffix: Option<String>,
}

/// Container runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Runtime executable
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Repository result images are tagged into
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Try the registry when a result image is not present locally
    #[serde(default = "default_true")]
    pub pull: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            repository: default_repository(),
            pull: true,
        }
    }
}

/// Step execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Per-script timeout ("30s", "10m", "2h", "1d")
    #[serde(default)]
    pub timeout: Option<String>,

    #[serde(default = "default_true")]
    pub parallel_dependencies: bool,

    /// Scripts running at once (0 = number of CPUs)
    #[serde(default)]
    pub max_parallel: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            parallel_dependencies: true,
            max_parallel: 0,
        }
    }
}

fn default_catalog() -> String {
    "pipelines.toml".to_string()
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_repository() -> String {
    "buildstep".to_string()
}

fn default_true() -> bool {
    true
}

impl BuildstepConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: BuildstepConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        Ok(config.with_root(root))
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.resolve(&self.catalog)
    }

    /// Cache directory for a build root
    pub fn cache_dir(&self, build_root: &Path) -> PathBuf {
        match &self.cache.dir {
            Some(dir) => self.resolve(dir),
            None => build_root.join("cache"),
        }
    }

    pub fn timeout(&self) -> Result<Option<Duration>> {
        self.execution
            .timeout
            .as_deref()
            .map(parse_duration)
            .transpose()
    }

    /// Engine options for a build root
    pub fn engine_options(&self, build_root: &Path) -> Result<EngineOptions> {
        Ok(EngineOptions {
            cache_dir: Some(self.cache_dir(build_root)),
            repository: self.container.repository.clone(),
            pull: self.container.pull,
            timeout: self.timeout()?,
            parallel_dependencies: self.execution.parallel_dependencies,
            max_parallel: match self.execution.max_parallel {
                0 => num_cpus::get(),
                n => n,
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.catalog.is_empty() {
            bail!("catalog must be set");
        }

        if self.container.runtime.is_empty() {
            bail!("container.runtime must be set");
        }

        let repository = &self.container.repository;
        if repository.is_empty() {
            bail!("container.repository must be set");
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            bail!("container.repository must be lowercase: {}", repository);
        }
        let last_segment = repository.rsplit('/').next().unwrap_or(repository);
        if last_segment.contains(':') || repository.contains('@') {
            bail!("container.repository must not include a tag or digest: {}", repository);
        }

        if let Some(suffix) = &self.cache.version_suffix {
            if suffix.is_empty() || suffix.chars().any(char::is_whitespace) {
                bail!("cache.version_suffix must be non-empty and contain no whitespace");
            }
        }

        self.timeout().context("Invalid execution.timeout")?;

        Ok(())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Parse a duration like "30s", "10m", "2h" or "1d"
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("Empty duration string");
    }
    if !s.is_ascii() {
        bail!("Invalid duration: {}", s);
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: u64 = num_str
        .parse()
        .map_err(|_| anyhow!("Invalid duration: {}", s))?;

    let seconds = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        "d" => num * 86400,
        _ => bail!("Invalid duration unit: {}. Use: s, m, h, d", unit),
    };

    Ok(Duration::from_secs(seconds))
}
