/// Error taxonomy for the build-step engine
///
/// Construction errors are fatal and surface before any identity exists,
/// execution errors fail the owning step and abort whatever depends on it,
/// and cache errors are downgraded to misses by the engine.
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid step descriptor or catalog entry
#[derive(Error, Debug)]
pub enum ConstructionError {
    #[error("Failed to read script {path}: {source}")]
    UnreadableScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Duplicate setting key: {0}")]
    DuplicateSetting(String),

    #[error("Invalid setting key {key:?}: {reason}")]
    InvalidSetting { key: String, reason: &'static str },

    #[error("Setting key {0} uses the reserved STEP_ prefix")]
    ReservedSetting(String),

    #[error("Cyclic base or dependency reference through step: {0}")]
    Cycle(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Unknown architecture: {0}. Supported: x86_64, aarch64, armv7")]
    UnknownArchitecture(String),

    #[error("Invalid catalog {path}: {message}")]
    Catalog { path: PathBuf, message: String },
}

/// A step could not be executed to completion
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Step {step} failed with exit code {exit_code}")]
    ScriptFailed { step: String, exit_code: i32 },

    #[error("Step {step} timed out after {timeout:?}")]
    TimedOut { step: String, timeout: Duration },

    #[error("Step {step} was cancelled")]
    Cancelled { step: String },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Container runtime failed to {operation}: {message}")]
    Container {
        operation: &'static str,
        message: String,
    },

    #[error("Step {step} depends on {upstream}, which failed: {message}")]
    Upstream {
        step: String,
        upstream: String,
        message: String,
    },

    #[error("Step {step} failed: {message}")]
    Failed { step: String, message: String },

    #[error("I/O error while running step {step}: {source}")]
    Io {
        step: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecutionError {
    pub fn io(step: &str, source: std::io::Error) -> Self {
        Self::Io {
            step: step.to_string(),
            source,
        }
    }

    pub fn container(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Container {
            operation,
            message: message.into(),
        }
    }

    /// True when the failure came from cancellation rather than the step itself
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Cache store unreachable or holding a damaged entry
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache store unreachable at {path}: {source}")]
    Unreachable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image cache unavailable for {image}: {message}")]
    Registry { image: String, message: String },

    #[error("Corrupted cache entry {id}: {reason}")]
    Corrupted { id: String, reason: String },

    #[error("Failed to write cache entry {id}: {message}")]
    Write { id: String, message: String },
}

/// Crate-level error
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
