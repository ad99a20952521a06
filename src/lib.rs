// Library interface for buildstep
// The binary and the integration tests drive the engine through these modules

pub mod cache;
pub mod catalog;
pub mod cli_utils;
pub mod config;
pub mod config_discovery;
pub mod engine;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod runner;
pub mod step;

// Re-export commonly used types
pub use catalog::Catalog;
pub use engine::{Engine, EngineOptions, Resolved};
pub use error::{CacheError, ConstructionError, Error, ExecutionError, Result};
pub use pipeline::{ExecutionReport, PipelineRegistry};
pub use step::{Architecture, Base, ImageRef, Role, Step, StepId};
