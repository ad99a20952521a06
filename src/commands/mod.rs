pub mod cache;
pub mod execute;
pub mod list_ids;
pub mod pipelines;

use anyhow::{Context, Result};

use buildstep::catalog::Catalog;
use buildstep::config::BuildstepConfig;
use buildstep::config_discovery::load_config_with_discovery;
use buildstep::error::{ConstructionError, Error, ExecutionError};
use buildstep::pipeline::PipelineRegistry;
use buildstep::runner::CancelToken;

use crate::cli::CommonArgs;

/// Process exit codes
pub mod exit {
    pub const SUCCESS: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const CONSTRUCTION: u8 = 2;
    pub const EXECUTION: u8 = 3;
    pub const UNKNOWN_PIPELINE: u8 = 4;
    pub const CANCELLED: u8 = 130;
}

/// Load and validate the configuration
pub fn load_config(common: &CommonArgs) -> Result<BuildstepConfig> {
    let config = load_config_with_discovery(common.config.as_deref())?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Load the catalog and build every pipeline
pub fn load_registry(common: &CommonArgs, config: &BuildstepConfig) -> Result<PipelineRegistry> {
    let path = common
        .catalog
        .clone()
        .unwrap_or_else(|| config.catalog_path());
    tracing::debug!(catalog = %path.display(), "loading pipeline catalog");

    let catalog = Catalog::load(&path)?;
    Ok(catalog.build_registry()?)
}

/// Exit code for a failed command
pub fn exit_code(err: &anyhow::Error, cancel: &CancelToken) -> u8 {
    if cancel.is_cancelled() {
        return exit::CANCELLED;
    }

    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<Error>() {
            return match e {
                Error::Construction(_) => exit::CONSTRUCTION,
                Error::Execution(e) => execution_exit_code(e),
                Error::Cache(_) => exit::FAILURE,
                Error::UnknownPipeline(_) => exit::UNKNOWN_PIPELINE,
            };
        }
        if cause.downcast_ref::<ConstructionError>().is_some() {
            return exit::CONSTRUCTION;
        }
        if let Some(e) = cause.downcast_ref::<ExecutionError>() {
            return execution_exit_code(e);
        }
    }

    exit::FAILURE
}

fn execution_exit_code(err: &ExecutionError) -> u8 {
    if err.is_cancelled() {
        exit::CANCELLED
    } else {
        exit::EXECUTION
    }
}
