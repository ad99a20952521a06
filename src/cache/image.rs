/// Result images as cache entries
///
/// A containerized step's result is the image committed after its run,
/// tagged `<repository>:<id>`. Presence of that tag, locally or in a
/// registry, is the cache hit.
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::CacheError;
use crate::runner::container::{ContainerGuard, ContainerLayout, ContainerRuntime, ContainerSpec};
use crate::step::StepId;

#[derive(Clone)]
pub struct ImageCache {
    runtime: Arc<dyn ContainerRuntime>,
    repository: String,
    pull: bool,
}

impl ImageCache {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, repository: impl Into<String>, pull: bool) -> Self {
        Self {
            runtime,
            repository: repository.into(),
            pull,
        }
    }

    /// Result image tag for a step id
    pub fn tag_for(&self, id: &StepId) -> String {
        format!("{}:{}", self.repository, id)
    }

    /// Find the result image for `id`, pulling it when allowed.
    ///
    /// A failed pull is a miss, not an error: the registry simply may not
    /// have the tag.
    pub fn lookup(&self, id: &StepId, platform: Option<&str>) -> Result<Option<String>, CacheError> {
        let tag = self.tag_for(id);

        let present = self
            .runtime
            .image_exists(&tag)
            .map_err(|e| CacheError::Registry {
                image: tag.clone(),
                message: e.to_string(),
            })?;
        if present {
            return Ok(Some(tag));
        }

        if self.pull {
            match self.runtime.pull(&tag, platform) {
                Ok(()) => return Ok(Some(tag)),
                Err(e) => debug!(image = %tag, error = %e, "result image not in registry"),
            }
        }

        Ok(None)
    }

    /// Copy a result image's output directory to `dest`
    pub fn materialize(
        &self,
        id: &StepId,
        image: &str,
        platform: Option<&str>,
        dest: &Path,
    ) -> Result<(), CacheError> {
        let corrupted = |reason: String| CacheError::Corrupted {
            id: id.to_string(),
            reason,
        };

        let spec = ContainerSpec {
            image: image.to_string(),
            platform: platform.map(str::to_string),
            env: Vec::new(),
            command: vec!["true".to_string()],
            workdir: None,
        };
        let container =
            ContainerGuard::create(self.runtime.as_ref(), &spec).map_err(|e| corrupted(e.to_string()))?;

        if dest.exists() {
            fs::remove_dir_all(dest).map_err(|e| corrupted(e.to_string()))?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| corrupted(e.to_string()))?;
        }

        let layout = ContainerLayout::for_step(id);
        self.runtime
            .copy_out(container.id(), &layout.output_dir(), dest)
            .map_err(|e| corrupted(format!("result image has no output: {e}")))
    }
}
