/// Pipeline registry
///
/// Named lists of terminal steps, built once from a catalog and passed to
/// the command layer. This is the only surface the CLI touches.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::engine::{Engine, Resolved};
use crate::error::{Error, Result};
use crate::logging::{operations, status};
use crate::step::{closure_of_all, Role, Step, StepId};

#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, Vec<Step>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a pipeline
    pub fn add(&mut self, name: impl Into<String>, terminals: Vec<Step>) {
        self.pipelines.insert(name.into(), terminals);
    }

    /// Pipeline names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    pub fn terminals(&self, name: &str) -> Result<&[Step]> {
        self.pipelines
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::UnknownPipeline(name.to_string()))
    }

    /// Ids of every cacheable step the pipeline needs, prerequisites first
    pub fn ids_for(&self, name: &str) -> Result<Vec<StepId>> {
        Ok(self
            .steps_for(name)?
            .iter()
            .map(|step| step.id().clone())
            .collect())
    }

    /// Every cacheable step the pipeline needs, prerequisites first
    pub fn steps_for(&self, name: &str) -> Result<Vec<Step>> {
        Ok(closure_of_all(self.terminals(name)?))
    }

    /// Run a pipeline's steps in closure order, then its terminals.
    ///
    /// Terminals are run explicitly so non-cacheable ones, which the closure
    /// leaves out, still execute.
    pub fn execute(&self, name: &str, engine: &Engine) -> Result<ExecutionReport> {
        let terminals = self.terminals(name)?;
        let start = Instant::now();

        info!(
            pipeline = name,
            operation = operations::PIPELINE_EXECUTE,
            build_root = %engine.build_root().display(),
            "executing pipeline"
        );

        for step in closure_of_all(terminals).iter().chain(terminals) {
            if let Err(e) = engine.run(step) {
                info!(
                    pipeline = name,
                    operation = operations::PIPELINE_EXECUTE,
                    status = status::ERROR,
                    failed_step = %step.name(),
                    "pipeline failed"
                );
                return Err(e.into());
            }
        }

        let report = ExecutionReport::new(name, &engine.completed(), start.elapsed());
        info!(
            pipeline = name,
            operation = operations::PIPELINE_EXECUTE,
            status = status::SUCCESS,
            steps = report.steps.len(),
            cached = report.cached_count(),
            duration_ms = report.duration.as_millis() as u64,
            "pipeline finished"
        );

        Ok(report)
    }
}

/// How a step's result was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Cached,
    Ran,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: String,
    pub id: String,
    pub outcome: StepOutcome,
    pub role: Role,
    pub output_dir: PathBuf,
    pub image: Option<String>,
    pub duration_ms: u64,
}

impl From<&Resolved> for StepReport {
    fn from(resolved: &Resolved) -> Self {
        Self {
            name: resolved.name().to_string(),
            id: resolved.id().to_string(),
            outcome: if resolved.cached {
                StepOutcome::Cached
            } else {
                StepOutcome::Ran
            },
            role: resolved.role(),
            output_dir: resolved.output_dir.clone(),
            image: resolved.image.clone(),
            duration_ms: resolved.duration.as_millis() as u64,
        }
    }
}

/// Result of executing a pipeline
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub pipeline: String,
    /// Resolved steps in completion order
    pub steps: Vec<StepReport>,
    /// Tool directories published by any resolved step
    pub tool_paths: Vec<PathBuf>,
    #[serde(skip)]
    pub duration: Duration,
}

impl ExecutionReport {
    fn new(pipeline: &str, resolved: &[Resolved], duration: Duration) -> Self {
        let mut tool_paths: Vec<PathBuf> = Vec::new();
        for step in resolved {
            for path in &step.tool_paths {
                if !tool_paths.contains(path) {
                    tool_paths.push(path.clone());
                }
            }
        }

        Self {
            pipeline: pipeline.to_string(),
            steps: resolved.iter().map(StepReport::from).collect(),
            tool_paths,
            duration,
        }
    }

    pub fn cached_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Cached)
            .count()
    }

    /// Steps whose output is a final artifact
    pub fn artifacts(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| s.role == Role::Artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn step(temp: &TempDir, name: &str, deps: Vec<Step>) -> Step {
        let script = temp.path().join(format!("{name}.sh"));
        fs::write(&script, format!("echo {name}\n")).unwrap();
        Step::builder(name, script)
            .dependencies(deps)
            .build()
            .unwrap()
    }

    #[test]
    fn test_unknown_pipeline() {
        let registry = PipelineRegistry::new();
        assert!(matches!(
            registry.ids_for("missing"),
            Err(Error::UnknownPipeline(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_ids_deduplicated_across_terminals() {
        let temp = TempDir::new().unwrap();
        let shared = step(&temp, "shared", vec![]);
        let a = step(&temp, "a", vec![shared.clone()]);
        let b = step(&temp, "b", vec![shared.clone()]);

        let mut registry = PipelineRegistry::new();
        registry.add("all", vec![a.clone(), b.clone()]);

        let ids = registry.ids_for("all").unwrap();
        assert_eq!(
            ids,
            vec![shared.id().clone(), a.id().clone(), b.id().clone()]
        );
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["all"]);
    }
}
