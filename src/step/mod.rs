//! Build steps: immutable descriptors with a content-derived identity
//!
//! A step is a script, its settings, an optional base (an external image or
//! another step) and an ordered list of dependency steps. The id is computed
//! once in [`StepBuilder::build`] and never changes afterwards.

pub mod graph;
pub mod identity;
pub mod image;
pub mod script;
pub mod settings;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::ConstructionError;

pub use graph::{closure, closure_ids, closure_of_all};
pub use identity::{compute_step_id, BaseInput, StepId};
pub use image::{Architecture, ImageRef};
pub use script::{Script, ScriptKind};
pub use settings::Settings;

/// What a step runs on top of
#[derive(Debug, Clone, Default)]
pub enum Base {
    /// Unsandboxed, on the host
    #[default]
    Absent,
    /// A pulled image
    Image(ImageRef),
    /// Another step's result
    Step(Step),
}

/// How a step's output is meant to be used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Consumed as input by later steps
    #[default]
    Dependency,
    /// A final artifact of a pipeline
    Artifact,
}

/// Where a step's script runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Host,
    Container,
}

/// A build step. Cheap to clone; clones share the same descriptor.
#[derive(Clone)]
pub struct Step(Arc<StepInner>);

struct StepInner {
    name: String,
    script: Script,
    settings: Settings,
    base: Base,
    dependencies: Vec<Step>,
    cacheable: bool,
    role: Role,
    id: StepId,
}

impl Step {
    pub fn builder(name: impl Into<String>, script_path: impl Into<PathBuf>) -> StepBuilder {
        StepBuilder::new(name, script_path)
    }

    pub fn id(&self) -> &StepId {
        &self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn script(&self) -> &Script {
        &self.0.script
    }

    pub fn settings(&self) -> &Settings {
        &self.0.settings
    }

    pub fn base(&self) -> &Base {
        &self.0.base
    }

    pub fn dependencies(&self) -> &[Step] {
        &self.0.dependencies
    }

    pub fn is_cacheable(&self) -> bool {
        self.0.cacheable
    }

    pub fn role(&self) -> Role {
        self.0.role
    }

    /// The external image at the root of the base chain, if any
    pub fn root_image(&self) -> Option<&ImageRef> {
        let mut current = self;
        loop {
            match current.base() {
                Base::Absent => return None,
                Base::Image(image) => return Some(image),
                Base::Step(step) => current = step,
            }
        }
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        if self.root_image().is_some() {
            ExecutionMode::Container
        } else {
            ExecutionMode::Host
        }
    }

    /// Ids of every cacheable step this step needs, itself included
    pub fn all_used_cacheable_ids(&self) -> Vec<StepId> {
        closure_ids(self)
    }
}

impl PartialEq for Step {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Step {}

impl std::hash::Hash for Step {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name())
            .field("id", &self.id().short())
            .field("cacheable", &self.is_cacheable())
            .finish()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id().short())
    }
}

/// Collects a step's inputs; [`StepBuilder::build`] validates and hashes them
pub struct StepBuilder {
    name: String,
    script_path: PathBuf,
    settings: Vec<(String, String)>,
    base: Base,
    dependencies: Vec<Step>,
    cacheable: bool,
    role: Role,
}

impl StepBuilder {
    pub fn new(name: impl Into<String>, script_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script_path: script_path.into(),
            settings: Vec::new(),
            base: Base::Absent,
            dependencies: Vec::new(),
            cacheable: true,
            role: Role::default(),
        }
    }

    pub fn setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.push((key.into(), value.into()));
        self
    }

    pub fn settings<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.settings
            .extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn base(mut self, base: Base) -> Self {
        self.base = base;
        self
    }

    pub fn base_image(self, image: ImageRef) -> Self {
        self.base(Base::Image(image))
    }

    pub fn base_step(self, step: Step) -> Self {
        self.base(Base::Step(step))
    }

    pub fn dependency(mut self, step: Step) -> Self {
        self.dependencies.push(step);
        self
    }

    pub fn dependencies(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.dependencies.extend(steps);
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Read the script, validate settings and compute the id
    pub fn build(self) -> Result<Step, ConstructionError> {
        let script = Script::load(&self.script_path)?;
        let settings = Settings::from_pairs(self.settings)?;

        let base_input = match &self.base {
            Base::Absent => BaseInput::Absent,
            Base::Image(image) => BaseInput::Image(image),
            Base::Step(step) => BaseInput::Step(step.id()),
        };
        let dependency_ids: Vec<&StepId> = self.dependencies.iter().map(Step::id).collect();

        let id = compute_step_id(script.content(), &settings, base_input, &dependency_ids);

        Ok(Step(Arc::new(StepInner {
            name: self.name,
            script,
            settings,
            base: self.base,
            dependencies: self.dependencies,
            cacheable: self.cacheable,
            role: self.role,
            id,
        })))
    }
}
