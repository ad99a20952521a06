/// Pipeline catalog loaded from TOML
///
/// ```toml
/// [steps.base]
/// script = "scripts/base.sh"
/// base = { image = "debian:bullseye", architecture = "x86_64" }
/// settings = { INPUT = "BASE" }
///
/// [steps.final]
/// script = "scripts/final.py"
/// base = { step = "base" }
/// dependencies = ["dependency"]
/// role = "artifact"
///
/// [pipelines]
/// image-build = ["final"]
/// ```
///
/// Script paths are relative to the catalog file. Steps are built on demand,
/// each exactly once, so a step shared by several pipelines is the same
/// object everywhere.
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConstructionError;
use crate::pipeline::PipelineRegistry;
use crate::step::{Architecture, Base, ImageRef, Role, Step};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    steps: BTreeMap<String, StepEntry>,
    #[serde(default)]
    pipelines: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepEntry {
    script: PathBuf,
    #[serde(default)]
    base: Option<BaseEntry>,
    #[serde(default)]
    settings: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default = "default_cacheable")]
    cacheable: bool,
    #[serde(default)]
    role: Role,
}

fn default_cacheable() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BaseEntry {
    Image {
        image: String,
        #[serde(default = "default_architecture")]
        architecture: String,
    },
    Step {
        step: String,
    },
}

fn default_architecture() -> String {
    "x86_64".to_string()
}

/// A parsed catalog
#[derive(Debug, Clone)]
pub struct Catalog {
    path: PathBuf,
    root: PathBuf,
    file: CatalogFile,
}

impl Catalog {
    /// Load a catalog file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConstructionError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConstructionError::Catalog {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let root = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        Self::parse(&content, path, root)
    }

    /// Parse catalog content; relative script paths resolve against `root`
    pub fn parse(
        content: &str,
        path: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
    ) -> Result<Self, ConstructionError> {
        let path = path.into();
        let file: CatalogFile = toml::from_str(content).map_err(|e| ConstructionError::Catalog {
            path: path.clone(),
            message: e.to_string(),
        })?;

        Ok(Self {
            path,
            root: root.into(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build every pipeline into a registry
    pub fn build_registry(&self) -> Result<PipelineRegistry, ConstructionError> {
        let mut builder = StepResolver::new(self);
        let mut registry = PipelineRegistry::new();

        for (pipeline, names) in &self.file.pipelines {
            let terminals = names
                .iter()
                .map(|name| builder.build(name))
                .collect::<Result<Vec<_>, _>>()?;
            registry.add(pipeline.clone(), terminals);
        }

        Ok(registry)
    }

    /// Build a single named step with everything it needs
    pub fn step(&self, name: &str) -> Result<Step, ConstructionError> {
        StepResolver::new(self).build(name)
    }
}

/// Builds steps by name, depth first, detecting cycles
struct StepResolver<'a> {
    catalog: &'a Catalog,
    visiting: HashSet<String>,
    built: HashMap<String, Step>,
}

impl<'a> StepResolver<'a> {
    fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            visiting: HashSet::new(),
            built: HashMap::new(),
        }
    }

    fn build(&mut self, name: &str) -> Result<Step, ConstructionError> {
        if let Some(step) = self.built.get(name) {
            return Ok(step.clone());
        }

        if !self.visiting.insert(name.to_string()) {
            return Err(ConstructionError::Cycle(name.to_string()));
        }

        let entry = self
            .catalog
            .file
            .steps
            .get(name)
            .ok_or_else(|| ConstructionError::UnknownStep(name.to_string()))?;

        let base = match &entry.base {
            None => Base::Absent,
            Some(BaseEntry::Image {
                image,
                architecture,
            }) => Base::Image(ImageRef::new(image.clone(), architecture.parse::<Architecture>()?)),
            Some(BaseEntry::Step { step }) => Base::Step(self.build(step)?),
        };

        let dependencies = entry
            .dependencies
            .iter()
            .map(|dependency| self.build(dependency))
            .collect::<Result<Vec<_>, _>>()?;

        let script = if entry.script.is_absolute() {
            entry.script.clone()
        } else {
            self.catalog.root.join(&entry.script)
        };

        let step = Step::builder(name, script)
            .settings(entry.settings.clone())
            .base(base)
            .dependencies(dependencies)
            .cacheable(entry.cacheable)
            .role(entry.role)
            .build()?;

        self.visiting.remove(name);
        self.built.insert(name.to_string(), step.clone());
        Ok(step)
    }
}
