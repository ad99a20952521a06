// Common test utilities shared across integration tests
//
// ## Fake container runtime
//
// `DirRuntime` implements the container runtime seam with plain directories
// so container-mode pipelines can be tested without a Docker daemon:
//
// - an image is a directory snapshot under `<root>/images/`
// - a container is a copy of its image under `<root>/containers/`
// - `start` runs the container command on the host, with every argument,
//   environment value and working directory under `/buildstep` rewritten
//   into the container's directory
// - `commit` snapshots the container directory as a new image
//
// Everything lives in a temp directory owned by the runtime.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use buildstep::error::ExecutionError;
use buildstep::runner::container::{ContainerRuntime, ContainerSpec, StartError, CONTAINER_ROOT};
use buildstep::runner::{copy_tree, StepLogs, Watchdog};
use buildstep::step::{Architecture, ImageRef, Step};
use tempfile::TempDir;

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/scripts")
}

pub fn fixture(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

/// Lines appended to a run log by the fixture scripts
pub fn run_log(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

struct Container {
    rootfs: PathBuf,
    spec: ContainerSpec,
}

pub struct DirRuntime {
    root: TempDir,
    images: Mutex<HashMap<String, PathBuf>>,
    /// Images `pull` can fetch, by tag
    registry: Mutex<HashMap<String, PathBuf>>,
    containers: Mutex<HashMap<String, Container>>,
    next_id: AtomicUsize,
    pub starts: AtomicUsize,
    pub commits: AtomicUsize,
}

impl DirRuntime {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
            images: Mutex::new(HashMap::new()),
            registry: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        }
    }

    /// Register an empty base image
    pub fn add_image(&self, name: &str) {
        let dir = self.image_dir(name);
        fs::create_dir_all(&dir).unwrap();
        self.images.lock().unwrap().insert(name.to_string(), dir);
    }

    /// Push a local image to the registry and drop the local copy
    pub fn publish(&self, name: &str) {
        let local = self.images.lock().unwrap().remove(name).unwrap();
        let pushed = self.root.path().join("registry").join(local.file_name().unwrap());
        if pushed.exists() {
            fs::remove_dir_all(&pushed).unwrap();
        }
        copy_tree(&local, &pushed).unwrap();
        fs::remove_dir_all(&local).unwrap();
        self.registry.lock().unwrap().insert(name.to_string(), pushed);
    }

    pub fn has_image(&self, name: &str) -> bool {
        self.images.lock().unwrap().contains_key(name)
    }

    pub fn forget_image(&self, name: &str) {
        if let Some(dir) = self.images.lock().unwrap().remove(name) {
            let _ = fs::remove_dir_all(dir);
        }
    }

    pub fn live_containers(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    fn image_dir(&self, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.root.path().join("images").join(safe)
    }

    fn rootfs(&self, container: &str) -> Result<PathBuf, ExecutionError> {
        self.containers
            .lock()
            .unwrap()
            .get(container)
            .map(|c| c.rootfs.clone())
            .ok_or_else(|| ExecutionError::container("find container", container.to_string()))
    }
}

/// Map a container path onto the container's directory
fn rewrite(rootfs: &Path, value: &str) -> String {
    if value.starts_with(CONTAINER_ROOT) {
        rootfs
            .join(value.trim_start_matches('/'))
            .display()
            .to_string()
    } else {
        value.to_string()
    }
}

impl ContainerRuntime for DirRuntime {
    fn image_exists(&self, image: &str) -> Result<bool, ExecutionError> {
        Ok(self.has_image(image))
    }

    fn pull(&self, image: &str, _platform: Option<&str>) -> Result<(), ExecutionError> {
        let Some(pushed) = self.registry.lock().unwrap().get(image).cloned() else {
            return Err(ExecutionError::container("pull", format!("{image}: not found")));
        };
        let dir = self.image_dir(image);
        copy_tree(&pushed, &dir).map_err(|e| ExecutionError::io("pull", e))?;
        self.images.lock().unwrap().insert(image.to_string(), dir);
        Ok(())
    }

    fn create(&self, spec: &ContainerSpec) -> Result<String, ExecutionError> {
        let image_dir = self
            .images
            .lock()
            .unwrap()
            .get(&spec.image)
            .cloned()
            .ok_or_else(|| ExecutionError::container("create", format!("no such image: {}", spec.image)))?;

        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let rootfs = self.root.path().join("containers").join(&id);
        copy_tree(&image_dir, &rootfs).map_err(|e| ExecutionError::io("create", e))?;

        self.containers.lock().unwrap().insert(
            id.clone(),
            Container {
                rootfs,
                spec: spec.clone(),
            },
        );
        Ok(id)
    }

    fn copy_into(&self, container: &str, src: &Path, dest: &str) -> Result<(), ExecutionError> {
        let rootfs = self.rootfs(container)?;
        let name = src.file_name().unwrap();
        let target = rootfs.join(dest.trim_start_matches('/')).join(name);
        copy_tree(src, &target).map_err(|e| ExecutionError::io("copy", e))
    }

    fn copy_out(&self, container: &str, src: &str, dest: &Path) -> Result<(), ExecutionError> {
        let source = self.rootfs(container)?.join(src.trim_start_matches('/'));
        if !source.is_dir() {
            return Err(ExecutionError::container(
                "copy files out of container",
                format!("no such path: {src}"),
            ));
        }
        copy_tree(&source, dest).map_err(|e| ExecutionError::io("copy", e))
    }

    fn start(&self, container: &str, logs: &StepLogs, watchdog: &Watchdog) -> Result<i32, StartError> {
        self.starts.fetch_add(1, Ordering::SeqCst);

        let (rootfs, spec) = {
            let containers = self.containers.lock().unwrap();
            let c = containers
                .get(container)
                .ok_or_else(|| ExecutionError::container("start", container.to_string()))?;
            (c.rootfs.clone(), c.spec.clone())
        };

        let args: Vec<String> = spec.command.iter().map(|a| rewrite(&rootfs, a)).collect();
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]);
        for (key, value) in &spec.env {
            cmd.env(key, rewrite(&rootfs, value));
        }
        if let Some(workdir) = &spec.workdir {
            cmd.current_dir(rewrite(&rootfs, workdir));
        }

        let open = |path: &Path| OpenOptions::new().create(true).append(true).open(path).unwrap();
        cmd.stdin(Stdio::null())
            .stdout(open(&logs.stdout))
            .stderr(open(&logs.stderr));

        let mut child = cmd
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                program: args[0].clone(),
                source,
            })?;

        match watchdog.wait(&mut child) {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(interruption)) => Err(StartError::Interrupted(interruption)),
            Err(e) => Err(StartError::Failed(ExecutionError::io(container, e))),
        }
    }

    fn commit(&self, container: &str, tag: &str) -> Result<(), ExecutionError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let rootfs = self.rootfs(container)?;
        let dir = self.image_dir(tag);
        if dir.exists() {
            fs::remove_dir_all(&dir).unwrap();
        }
        copy_tree(&rootfs, &dir).map_err(|e| ExecutionError::io("commit", e))?;
        self.images.lock().unwrap().insert(tag.to_string(), dir);
        Ok(())
    }

    fn remove(&self, container: &str) -> Result<(), ExecutionError> {
        if let Some(c) = self.containers.lock().unwrap().remove(container) {
            let _ = fs::remove_dir_all(c.rootfs);
        }
        Ok(())
    }
}

/// Where the three-step scenario runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Host,
    Container,
}

pub const BASE_IMAGE: &str = "debian:bullseye";

/// The base / dependency / final scenario
pub struct Scenario {
    pub base: Step,
    pub dependency: Step,
    pub final_step: Step,
    pub run_log: PathBuf,
}

impl Scenario {
    /// Build the scenario; `work` holds the run log and, on the host, the marker
    pub fn new(placement: Placement, work: &Path, final_script: &str) -> Self {
        let run_log = work.join("runs.log");
        let marker = match placement {
            Placement::Host => work.join("marker/base.txt").display().to_string(),
            Placement::Container => format!("{CONTAINER_ROOT}/marker/base.txt"),
        };
        let image = ImageRef::new(BASE_IMAGE, Architecture::X86_64);

        let with_image = |builder: buildstep::step::StepBuilder| match placement {
            Placement::Host => builder,
            Placement::Container => builder.base_image(image.clone()),
        };

        let base = with_image(
            Step::builder("base", fixture("base_step.sh"))
                .setting("INPUT", "BASE")
                .setting("BASE_MARKER", marker.clone())
                .setting("RUN_LOG", run_log.display().to_string()),
        )
        .build()
        .unwrap();

        let dependency = with_image(
            Step::builder("dependency", fixture("dependency_step.sh"))
                .setting("INPUT", "DEPENDENCY")
                .setting("RUN_LOG", run_log.display().to_string()),
        )
        .build()
        .unwrap();

        let final_step = Step::builder("final", fixture(final_script))
            .setting("INPUT", "FINAL")
            .setting("BASE_MARKER", marker)
            .setting("RUN_LOG", run_log.display().to_string())
            .base_step(base.clone())
            .dependency(dependency.clone())
            .build()
            .unwrap();

        Self {
            base,
            dependency,
            final_step,
            run_log,
        }
    }
}
