/// Container runtime seam and the Docker CLI implementation
///
/// Each containerized step gets its own directory inside the container,
/// `/buildstep/steps/<id>`, holding `script/`, `dependencies/` and `output/`.
/// Because the directory is keyed by id, files inherited from a base result
/// image never collide with the current step's.
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use super::watch::{Interruption, Watchdog};
use super::{copy_tree, StagedDependency, StepLogs};
use crate::error::ExecutionError;
use crate::step::{Script, StepId};

/// Top-level directory the engine owns inside containers
pub const CONTAINER_ROOT: &str = "/buildstep";

/// Parameters for creating a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub platform: Option<String>,
    pub env: Vec<(String, String)>,
    pub command: Vec<String>,
    pub workdir: Option<String>,
}

/// Why starting a container did not yield an exit code
#[derive(Debug)]
pub enum StartError {
    Interrupted(Interruption),
    Failed(ExecutionError),
}

impl From<ExecutionError> for StartError {
    fn from(err: ExecutionError) -> Self {
        Self::Failed(err)
    }
}

/// Operations the engine needs from a container runtime
pub trait ContainerRuntime: Send + Sync {
    /// Whether an image is present locally
    fn image_exists(&self, image: &str) -> Result<bool, ExecutionError>;

    /// Fetch an image from its registry
    fn pull(&self, image: &str, platform: Option<&str>) -> Result<(), ExecutionError>;

    /// Create (but do not start) a container, returning its id
    fn create(&self, spec: &ContainerSpec) -> Result<String, ExecutionError>;

    /// Copy a host path into a container directory
    fn copy_into(&self, container: &str, src: &Path, dest: &str) -> Result<(), ExecutionError>;

    /// Copy a container path out to a host path that does not exist yet
    fn copy_out(&self, container: &str, src: &str, dest: &Path) -> Result<(), ExecutionError>;

    /// Start a created container, wait for it, and return its exit code
    fn start(&self, container: &str, logs: &StepLogs, watchdog: &Watchdog)
        -> Result<i32, StartError>;

    /// Commit a container's filesystem as a tagged image
    fn commit(&self, container: &str, tag: &str) -> Result<(), ExecutionError>;

    /// Remove a container, stopping it if needed
    fn remove(&self, container: &str) -> Result<(), ExecutionError>;
}

/// Removes its container on drop, whatever happened in between
pub struct ContainerGuard<'a> {
    runtime: &'a dyn ContainerRuntime,
    id: String,
}

impl<'a> ContainerGuard<'a> {
    pub fn create(
        runtime: &'a dyn ContainerRuntime,
        spec: &ContainerSpec,
    ) -> Result<Self, ExecutionError> {
        let id = runtime.create(spec)?;
        debug!(container = %id, image = %spec.image, "container created");
        Ok(Self { runtime, id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.remove(&self.id) {
            warn!(container = %self.id, error = %e, "failed to remove container");
        }
    }
}

/// Paths of one step inside its container
#[derive(Debug, Clone)]
pub struct ContainerLayout {
    root: String,
}

impl ContainerLayout {
    pub fn for_step(id: &StepId) -> Self {
        Self {
            root: format!("{CONTAINER_ROOT}/steps/{id}"),
        }
    }

    pub fn root(&self) -> String {
        self.root.clone()
    }

    pub fn output_dir(&self) -> String {
        format!("{}/output", self.root)
    }

    pub fn dependencies_dir(&self) -> String {
        format!("{}/dependencies", self.root)
    }

    pub fn dependency_dir(&self, dependency: &StagedDependency) -> String {
        format!("{}/{}", self.dependencies_dir(), dependency.dir_name())
    }

    pub fn script_path(&self, script: &Script) -> String {
        format!("{}/script/{}", self.root, script.file_name())
    }

    /// Mirror the layout on the host under `stage_root`.
    ///
    /// Returns the staged `buildstep` directory; copying it into the
    /// container's `/` merges it with whatever the image already holds.
    pub fn stage(
        &self,
        stage_root: &Path,
        script: &Script,
        dependencies: &[StagedDependency],
    ) -> std::io::Result<PathBuf> {
        let host_root = stage_root.join(self.root.trim_start_matches('/'));

        let script_dir = host_root.join("script");
        fs::create_dir_all(&script_dir)?;
        fs::write(script_dir.join(script.file_name()), script.content())?;
        make_executable(&script_dir.join(script.file_name()))?;

        fs::create_dir_all(host_root.join("output"))?;

        let dependencies_dir = host_root.join("dependencies");
        fs::create_dir_all(&dependencies_dir)?;
        for dependency in dependencies {
            copy_tree(
                &dependency.output_dir,
                &dependencies_dir.join(dependency.dir_name()),
            )?;
        }

        Ok(stage_root.join(CONTAINER_ROOT.trim_start_matches('/')))
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Container runtime driven through the `docker` command line
pub struct DockerCli {
    program: PathBuf,
}

impl DockerCli {
    /// Use the given executable (`docker`, `podman`, ...), resolved on PATH
    pub fn new(program: &str) -> Self {
        let program = which::which(program).unwrap_or_else(|_| PathBuf::from(program));
        Self { program }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a short docker command, returning trimmed stdout
    fn run(&self, operation: &'static str, args: &[&str]) -> Result<String, ExecutionError> {
        let output = self
            .command()
            .args(args)
            .output()
            .map_err(|source| ExecutionError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(ExecutionError::container(
                operation,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl ContainerRuntime for DockerCli {
    fn image_exists(&self, image: &str) -> Result<bool, ExecutionError> {
        let status = self
            .command()
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| ExecutionError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        Ok(status.success())
    }

    fn pull(&self, image: &str, platform: Option<&str>) -> Result<(), ExecutionError> {
        let mut args = vec!["pull", "--quiet"];
        if let Some(platform) = platform {
            args.extend(["--platform", platform]);
        }
        args.push(image);
        self.run("pull", &args).map(|_| ())
    }

    fn create(&self, spec: &ContainerSpec) -> Result<String, ExecutionError> {
        let mut args: Vec<String> = vec!["create".to_string()];
        if let Some(platform) = &spec.platform {
            args.push("--platform".to_string());
            args.push(platform.clone());
        }
        if let Some(workdir) = &spec.workdir {
            args.push("--workdir".to_string());
            args.push(workdir.clone());
        }
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run("create", &args)
    }

    fn copy_into(&self, container: &str, src: &Path, dest: &str) -> Result<(), ExecutionError> {
        let src = src.display().to_string();
        let dest = format!("{container}:{dest}");
        self.run("copy files into container", &["cp", &src, &dest])
            .map(|_| ())
    }

    fn copy_out(&self, container: &str, src: &str, dest: &Path) -> Result<(), ExecutionError> {
        let src = format!("{container}:{src}");
        let dest = dest.display().to_string();
        self.run("copy files out of container", &["cp", &src, &dest])
            .map(|_| ())
    }

    fn start(
        &self,
        container: &str,
        logs: &StepLogs,
        watchdog: &Watchdog,
    ) -> Result<i32, StartError> {
        let open = |path: &Path| -> Result<File, ExecutionError> {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ExecutionError::io(container, e))
        };

        let mut child = self
            .command()
            .args(["start", "--attach", container])
            .stdout(Stdio::from(open(&logs.stdout)?))
            .stderr(Stdio::from(open(&logs.stderr)?))
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        match watchdog.wait(&mut child) {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(interruption)) => {
                // Detaching the client does not stop the container
                if let Err(e) = self.run("kill", &["kill", container]) {
                    debug!(container, error = %e, "kill after interruption failed");
                }
                Err(StartError::Interrupted(interruption))
            }
            Err(e) => Err(StartError::Failed(ExecutionError::io(container, e))),
        }
    }

    fn commit(&self, container: &str, tag: &str) -> Result<(), ExecutionError> {
        self.run("commit", &["commit", container, tag]).map(|_| ())
    }

    fn remove(&self, container: &str) -> Result<(), ExecutionError> {
        self.run("remove", &["rm", "--force", container]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Step;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths_are_keyed_by_id() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("final.py");
        fs::write(&script, "print('x')\n").unwrap();
        let step = Step::builder("final", &script).build().unwrap();

        let layout = ContainerLayout::for_step(step.id());
        let root = format!("/buildstep/steps/{}", step.id());
        assert_eq!(layout.root(), root);
        assert_eq!(layout.output_dir(), format!("{root}/output"));
        assert_eq!(layout.script_path(step.script()), format!("{root}/script/final.py"));

        let dependency = StagedDependency {
            position: 1,
            name: "dep".to_string(),
            output_dir: temp.path().to_path_buf(),
        };
        assert_eq!(
            layout.dependency_dir(&dependency),
            format!("{root}/dependencies/1-dep")
        );
    }

    #[test]
    fn test_stage_mirrors_layout() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("run.sh");
        fs::write(&script, "echo hi\n").unwrap();
        let step = Step::builder("run", &script).build().unwrap();

        let dep_output = temp.path().join("dep");
        fs::create_dir_all(&dep_output).unwrap();
        fs::write(dep_output.join("result.txt"), "DEP").unwrap();

        let layout = ContainerLayout::for_step(step.id());
        let stage_root = temp.path().join("stage");
        let staged = layout
            .stage(
                &stage_root,
                step.script(),
                &[StagedDependency {
                    position: 0,
                    name: "dep".to_string(),
                    output_dir: dep_output,
                }],
            )
            .unwrap();

        assert_eq!(staged, stage_root.join("buildstep"));
        let step_root = staged.join("steps").join(step.id().as_str());
        assert!(step_root.join("script/run.sh").exists());
        assert!(step_root.join("output").is_dir());
        assert_eq!(
            fs::read_to_string(step_root.join("dependencies/0-dep/result.txt")).unwrap(),
            "DEP"
        );
    }
}
