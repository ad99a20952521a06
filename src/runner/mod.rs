/// Script runner
///
/// Runs one step's script with its settings as environment, either directly
/// on the host or inside a container seeded from the step's base image.
/// Stdout and stderr go to log files in the step's work directory; data moves
/// between steps only through output directories.
pub mod container;
pub mod watch;

use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::ExecutionError;
use crate::logging::{operations, status};
use crate::step::{Script, ScriptKind, Settings, StepId};

pub use container::{ContainerRuntime, ContainerSpec, DockerCli};
pub use watch::{CancelToken, Interruption, Watchdog};

/// File a step may leave in its output listing directories to add to PATH
pub const TOOL_PATHS_FILE: &str = "paths.txt";

/// Everything the runner needs to know about one step run
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub step_name: &'a str,
    pub step_id: &'a StepId,
    pub script: &'a Script,
    pub settings: &'a Settings,
    /// Step directory beneath the build root (`<build-root>/steps/<id>`)
    pub workdir: PathBuf,
    pub dependencies: Vec<StagedDependency>,
    /// Directories prepended to PATH for host runs
    pub tool_paths: Vec<PathBuf>,
}

/// A dependency output to expose to the consuming step
#[derive(Debug, Clone)]
pub struct StagedDependency {
    pub position: usize,
    pub name: String,
    pub output_dir: PathBuf,
}

impl StagedDependency {
    /// Directory name under the consumer's dependencies directory
    pub fn dir_name(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}-{}", self.position, name)
    }
}

/// Where to run a containerized step and what to tag its result as
#[derive(Debug, Clone)]
pub struct ContainerTarget {
    pub image: String,
    pub platform: Option<String>,
    pub result_tag: String,
}

/// Result of running a script
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub output_dir: PathBuf,
    /// Committed result image (container runs only, success only)
    pub image: Option<String>,
    pub duration: Duration,
    pub logs: StepLogs,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Paths of the captured stdout/stderr of a run
#[derive(Debug, Clone)]
pub struct StepLogs {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl StepLogs {
    fn create(dir: &Path) -> std::io::Result<(Self, File, File)> {
        fs::create_dir_all(dir)?;
        let logs = Self {
            stdout: dir.join("stdout.log"),
            stderr: dir.join("stderr.log"),
        };
        let stdout = File::create(&logs.stdout)?;
        let stderr = File::create(&logs.stderr)?;
        Ok((logs, stdout, stderr))
    }

    /// Last lines of stderr, for failure reports
    pub fn stderr_tail(&self, lines: usize) -> String {
        let content = fs::read_to_string(&self.stderr).unwrap_or_default();
        let all: Vec<&str> = content.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Runs scripts on the host or through a container runtime
pub struct ScriptRunner {
    containers: Arc<dyn ContainerRuntime>,
    timeout: Option<Duration>,
}

impl ScriptRunner {
    pub fn new(containers: Arc<dyn ContainerRuntime>, timeout: Option<Duration>) -> Self {
        Self {
            containers,
            timeout,
        }
    }

    pub fn containers(&self) -> &Arc<dyn ContainerRuntime> {
        &self.containers
    }

    /// Run a step's script, in a container when a target is given
    pub fn run(
        &self,
        request: &RunRequest<'_>,
        container: Option<&ContainerTarget>,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, ExecutionError> {
        let watchdog = Watchdog::new(cancel.clone(), self.timeout);
        match container {
            Some(target) => self.run_in_container(request, target, &watchdog),
            None => self.run_on_host(request, &watchdog),
        }
    }

    fn run_on_host(
        &self,
        request: &RunRequest<'_>,
        watchdog: &Watchdog,
    ) -> Result<RunOutcome, ExecutionError> {
        let step = request.step_name;
        let start = Instant::now();

        let output_dir = request.workdir.join("output");
        reset_dir(&output_dir).map_err(|e| ExecutionError::io(step, e))?;

        let (logs, stdout, stderr) = StepLogs::create(&request.workdir.join("logs"))
            .map_err(|e| ExecutionError::io(step, e))?;

        // Stage dependency outputs at per-dependency paths
        let dependencies_dir = request.workdir.join("dependencies");
        reset_dir(&dependencies_dir).map_err(|e| ExecutionError::io(step, e))?;
        let mut env = reserved_env(request, &output_dir, &dependencies_dir);
        for dependency in &request.dependencies {
            let staged = dependencies_dir.join(dependency.dir_name());
            copy_tree(&dependency.output_dir, &staged).map_err(|e| ExecutionError::io(step, e))?;
            env.push((
                format!("STEP_DEPENDENCY_{}", dependency.position),
                staged.display().to_string(),
            ));
        }

        let script_path = fs::canonicalize(request.script.path())
            .map_err(|e| ExecutionError::io(step, e))?;

        let mut cmd = match request.script.kind() {
            ScriptKind::Interpreted { program, args } => {
                // Resolve from PATH, falling back to the bare name
                let program_path = which::which(program).unwrap_or_else(|_| PathBuf::from(program));
                let mut cmd = Command::new(program_path);
                cmd.args(args).arg(&script_path);
                cmd
            }
            ScriptKind::Executable => Command::new(&script_path),
        };

        cmd.current_dir(&request.workdir);
        for (key, value) in request.settings.iter() {
            cmd.env(key, value);
        }
        for (key, value) in &env {
            cmd.env(key, value);
        }
        if !request.tool_paths.is_empty() {
            // A PATH setting wins over the engine's own PATH
            let search = request
                .settings
                .get("PATH")
                .map(OsString::from)
                .or_else(|| std::env::var_os("PATH"));
            cmd.env("PATH", prepend_paths(&request.tool_paths, search));
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));

        debug!(step, command = ?cmd, "spawning script");

        let program = cmd.get_program().to_string_lossy().to_string();
        let mut child = cmd
            .spawn()
            .map_err(|source| ExecutionError::Spawn { program, source })?;

        let exit_code = watchdog
            .wait(&mut child)
            .map_err(|e| ExecutionError::io(step, e))?
            .map_err(|interruption| interruption.into_error(step))?;

        let duration = start.elapsed();
        info!(
            step,
            step_id = %request.step_id.short(),
            operation = operations::STEP_RUN,
            mode = "host",
            exit_code,
            duration_ms = duration.as_millis() as u64,
            "script finished"
        );

        Ok(RunOutcome {
            exit_code,
            output_dir,
            image: None,
            duration,
            logs,
        })
    }

    fn run_in_container(
        &self,
        request: &RunRequest<'_>,
        target: &ContainerTarget,
        watchdog: &Watchdog,
    ) -> Result<RunOutcome, ExecutionError> {
        let step = request.step_name;
        let start = Instant::now();

        let output_dir = request.workdir.join("output");
        reset_dir(&output_dir).map_err(|e| ExecutionError::io(step, e))?;

        let (logs, _, _) = StepLogs::create(&request.workdir.join("logs"))
            .map_err(|e| ExecutionError::io(step, e))?;

        let layout = container::ContainerLayout::for_step(request.step_id);

        // Build the tree that is copied into the container in one go
        let stage_root = StageDir::create(request.workdir.join("stage"))
            .map_err(|e| ExecutionError::io(step, e))?;
        let staged = layout
            .stage(stage_root.path(), request.script, &request.dependencies)
            .map_err(|e| ExecutionError::io(step, e))?;

        let mut env: Vec<(String, String)> = request
            .settings
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.push(("STEP_NAME".to_string(), step.to_string()));
        env.push(("STEP_ID".to_string(), request.step_id.to_string()));
        env.push(("STEP_OUTPUT".to_string(), layout.output_dir()));
        env.push(("STEP_DEPENDENCIES_DIR".to_string(), layout.dependencies_dir()));
        for dependency in &request.dependencies {
            env.push((
                format!("STEP_DEPENDENCY_{}", dependency.position),
                layout.dependency_dir(dependency),
            ));
        }

        let mut command = Vec::new();
        if let ScriptKind::Interpreted { program, args } = request.script.kind() {
            command.push(program.clone());
            command.extend(args.iter().cloned());
        }
        command.push(layout.script_path(request.script));

        let spec = ContainerSpec {
            image: target.image.clone(),
            platform: target.platform.clone(),
            env,
            command,
            workdir: Some(layout.root()),
        };

        let runtime = self.containers.as_ref();
        let container = container::ContainerGuard::create(runtime, &spec)?;

        runtime.copy_into(container.id(), &staged, "/")?;

        let run = runtime.start(container.id(), &logs, watchdog);
        let exit_code = match run {
            Ok(code) => code,
            Err(container::StartError::Interrupted(interruption)) => {
                return Err(interruption.into_error(step));
            }
            Err(container::StartError::Failed(e)) => return Err(e),
        };

        let mut image = None;
        if exit_code == 0 {
            // Replace the empty output dir with the container's output
            fs::remove_dir_all(&output_dir).map_err(|e| ExecutionError::io(step, e))?;
            runtime.copy_out(container.id(), &layout.output_dir(), &output_dir)?;

            runtime.commit(container.id(), &target.result_tag)?;
            info!(
                step,
                step_id = %request.step_id.short(),
                operation = operations::IMAGE_COMMIT,
                status = status::SUCCESS,
                image = %target.result_tag,
                "committed result image"
            );
            image = Some(target.result_tag.clone());
        }

        drop(stage_root);

        let duration = start.elapsed();
        info!(
            step,
            step_id = %request.step_id.short(),
            operation = operations::STEP_RUN,
            mode = "container",
            base_image = %target.image,
            exit_code,
            duration_ms = duration.as_millis() as u64,
            "script finished"
        );

        Ok(RunOutcome {
            exit_code,
            output_dir,
            image,
            duration,
            logs,
        })
    }
}

/// Staging tree for a container run, removed on every exit path
struct StageDir(PathBuf);

impl StageDir {
    fn create(path: PathBuf) -> std::io::Result<Self> {
        reset_dir(&path)?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for StageDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.0) {
            debug!(path = %self.0.display(), error = %e, "failed to remove staging directory");
        }
    }
}

fn reserved_env(
    request: &RunRequest<'_>,
    output_dir: &Path,
    dependencies_dir: &Path,
) -> Vec<(String, String)> {
    vec![
        ("STEP_NAME".to_string(), request.step_name.to_string()),
        ("STEP_ID".to_string(), request.step_id.to_string()),
        ("STEP_OUTPUT".to_string(), output_dir.display().to_string()),
        (
            "STEP_DEPENDENCIES_DIR".to_string(),
            dependencies_dir.display().to_string(),
        ),
    ]
}

fn prepend_paths(paths: &[PathBuf], search: Option<OsString>) -> OsString {
    let mut all: Vec<PathBuf> = paths.to_vec();
    if let Some(search) = search {
        all.extend(std::env::split_paths(&search));
    }
    // Only fails on entries containing the separator; fall back to the tools alone
    std::env::join_paths(&all)
        .or_else(|_| std::env::join_paths(paths))
        .unwrap_or_default()
}

/// Read the `paths.txt` a step left in its output directory
pub fn read_tool_paths(output_dir: &Path) -> Vec<PathBuf> {
    fs::read_to_string(output_dir.join(TOOL_PATHS_FILE))
        .map(|content| {
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Remove a directory if present and recreate it empty
pub fn reset_dir(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)
}

/// Recursively copy a directory tree
pub fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;

    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        if rel.as_os_str().is_empty() {
            continue;
        }

        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dest: &Path) -> std::io::Result<()> {
    let link = fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dest)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::copy(src, dest).map(|_| ())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::step::Step;
    use tempfile::TempDir;

    /// Container runtime that refuses everything; host tests never reach it
    struct NoContainers;

    impl ContainerRuntime for NoContainers {
        fn image_exists(&self, _image: &str) -> Result<bool, ExecutionError> {
            Ok(false)
        }
        fn pull(&self, _image: &str, _platform: Option<&str>) -> Result<(), ExecutionError> {
            Err(ExecutionError::container("pull", "no runtime"))
        }
        fn create(&self, _spec: &ContainerSpec) -> Result<String, ExecutionError> {
            Err(ExecutionError::container("create", "no runtime"))
        }
        fn copy_into(&self, _c: &str, _src: &Path, _dest: &str) -> Result<(), ExecutionError> {
            Err(ExecutionError::container("copy", "no runtime"))
        }
        fn copy_out(&self, _c: &str, _src: &str, _dest: &Path) -> Result<(), ExecutionError> {
            Err(ExecutionError::container("copy", "no runtime"))
        }
        fn start(
            &self,
            _c: &str,
            _logs: &StepLogs,
            _watchdog: &Watchdog,
        ) -> Result<i32, container::StartError> {
            Err(container::StartError::Failed(ExecutionError::container(
                "start",
                "no runtime",
            )))
        }
        fn commit(&self, _c: &str, _tag: &str) -> Result<(), ExecutionError> {
            Err(ExecutionError::container("commit", "no runtime"))
        }
        fn remove(&self, _c: &str) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn runner(timeout: Option<Duration>) -> ScriptRunner {
        ScriptRunner::new(Arc::new(NoContainers), timeout)
    }

    fn request<'a>(step: &'a Step, workdir: PathBuf) -> RunRequest<'a> {
        RunRequest {
            step_name: step.name(),
            step_id: step.id(),
            script: step.script(),
            settings: step.settings(),
            workdir,
            dependencies: vec![],
            tool_paths: vec![],
        }
    }

    #[test]
    fn test_host_run_with_settings_as_env() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("write.sh");
        fs::write(&script, "echo \"$GREETING\" > \"$STEP_OUTPUT/result.txt\"\n").unwrap();

        let step = Step::builder("write", &script)
            .setting("GREETING", "hello")
            .build()
            .unwrap();
        let workdir = temp.path().join("build/steps").join(step.id().as_str());

        let outcome = runner(None)
            .run(&request(&step, workdir.clone()), None, &CancelToken::new())
            .unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.output_dir, workdir.join("output"));
        assert_eq!(
            fs::read_to_string(outcome.output_dir.join("result.txt")).unwrap(),
            "hello\n"
        );
    }

    #[test]
    fn test_host_run_reports_failure_and_captures_stderr() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("fail.sh");
        fs::write(&script, "echo broken >&2\nexit 7\n").unwrap();

        let step = Step::builder("fail", &script).build().unwrap();
        let outcome = runner(None)
            .run(
                &request(&step, temp.path().join("work")),
                None,
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(outcome.exit_code, 7);
        assert_eq!(outcome.logs.stderr_tail(5), "broken");
    }

    #[test]
    fn test_host_run_times_out() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("slow.sh");
        fs::write(&script, "sleep 10\n").unwrap();

        let step = Step::builder("slow", &script).build().unwrap();
        let result = runner(Some(Duration::from_millis(300))).run(
            &request(&step, temp.path().join("work")),
            None,
            &CancelToken::new(),
        );

        assert!(matches!(result, Err(ExecutionError::TimedOut { .. })));
    }

    #[test]
    fn test_dependencies_staged_per_position() {
        let temp = TempDir::new().unwrap();
        let dep_output = temp.path().join("dep-output");
        fs::create_dir_all(&dep_output).unwrap();
        fs::write(dep_output.join("result.txt"), "DEP").unwrap();

        let script = temp.path().join("consume.sh");
        fs::write(
            &script,
            "cat \"$STEP_DEPENDENCY_0/result.txt\" > \"$STEP_OUTPUT/copy.txt\"\n",
        )
        .unwrap();
        let step = Step::builder("consume", &script).build().unwrap();

        let mut req = request(&step, temp.path().join("work"));
        req.dependencies.push(StagedDependency {
            position: 0,
            name: "my dep".to_string(),
            output_dir: dep_output,
        });

        let outcome = runner(None).run(&req, None, &CancelToken::new()).unwrap();
        assert!(outcome.success());
        assert_eq!(
            fs::read_to_string(outcome.output_dir.join("copy.txt")).unwrap(),
            "DEP"
        );
        assert!(temp
            .path()
            .join("work/dependencies/0-my_dep/result.txt")
            .exists());
    }

    #[test]
    fn test_read_tool_paths() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(TOOL_PATHS_FILE), "/opt/a/bin\n\n/opt/b/bin\n").unwrap();
        assert_eq!(
            read_tool_paths(temp.path()),
            vec![PathBuf::from("/opt/a/bin"), PathBuf::from("/opt/b/bin")]
        );
        assert!(read_tool_paths(&temp.path().join("missing")).is_empty());
    }

    /// Runs every container step to success, then cannot copy the output out
    struct LosesOutput;

    impl ContainerRuntime for LosesOutput {
        fn image_exists(&self, _image: &str) -> Result<bool, ExecutionError> {
            Ok(true)
        }
        fn pull(&self, _image: &str, _platform: Option<&str>) -> Result<(), ExecutionError> {
            Ok(())
        }
        fn create(&self, _spec: &ContainerSpec) -> Result<String, ExecutionError> {
            Ok("c1".to_string())
        }
        fn copy_into(&self, _c: &str, _src: &Path, _dest: &str) -> Result<(), ExecutionError> {
            Ok(())
        }
        fn copy_out(&self, _c: &str, _src: &str, _dest: &Path) -> Result<(), ExecutionError> {
            Err(ExecutionError::container("copy", "no such path"))
        }
        fn start(
            &self,
            _c: &str,
            _logs: &StepLogs,
            _watchdog: &Watchdog,
        ) -> Result<i32, container::StartError> {
            Ok(0)
        }
        fn commit(&self, _c: &str, _tag: &str) -> Result<(), ExecutionError> {
            Ok(())
        }
        fn remove(&self, _c: &str) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    #[test]
    fn test_stage_dir_removed_when_copy_out_fails() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("noop.sh");
        fs::write(&script, "true\n").unwrap();
        let step = Step::builder("noop", &script).build().unwrap();

        let workdir = temp.path().join("work");
        let target = ContainerTarget {
            image: "debian:bullseye".to_string(),
            platform: None,
            result_tag: format!("buildstep:{}", step.id()),
        };

        let result = ScriptRunner::new(Arc::new(LosesOutput), None).run(
            &request(&step, workdir.clone()),
            Some(&target),
            &CancelToken::new(),
        );

        assert!(matches!(result, Err(ExecutionError::Container { .. })));
        assert!(!workdir.join("stage").exists());
    }
}
