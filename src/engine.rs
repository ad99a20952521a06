/// Execution engine
///
/// Resolves a step to a stored result: a cache hit short-circuits everything,
/// otherwise dependencies and base are resolved first (recursively, with the
/// same rules), the script runs, and a successful result is stored under the
/// step's id.
///
/// Within one engine each step id is resolved successfully at most once.
/// Concurrent callers asking for the same id wait for the single in-flight
/// resolution and share its outcome; a failed resolution is forgotten, so a
/// later call runs the step again.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::cache::{ImageCache, StepCache};
use crate::error::ExecutionError;
use crate::logging::{operations, status};
use crate::runner::{
    read_tool_paths, CancelToken, ContainerRuntime, ContainerTarget, RunRequest, ScriptRunner,
    StagedDependency,
};
use crate::step::{Base, ExecutionMode, Role, Step, StepId};

const STDERR_TAIL_LINES: usize = 20;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Host result cache directory (default `<build-root>/cache`)
    pub cache_dir: Option<PathBuf>,
    /// Repository for result images
    pub repository: String,
    /// Try the registry when a result image is not present locally
    pub pull: bool,
    /// Per-script timeout
    pub timeout: Option<Duration>,
    /// Resolve sibling dependencies on separate threads
    pub parallel_dependencies: bool,
    /// Upper bound on scripts running at once
    pub max_parallel: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cache_dir: None,
            repository: "buildstep".to_string(),
            pull: true,
            timeout: None,
            parallel_dependencies: true,
            max_parallel: num_cpus::get(),
        }
    }
}

/// A step whose result is available
#[derive(Debug, Clone)]
pub struct Resolved {
    pub step: Step,
    pub output_dir: PathBuf,
    /// Result image, for containerized steps
    pub image: Option<String>,
    /// Served from the cache rather than run
    pub cached: bool,
    pub duration: Duration,
    /// Tool directories exposed to consumers, own `paths.txt` first
    pub tool_paths: Vec<PathBuf>,
}

impl Resolved {
    pub fn id(&self) -> &StepId {
        self.step.id()
    }

    pub fn name(&self) -> &str {
        self.step.name()
    }

    pub fn role(&self) -> Role {
        self.step.role()
    }
}

type Slot = Arc<OnceLock<Result<Resolved, String>>>;

pub struct Engine {
    build_root: PathBuf,
    cache: StepCache,
    images: ImageCache,
    runner: ScriptRunner,
    options: EngineOptions,
    cancel: CancelToken,
    in_flight: Mutex<HashMap<StepId, Slot>>,
    completed: Mutex<Vec<Resolved>>,
    run_slots: RunSlots,
}

impl Engine {
    pub fn new(
        build_root: impl Into<PathBuf>,
        runtime: Arc<dyn ContainerRuntime>,
        options: EngineOptions,
    ) -> Self {
        let build_root = build_root.into();
        let cache_dir = options
            .cache_dir
            .clone()
            .unwrap_or_else(|| build_root.join("cache"));

        Self {
            cache: StepCache::new(cache_dir),
            images: ImageCache::new(runtime.clone(), options.repository.clone(), options.pull),
            runner: ScriptRunner::new(runtime, options.timeout),
            run_slots: RunSlots::new(options.max_parallel),
            build_root,
            options,
            cancel: CancelToken::new(),
            in_flight: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Share a cancellation token with the caller (e.g. a Ctrl-C handler)
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    pub fn cache(&self) -> &StepCache {
        &self.cache
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Steps resolved so far, in completion order
    pub fn completed(&self) -> Vec<Resolved> {
        lock(&self.completed).clone()
    }

    /// Resolve a step, reusing any result already produced by this engine
    pub fn run(&self, step: &Step) -> Result<Resolved, ExecutionError> {
        let slot = lock(&self.in_flight)
            .entry(step.id().clone())
            .or_default()
            .clone();

        let mut owned_error = None;
        let result = slot.get_or_init(|| match self.resolve(step) {
            Ok(resolved) => {
                lock(&self.completed).push(resolved.clone());
                Ok(resolved)
            }
            Err(e) => {
                let message = e.to_string();
                owned_error = Some(e);
                Err(message)
            }
        });

        if let Some(e) = owned_error {
            // Only successes are memoized; the next caller retries
            let mut in_flight = lock(&self.in_flight);
            if in_flight
                .get(step.id())
                .is_some_and(|current| Arc::ptr_eq(current, &slot))
            {
                in_flight.remove(step.id());
            }
            return Err(e);
        }

        result.clone().map_err(|message| ExecutionError::Failed {
            step: step.name().to_string(),
            message,
        })
    }

    fn resolve(&self, step: &Step) -> Result<Resolved, ExecutionError> {
        self.check_cancelled(step)?;

        let mode = step.execution_mode();
        let platform = step
            .root_image()
            .map(|image| image.architecture.docker_platform());

        if step.is_cacheable() {
            let hit = match mode {
                ExecutionMode::Host => self.lookup_host(step),
                ExecutionMode::Container => self.lookup_image(step, platform),
            };
            if let Some(resolved) = hit {
                return Ok(resolved);
            }
        }

        let dependencies = self.run_all(step, step.dependencies())?;

        let base = match step.base() {
            Base::Step(base) => Some(self.run(base).map_err(|e| upstream(step, base, e))?),
            Base::Image(_) | Base::Absent => None,
        };

        self.check_cancelled(step)?;

        let target = match mode {
            ExecutionMode::Host => None,
            ExecutionMode::Container => Some(self.container_target(step, base.as_ref(), platform)?),
        };

        let mut tool_paths: Vec<PathBuf> = Vec::new();
        if let Some(base) = &base {
            tool_paths.extend(base.tool_paths.iter().cloned());
        }
        for dependency in &dependencies {
            tool_paths.extend(dependency.tool_paths.iter().cloned());
        }

        let request = RunRequest {
            step_name: step.name(),
            step_id: step.id(),
            script: step.script(),
            settings: step.settings(),
            workdir: self.step_dir(step.id()),
            dependencies: dependencies
                .iter()
                .enumerate()
                .map(|(position, dependency)| StagedDependency {
                    position,
                    name: dependency.name().to_string(),
                    output_dir: dependency.output_dir.clone(),
                })
                .collect(),
            tool_paths,
        };

        let outcome = {
            let _slot = self.run_slots.acquire();
            self.runner.run(&request, target.as_ref(), &self.cancel)
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                discard(&request.workdir.join("output"));
                return Err(e);
            }
        };

        if !outcome.success() {
            error!(
                step = %step.name(),
                step_id = %step.id().short(),
                operation = operations::STEP_RUN,
                status = status::ERROR,
                exit_code = outcome.exit_code,
                stderr = %outcome.logs.stderr_tail(STDERR_TAIL_LINES),
                "step failed"
            );
            discard(&outcome.output_dir);
            return Err(ExecutionError::ScriptFailed {
                step: step.name().to_string(),
                exit_code: outcome.exit_code,
            });
        }

        if step.is_cacheable() && mode == ExecutionMode::Host {
            match self.cache.store(step, &outcome.output_dir, outcome.duration) {
                Ok(metadata) => info!(
                    step = %step.name(),
                    step_id = %step.id().short(),
                    operation = operations::CACHE_STORE,
                    status = status::SUCCESS,
                    size_bytes = metadata.output.size_bytes,
                    "stored result"
                ),
                Err(e) => warn!(
                    step = %step.name(),
                    step_id = %step.id().short(),
                    operation = operations::CACHE_STORE,
                    status = status::ERROR,
                    error = %e,
                    "failed to store result"
                ),
            }
        }

        let mut exposed = read_tool_paths(&outcome.output_dir);
        exposed.extend(base.map(|b| b.tool_paths).unwrap_or_default());

        Ok(Resolved {
            step: step.clone(),
            output_dir: outcome.output_dir,
            image: outcome.image,
            cached: false,
            duration: outcome.duration,
            tool_paths: exposed,
        })
    }

    /// Resolve sibling dependencies, in parallel when enabled
    fn run_all(&self, step: &Step, dependencies: &[Step]) -> Result<Vec<Resolved>, ExecutionError> {
        if !self.options.parallel_dependencies || dependencies.len() < 2 {
            return dependencies
                .iter()
                .map(|dependency| self.run(dependency).map_err(|e| upstream(step, dependency, e)))
                .collect();
        }

        thread::scope(|scope| {
            let handles: Vec<_> = dependencies
                .iter()
                .map(|dependency| (dependency, scope.spawn(move || self.run(dependency))))
                .collect();

            handles
                .into_iter()
                .map(|(dependency, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| {
                            Err(ExecutionError::Failed {
                                step: dependency.name().to_string(),
                                message: "worker thread panicked".to_string(),
                            })
                        })
                        .map_err(|e| upstream(step, dependency, e))
                })
                .collect()
        })
    }

    fn lookup_host(&self, step: &Step) -> Option<Resolved> {
        let entry = match self.cache.lookup(step.id()) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(
                    step = %step.name(),
                    step_id = %step.id().short(),
                    operation = operations::CACHE_LOOKUP,
                    status = status::MISS,
                    "cache miss"
                );
                return None;
            }
            Err(e) => {
                warn!(
                    step = %step.name(),
                    step_id = %step.id().short(),
                    operation = operations::CACHE_LOOKUP,
                    status = status::ERROR,
                    error = %e,
                    "cache lookup failed, running step"
                );
                return None;
            }
        };

        let output_dir = self.step_dir(step.id()).join("output");
        if let Err(e) = self.cache.restore(&entry, &output_dir) {
            warn!(
                step = %step.name(),
                step_id = %step.id().short(),
                operation = operations::CACHE_RESTORE,
                status = status::ERROR,
                error = %e,
                "cache restore failed, running step"
            );
            return None;
        }

        info!(
            step = %step.name(),
            step_id = %step.id().short(),
            operation = operations::CACHE_LOOKUP,
            status = status::HIT,
            "cache hit"
        );

        Some(Resolved {
            step: step.clone(),
            tool_paths: read_tool_paths(&output_dir),
            output_dir,
            image: None,
            cached: true,
            duration: Duration::ZERO,
        })
    }

    fn lookup_image(&self, step: &Step, platform: Option<&str>) -> Option<Resolved> {
        let lookup = self
            .images
            .lookup(step.id(), platform)
            .and_then(|found| match found {
                Some(image) => {
                    let output_dir = self.step_dir(step.id()).join("output");
                    self.images
                        .materialize(step.id(), &image, platform, &output_dir)
                        .map(|_| Some((image, output_dir)))
                }
                None => Ok(None),
            });

        match lookup {
            Ok(Some((image, output_dir))) => {
                info!(
                    step = %step.name(),
                    step_id = %step.id().short(),
                    operation = operations::CACHE_LOOKUP,
                    status = status::HIT,
                    image = %image,
                    "result image found"
                );
                Some(Resolved {
                    step: step.clone(),
                    tool_paths: read_tool_paths(&output_dir),
                    output_dir,
                    image: Some(image),
                    cached: true,
                    duration: Duration::ZERO,
                })
            }
            Ok(None) => {
                debug!(
                    step = %step.name(),
                    step_id = %step.id().short(),
                    operation = operations::CACHE_LOOKUP,
                    status = status::MISS,
                    "no result image"
                );
                None
            }
            Err(e) => {
                warn!(
                    step = %step.name(),
                    step_id = %step.id().short(),
                    operation = operations::CACHE_LOOKUP,
                    status = status::ERROR,
                    error = %e,
                    "result image unusable, running step"
                );
                None
            }
        }
    }

    fn container_target(
        &self,
        step: &Step,
        base: Option<&Resolved>,
        platform: Option<&str>,
    ) -> Result<ContainerTarget, ExecutionError> {
        let image = match (step.base(), base) {
            (Base::Image(image), _) => image.name.clone(),
            (Base::Step(base_step), Some(resolved)) => {
                resolved.image.clone().ok_or_else(|| {
                    ExecutionError::container(
                        "resolve base image",
                        format!("base step {} produced no result image", base_step.name()),
                    )
                })?
            }
            _ => {
                return Err(ExecutionError::container(
                    "resolve base image",
                    format!("step {} has no container base", step.name()),
                ))
            }
        };

        Ok(ContainerTarget {
            image,
            platform: platform.map(str::to_string),
            result_tag: self.images.tag_for(step.id()),
        })
    }

    fn step_dir(&self, id: &StepId) -> PathBuf {
        self.build_root.join("steps").join(id.as_str())
    }

    fn check_cancelled(&self, step: &Step) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled {
                step: step.name().to_string(),
            });
        }
        Ok(())
    }
}

/// Attribute a prerequisite's failure to the step that needed it
fn upstream(step: &Step, prerequisite: &Step, err: ExecutionError) -> ExecutionError {
    match err {
        ExecutionError::Cancelled { .. } | ExecutionError::Upstream { .. } => err,
        other => ExecutionError::Upstream {
            step: step.name().to_string(),
            upstream: prerequisite.name().to_string(),
            message: other.to_string(),
        },
    }
}

fn discard(output_dir: &Path) {
    if output_dir.exists() {
        if let Err(e) = fs::remove_dir_all(output_dir) {
            warn!(path = %output_dir.display(), error = %e, "failed to discard output");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counting limit on concurrent script runs
struct RunSlots {
    limit: usize,
    used: Mutex<usize>,
    freed: Condvar,
}

struct RunSlot<'a>(&'a RunSlots);

impl RunSlots {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            used: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self) -> RunSlot<'_> {
        let mut used = lock(&self.used);
        while *used >= self.limit {
            used = self
                .freed
                .wait(used)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *used += 1;
        RunSlot(self)
    }
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        *lock(&self.0.used) -= 1;
        self.0.freed.notify_one();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::runner::container::{ContainerSpec, StartError};
    use crate::runner::{StepLogs, Watchdog};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

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
        fn start(&self, _c: &str, _l: &StepLogs, _w: &Watchdog) -> Result<i32, StartError> {
            Err(StartError::Failed(ExecutionError::container("start", "no runtime")))
        }
        fn commit(&self, _c: &str, _tag: &str) -> Result<(), ExecutionError> {
            Err(ExecutionError::container("commit", "no runtime"))
        }
        fn remove(&self, _c: &str) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn engine(root: &Path) -> Engine {
        Engine::new(root, Arc::new(NoContainers), EngineOptions::default())
    }

    /// Script that appends a line to `counter` each time it runs
    fn counting_step(temp: &TempDir, name: &str, counter: &Path) -> Step {
        let script = temp.path().join(format!("{name}.sh"));
        fs::write(
            &script,
            format!(
                "echo run >> '{}'\necho {name} > \"$STEP_OUTPUT/result.txt\"\n",
                counter.display()
            ),
        )
        .unwrap();
        Step::builder(name, script).build().unwrap()
    }

    fn runs(counter: &Path) -> usize {
        fs::read_to_string(counter)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[test]
    fn test_second_engine_hits_cache() {
        let temp = TempDir::new().unwrap();
        let counter = temp.path().join("count");
        let step = counting_step(&temp, "leaf", &counter);
        let root = temp.path().join("build");

        let first = engine(&root).run(&step).unwrap();
        assert!(!first.cached);

        let second = engine(&root).run(&step).unwrap();
        assert!(second.cached);
        assert_eq!(runs(&counter), 1);
        assert_eq!(
            fs::read_to_string(second.output_dir.join("result.txt")).unwrap(),
            "leaf\n"
        );
    }

    #[test]
    fn test_shared_dependency_runs_once() {
        let temp = TempDir::new().unwrap();
        let counter = temp.path().join("count");
        let shared = counting_step(&temp, "shared", &counter);

        let consumer = |name: &str| {
            let script = temp.path().join(format!("{name}.sh"));
            fs::write(&script, format!("echo {name} > \"$STEP_OUTPUT/out\"\n")).unwrap();
            Step::builder(name, script)
                .dependency(shared.clone())
                .build()
                .unwrap()
        };
        let top_script = temp.path().join("top.sh");
        fs::write(&top_script, "true\n").unwrap();
        let top = Step::builder("top", top_script)
            .dependencies([consumer("a"), consumer("b"), consumer("c")])
            .build()
            .unwrap();

        engine(&temp.path().join("build")).run(&top).unwrap();
        assert_eq!(runs(&counter), 1);
    }

    #[test]
    fn test_non_cacheable_step_reruns_across_engines() {
        let temp = TempDir::new().unwrap();
        let counter = temp.path().join("count");
        let script = temp.path().join("volatile.sh");
        fs::write(&script, format!("echo run >> '{}'\n", counter.display())).unwrap();
        let step = Step::builder("volatile", script)
            .cacheable(false)
            .build()
            .unwrap();
        let root = temp.path().join("build");

        let engine1 = engine(&root);
        engine1.run(&step).unwrap();
        engine1.run(&step).unwrap();
        engine(&root).run(&step).unwrap();

        assert_eq!(runs(&counter), 2);
        assert!(engine1.cache().list().unwrap().is_empty());
    }

    #[test]
    fn test_failure_attributed_to_consumer() {
        let temp = TempDir::new().unwrap();
        let broken = temp.path().join("broken.sh");
        fs::write(&broken, "exit 4\n").unwrap();
        let broken = Step::builder("broken", broken).build().unwrap();

        let script = temp.path().join("consumer.sh");
        fs::write(&script, "true\n").unwrap();
        let consumer = Step::builder("consumer", script)
            .dependency(broken.clone())
            .build()
            .unwrap();

        let engine = engine(&temp.path().join("build"));
        let err = engine.run(&consumer).unwrap_err();
        match err {
            ExecutionError::Upstream { step, upstream, .. } => {
                assert_eq!(step, "consumer");
                assert_eq!(upstream, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(engine.cache().lookup(broken.id()).unwrap().is_none());
        assert!(engine.completed().is_empty());
    }

    #[test]
    fn test_failed_step_retried_by_same_engine() {
        let temp = TempDir::new().unwrap();
        let counter = temp.path().join("count");
        let flag = temp.path().join("fail.flag");
        fs::write(&flag, "").unwrap();

        let script = temp.path().join("flaky.sh");
        fs::write(
            &script,
            format!(
                "echo run >> '{}'\nif [ -e '{}' ]; then exit 1; fi\necho ok > \"$STEP_OUTPUT/result.txt\"\n",
                counter.display(),
                flag.display()
            ),
        )
        .unwrap();
        let step = Step::builder("flaky", script).build().unwrap();

        let engine = engine(&temp.path().join("build"));
        let err = engine.run(&step).unwrap_err();
        assert!(matches!(err, ExecutionError::ScriptFailed { exit_code: 1, .. }));

        fs::remove_file(&flag).unwrap();
        let resolved = engine.run(&step).unwrap();
        assert!(!resolved.cached);
        assert_eq!(runs(&counter), 2);
        assert_eq!(engine.completed().len(), 1);

        // The success is memoized
        engine.run(&step).unwrap();
        assert_eq!(runs(&counter), 2);
    }

    #[test]
    fn test_cancelled_engine_runs_nothing() {
        let temp = TempDir::new().unwrap();
        let counter = temp.path().join("count");
        let step = counting_step(&temp, "leaf", &counter);

        let engine = engine(&temp.path().join("build"));
        engine.cancel_token().cancel();

        let err = engine.run(&step).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(runs(&counter), 0);
    }

    #[test]
    fn test_run_slots_bound_concurrency() {
        let slots = RunSlots::new(2);
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        thread::scope(|scope| {
            for _ in 0..6 {
                scope.spawn(|| {
                    let _slot = slots.acquire();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
