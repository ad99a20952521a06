/// `buildstep execute` command implementation
///
/// Runs every step of a pipeline against a build root, honoring cache hits.
/// Ctrl-C trips the engine's cancellation token; running scripts are stopped
/// and nothing partial is cached.
use anyhow::{Context, Result};
use std::fs;
use std::sync::Arc;

use buildstep::cli_utils::buildstep_prefix;
use buildstep::engine::Engine;
use buildstep::pipeline::{ExecutionReport, StepOutcome};
use buildstep::runner::{CancelToken, ContainerRuntime, DockerCli};

use crate::cli::{CommonArgs, ExecuteArgs};

pub async fn run(common: &CommonArgs, args: ExecuteArgs, cancel: CancelToken) -> Result<()> {
    let mut config = super::load_config(common)?;
    let registry = super::load_registry(common, &config)?;

    // Fail on an unknown name before touching the build root
    registry.terminals(&args.pipeline)?;

    if let Some(timeout) = args.timeout {
        config.execution.timeout = Some(timeout);
    }
    if let Some(runtime) = args.runtime {
        config.container.runtime = runtime;
    }
    if let Some(repository) = args.repository {
        config.container.repository = repository;
    }
    if let Some(max_parallel) = args.max_parallel {
        config.execution.max_parallel = max_parallel;
    }
    if args.no_pull {
        config.container.pull = false;
    }
    if args.sequential {
        config.execution.parallel_dependencies = false;
    }
    config.validate().context("Invalid configuration")?;

    fs::create_dir_all(&args.build_root).with_context(|| {
        format!(
            "Failed to create build root: {}",
            args.build_root.display()
        )
    })?;
    // Scripts receive absolute paths
    let build_root = args.build_root.canonicalize().with_context(|| {
        format!(
            "Failed to resolve build root: {}",
            args.build_root.display()
        )
    })?;

    let mut options = config.engine_options(&build_root)?;
    if let Some(cache_dir) = args.cache_dir {
        options.cache_dir = Some(cache_dir);
    }

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(&config.container.runtime));
    let engine = Engine::new(build_root, runtime, options).with_cancel_token(cancel.clone());

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} Interrupted, stopping running steps...", buildstep_prefix());
            cancel.cancel();
        }
    });

    let pipeline = args.pipeline.clone();
    let result = tokio::task::spawn_blocking(move || registry.execute(&pipeline, &engine))
        .await
        .context("Pipeline worker panicked")?;
    interrupt.abort();

    let report = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(())
}

fn print_report(report: &ExecutionReport) {
    for step in &report.steps {
        let outcome = match step.outcome {
            StepOutcome::Cached => "cached",
            StepOutcome::Ran => "ran",
        };
        println!("{:<7}{} {}", outcome, &step.id[..12], step.name);
    }

    let artifacts: Vec<_> = report.artifacts().collect();
    if !artifacts.is_empty() {
        println!();
        println!("Artifacts:");
        for artifact in artifacts {
            match &artifact.image {
                Some(image) => println!("  {}: {} ({})", artifact.name, artifact.output_dir.display(), image),
                None => println!("  {}: {}", artifact.name, artifact.output_dir.display()),
            }
        }
    }

    if !report.tool_paths.is_empty() {
        println!();
        println!("Tool paths:");
        for path in &report.tool_paths {
            println!("  {}", path.display());
        }
    }

    eprintln!(
        "{} Pipeline {} finished in {:.2}s ({} steps, {} cached)",
        buildstep_prefix(),
        report.pipeline,
        report.duration.as_secs_f64(),
        report.steps.len(),
        report.cached_count()
    );
}
