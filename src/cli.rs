use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// buildstep - content-addressed build step runner
///
/// Runs pipelines of scripts on the host or in containers, reusing any step
/// whose inputs have not changed since it last succeeded.
#[derive(Parser, Debug)]
#[command(name = "buildstep")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Content-addressed build step runner", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Arguments shared by every command
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Config file path (default: discover buildstep.toml)
    #[arg(short = 'c', long, global = true, env = "BUILDSTEP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Pipeline catalog path (overrides the config's `catalog`)
    #[arg(long, global = true, env = "BUILDSTEP_CATALOG")]
    pub catalog: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the cache ids of every cacheable step a pipeline needs, as JSON
    ListIds(ListIdsArgs),

    /// List the pipelines in the catalog
    Pipelines,

    /// Execute a pipeline against a build root
    Execute(ExecuteArgs),

    /// Manage stored host results
    Cache(CacheArgs),
}

#[derive(Args, Debug)]
pub struct ListIdsArgs {
    /// Pipeline name
    pub pipeline: String,

    /// Suffix appended to every id (`<id>-<suffix>`)
    #[arg(long, env = "BUILDSTEP_KEY_SUFFIX")]
    pub key_suffix: Option<String>,
}

#[derive(Args, Debug)]
pub struct ExecuteArgs {
    /// Pipeline name
    pub pipeline: String,

    /// Scratch directory for step outputs and the default cache
    #[arg(long, env = "BUILDSTEP_BUILD_ROOT")]
    pub build_root: PathBuf,

    /// Host result cache directory
    #[arg(long, env = "BUILDSTEP_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Per-script timeout (e.g. "30m")
    #[arg(long, env = "BUILDSTEP_TIMEOUT")]
    pub timeout: Option<String>,

    /// Container runtime executable
    #[arg(long, env = "BUILDSTEP_CONTAINER_RUNTIME")]
    pub runtime: Option<String>,

    /// Repository result images are tagged into
    #[arg(long, env = "BUILDSTEP_REPOSITORY")]
    pub repository: Option<String>,

    /// Never pull result images from a registry
    #[arg(long)]
    pub no_pull: bool,

    /// Resolve dependencies one at a time
    #[arg(long)]
    pub sequential: bool,

    /// Maximum scripts running at once (0 = number of CPUs)
    #[arg(long, env = "BUILDSTEP_MAX_PARALLEL")]
    pub max_parallel: Option<usize>,

    /// Print the execution report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,

    /// Host result cache directory
    #[arg(long, global = true, env = "BUILDSTEP_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Build root whose default cache (`<build-root>/cache`) to use
    #[arg(long, global = true, env = "BUILDSTEP_BUILD_ROOT")]
    pub build_root: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// List stored step ids
    List {
        /// Show step names and sizes
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show the metadata of one entry
    Show {
        /// Step id
        id: String,
    },

    /// Remove one entry, or all of them
    Clean {
        /// Step id (omit with --all)
        id: Option<String>,

        /// Remove every entry
        #[arg(long)]
        all: bool,
    },

    /// Show cache statistics
    Stats,
}
