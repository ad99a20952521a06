mod cli;
mod commands;

use clap::Parser;
use std::process::ExitCode;

use buildstep::cli_utils::buildstep_prefix;
use buildstep::logging;
use buildstep::runner::CancelToken;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let cli = Cli::parse();
    let cancel = CancelToken::new();

    let result = match cli.command {
        Commands::ListIds(args) => commands::list_ids::run(&cli.common, &args),
        Commands::Pipelines => commands::pipelines::run(&cli.common),
        Commands::Execute(args) => commands::execute::run(&cli.common, args, cancel.clone()).await,
        Commands::Cache(args) => commands::cache::run(&cli.common, &args),
    };

    match result {
        Ok(()) => ExitCode::from(commands::exit::SUCCESS),
        Err(e) => {
            eprintln!("{} Error: {:#}", buildstep_prefix(), e);
            ExitCode::from(commands::exit_code(&e, &cancel))
        }
    }
}
