/// `buildstep cache` command implementation
///
/// Inspects and cleans stored host results (list, show, clean, stats).
/// Result images live in the container runtime and are managed there.
use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use buildstep::cache::StepCache;
use buildstep::cli_utils::{buildstep_prefix, format_size};
use buildstep::step::StepId;

use crate::cli::{CacheArgs, CacheCommands, CommonArgs};

pub fn run(common: &CommonArgs, args: &CacheArgs) -> Result<()> {
    let cache = StepCache::new(cache_dir(common, args)?);

    match &args.command {
        CacheCommands::List { verbose } => list(&cache, *verbose),
        CacheCommands::Show { id } => show(&cache, id),
        CacheCommands::Clean { id, all } => clean(&cache, id.as_deref(), *all),
        CacheCommands::Stats => stats(&cache),
    }
}

/// `--cache-dir`, then the config's `cache.dir`, then `<build-root>/cache`
fn cache_dir(common: &CommonArgs, args: &CacheArgs) -> Result<PathBuf> {
    if let Some(dir) = &args.cache_dir {
        return Ok(dir.clone());
    }

    let config = super::load_config(common)?;
    if config.cache.dir.is_some() || args.build_root.is_some() {
        let build_root = args.build_root.clone().unwrap_or_default();
        return Ok(config.cache_dir(&build_root));
    }

    bail!("No cache location: pass --cache-dir or --build-root, or set cache.dir in buildstep.toml")
}

fn parse_id(id: &str) -> Result<StepId> {
    StepId::parse(id).with_context(|| format!("Not a step id: {id}"))
}

fn list(cache: &StepCache, verbose: bool) -> Result<()> {
    let ids = cache.list().context("Failed to list cache entries")?;

    if ids.is_empty() {
        eprintln!("{} No stored results.", buildstep_prefix());
        return Ok(());
    }

    for id in ids {
        if !verbose {
            println!("{id}");
            continue;
        }

        match cache.lookup(&id) {
            Ok(Some(entry)) => println!(
                "{}  {}  {}  {}",
                id,
                entry.metadata.step_name,
                format_size(entry.metadata.output.size_bytes),
                entry.metadata.created_at.format("%Y-%m-%d %H:%M:%S")
            ),
            Ok(None) => {}
            Err(e) => eprintln!("{} {}: {}", buildstep_prefix(), id, e),
        }
    }

    Ok(())
}

fn show(cache: &StepCache, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let Some(entry) = cache.lookup(&id)? else {
        bail!("No stored result for {id}");
    };

    println!("{}", serde_json::to_string_pretty(&entry.metadata)?);
    Ok(())
}

fn clean(cache: &StepCache, id: Option<&str>, all: bool) -> Result<()> {
    if all {
        let removed = cache.clean_all().context("Failed to clean cache")?;
        eprintln!("{} Removed {} entries.", buildstep_prefix(), removed);
        return Ok(());
    }

    let Some(id) = id else {
        bail!("Specify --all to clean every entry, or provide a step id");
    };

    let id = parse_id(id)?;
    if cache.remove(&id)? {
        eprintln!("{} Removed {}.", buildstep_prefix(), id);
    } else {
        eprintln!("{} No stored result for {}.", buildstep_prefix(), id);
    }

    Ok(())
}

fn stats(cache: &StepCache) -> Result<()> {
    let stats = cache.stats().context("Failed to get cache statistics")?;

    println!("Cache: {}", cache.root().display());
    println!("Entries: {}", stats.total_entries);
    println!("Total size: {}", format_size(stats.total_size_bytes));
    println!("Total files: {}", stats.total_files);

    Ok(())
}
