/// `buildstep list-ids` command implementation
///
/// Prints the ids of every cacheable step a pipeline needs as a JSON array,
/// prerequisites first. CI uses them as cache-restore keys before deciding
/// whether to execute anything.
use anyhow::Result;

use crate::cli::{CommonArgs, ListIdsArgs};

pub fn run(common: &CommonArgs, args: &ListIdsArgs) -> Result<()> {
    let config = super::load_config(common)?;
    let registry = super::load_registry(common, &config)?;

    let suffix = args
        .key_suffix
        .as_deref()
        .or(config.cache.version_suffix.as_deref());

    let keys: Vec<String> = registry
        .ids_for(&args.pipeline)?
        .iter()
        .map(|id| match suffix {
            Some(suffix) => format!("{id}-{suffix}"),
            None => id.to_string(),
        })
        .collect();

    println!("{}", serde_json::to_string(&keys)?);
    Ok(())
}
