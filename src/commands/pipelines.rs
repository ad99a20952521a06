/// `buildstep pipelines` command implementation
use anyhow::Result;

use crate::cli::CommonArgs;

pub fn run(common: &CommonArgs) -> Result<()> {
    let config = super::load_config(common)?;
    let registry = super::load_registry(common, &config)?;

    for name in registry.names() {
        let terminals = registry.terminals(name)?;
        let names: Vec<&str> = terminals.iter().map(|step| step.name()).collect();
        println!("{name}: {}", names.join(", "));
    }

    Ok(())
}
