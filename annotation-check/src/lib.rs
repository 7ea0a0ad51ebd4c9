mod check;
pub mod cli;

use anyhow::Context;

pub use crate::check::{check, ConfiguredModules, RuleTable};

pub fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let opt = cli::Arguments::parse();

    // init log config
    common::log::init_log(opt.log_config.as_deref(), opt.log_level())?;
    log::trace!("Args: {:#?}", opt);

    let table = check(&opt.config, &opt.modules)
        .with_context(|| format!("Failed to check annotation config {:?}", opt.config))
        .map_err(|e| {
            log::error!("{:?}", e);
            e
        })?;
    print!("{table}");

    Ok(())
}
