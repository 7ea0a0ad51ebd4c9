use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueHint};
use log::LevelFilter;

const ID: &str = "ID";

#[derive(Parser, Debug)]
#[command(name = "annotation-check", rename_all = "kebab-case")]
pub struct Arguments {
    /// Annotation config file
    #[arg(long, value_hint = ValueHint::FilePath, display_order = 1)]
    pub config: PathBuf,

    /// Additional module ids known to the module tracker
    #[arg(long = "module", value_name = ID, display_order = 10)]
    pub modules: Vec<String>,

    /// log4rs config file (default: log to stderr)
    #[arg(long, value_hint = ValueHint::FilePath, display_order = 700)]
    pub log_config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, display_order = 701)]
    pub verbose: u8,
}

impl Arguments {
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}
