use std::{panic, path::Path, thread};

use anyhow::{Context, Result};
use backtrace::Backtrace;
use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};

use crate::config::log::PATTERN;

/// Initialize logging, either from a log4rs config file or with a stderr logger at `level`.
pub fn init_log(log_config: Option<&Path>, level: LevelFilter) -> Result<()> {
    set_panic_log_hook();

    match log_config {
        Some(log_config) => log4rs::init_file(log_config, Default::default()).with_context(|| {
            format!(
                "Failed to initialize logger with config from {:?}",
                &log_config
            )
        }),
        None => {
            log4rs::init_config(stderr_config(level)?)
                .context("Failed to initialize stderr logger")?;
            Ok(())
        }
    }
}

fn stderr_config(level: LevelFilter) -> Result<Config> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))
        .context("Failed to build stderr log config")
}

fn set_panic_log_hook() {
    panic::set_hook(Box::new(move |info| {
        let thread = thread::current();
        let thread = thread.name().unwrap_or("<unnamed>");

        let msg = match info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match info.payload().downcast_ref::<String>() {
                Some(s) => &**s,
                None => "Box<Any>",
            },
        };

        match info.location() {
            Some(location) => log::error!(
                target: "panic", "thread '{}' panicked at '{}': {}:{}",
                thread,
                msg,
                location.file(),
                location.line()
            ),
            None => log::error!(target: "panic", "thread '{}' panicked at '{}'", thread, msg),
        }

        log::error!(target: "panic::debug_info", "{:?}", Backtrace::new());
    }));
}

#[cfg(test)]
mod tests {
    use log::LevelFilter;

    use super::stderr_config;

    #[test]
    fn stderr_config_builds() {
        let config = stderr_config(LevelFilter::Debug).unwrap();
        assert_eq!(config.root().level(), LevelFilter::Debug);
        assert_eq!(config.appenders().len(), 1);
    }
}
