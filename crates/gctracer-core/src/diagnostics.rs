use std::path::Path;

use anyhow::Error;
use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};

/// Environment variable naming a log4rs config file for embedded use.
pub const LOG_CONFIG_ENV: &str = "GCTRACER_LOG_CONFIG";

const STDERR_PATTERN: &str = "gctracer [{l}] {m}{n}";

/// Installs the diagnostic logger of the process.
///
/// If `config_file` is given, it is loaded as a log4rs configuration file.
/// Otherwise all messages at `level` or above are written to stderr.
///
/// # Errors
///
/// Fails if the configuration file could not be loaded or another logger
/// was installed already.
pub fn init(level: LevelFilter, config_file: Option<&Path>) -> Result<(), Error> {
    if let Some(path) = config_file {
        return log4rs::init_file(path, Default::default());
    }

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(STDERR_PATTERN)))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))?;

    log4rs::init_config(config)?;

    Ok(())
}

/// Installs the diagnostic logger from [`LOG_CONFIG_ENV`], falling back to
/// stderr at `Info` level.
pub fn init_from_env() -> Result<(), Error> {
    match std::env::var_os(LOG_CONFIG_ENV) {
        Some(path) => init(LevelFilter::Info, Some(Path::new(&path))),
        None => init(LevelFilter::Info, None),
    }
}
