use std::{path::PathBuf, process};

use clap::{CommandFactory, Parser};
use gctracer::{SentinelMatch, TracerConfig};
use gctracer_core::diagnostics;
use gctracer_error::{errno, errno_description};
use log::LevelFilter;

/// Replays a memory event script and writes the access log of the traced region.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// File to write the access log to (stderr if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Recognize routines containing a sentinel name, not only exact matches
    #[arg(long)]
    substring_match: bool,

    /// log4rs configuration file for the diagnostic stream
    #[arg(long)]
    log_config: Option<PathBuf>,

    /// Print debug diagnostics
    #[arg(short, long)]
    verbose: bool,

    /// Event script to replay
    script: PathBuf,
}

fn usage_error(message: &str) -> ! {
    eprintln!("error: {message}\n");
    // Nothing more to report if stderr itself is gone.
    let _ = Cli::command().print_help();
    process::exit(errno::CONFIGURATION)
}

fn main() {
    let args = Cli::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(err) = diagnostics::init(level, args.log_config.as_deref()) {
        usage_error(&format!("Could not set up diagnostics: {err:#}"));
    }

    let mut config = TracerConfig::new().with_sentinel_match(if args.substring_match {
        SentinelMatch::Substring
    } else {
        SentinelMatch::Exact
    });
    if let Some(output) = args.output {
        config = config.with_output(output);
    }

    if let Err(err) = config.validate() {
        usage_error(&format!("{err:#}"));
    }

    match gctracer::replay(&args.script, &config) {
        Ok(report) => log::info!(
            "Done: {} events, {} recorded, {} instrumentation invalidations",
            report.events,
            report.recorded,
            report.invalidations
        ),
        Err(err) => match gctracer::fault_code(&err) {
            Some(errno::CONFIGURATION) => usage_error(&format!("{err:#}")),
            Some(code) => {
                log::error!("{}: {err:#}", errno_description(code));
                process::exit(code)
            }
            None => {
                log::error!("{}: {err:#}", errno_description(errno::INTERNAL));
                process::exit(errno::INTERNAL)
            }
        },
    }
}
