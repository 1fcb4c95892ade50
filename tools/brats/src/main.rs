//! `brats` 命令行入口.

mod cli;
mod result;
mod runner;

use clap::Parser;
use cli::{Cli, Command};
use log::LevelFilter;
use simple_logger::SimpleLogger;

fn init_logger(verbose: u8, quiet: bool) -> anyhow::Result<()> {
    let level = match (quiet, verbose) {
        (true, _) => LevelFilter::Warn,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    SimpleLogger::new().with_level(level).env().init()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose, cli.quiet)?;

    match cli.command {
        Command::Train(args) => {
            let summary = runner::train(&args)?;
            result::print_with(|w| result::describe_training_into(&summary, w))?;
        }
        Command::Predict(args) => {
            let report = runner::predict(&args)?;
            result::print_with(|w| result::describe_prediction_into(&report, w))?;
            if !report.is_success() {
                anyhow::bail!(
                    "{} of {} subjects failed",
                    report.failed.len(),
                    report.failed.len() + report.succeeded.len()
                );
            }
        }
    }
    Ok(())
}
