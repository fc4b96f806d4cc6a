//! The `strata` binary: headless terrain streaming driver.

use std::process::ExitCode;

use clap::Parser;
use strata_config::CliArgs;

fn main() -> ExitCode {
    let args = CliArgs::parse();
    match strata_app::run(&args) {
        Ok(summary) => {
            summary.log();
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("strata: {e}");
            ExitCode::FAILURE
        }
    }
}
