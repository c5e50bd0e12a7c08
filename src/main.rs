//! Session log inspection (CLI binary).
//!
//! Prints the per-interval counts one engine recorded during a monitor
//! session as a text table. Exits with status 1 when there is nothing to show.

use anyhow::{Context, Result};
use clap::Parser;
use std::process;

use ratellmiter::config::Opt;
use ratellmiter::initialization::init_logger_with;
use ratellmiter::session::{load_series, parse_line_codes};
use ratellmiter::{MonitorConfig, SessionError};

fn main() -> Result<()> {
    // RATELLMITER_LOGS may come from a .env file next to the project
    let _ = dotenvy::dotenv();

    let opt = Opt::parse();
    init_logger_with(opt.log_level.clone().into(), opt.log_format.clone())
        .context("Failed to initialize logger")?;

    let dir = MonitorConfig {
        log_directory: opt.dir.clone(),
        ..Default::default()
    }
    .resolved_log_directory();
    let kinds = parse_line_codes(&opt.lines);
    match load_series(&dir, opt.file.as_deref(), &opt.name, &kinds) {
        Ok(series) => {
            print!("{}", series.render_table());
            Ok(())
        }
        Err(e @ (SessionError::NoLogFiles(_) | SessionError::NoMatchingData { .. })) => {
            eprintln!("No data to show: {}", e);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("ratellmiter error: {:#}", anyhow::Error::new(e));
            process::exit(1);
        }
    }
}
