//! Tests for the `ratellmiter` binary: option parsing and exit codes.

use clap::Parser;
use ratellmiter::config::{LogFormat, LogLevel, Opt};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const EVENT: &str = r#"{"timestamp":"2024-06-10T06:13:20Z","service":"default","counts":{"requested":4,"issued":3,"exception":1,"finished":2,"overflow":0,"abandoned":0},"state":"open","current_rate":75.0,"queue_length":1}"#;

fn binary() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_ratellmiter"));
    command.env_remove("RATELLMITER_LOGS");
    command
}

fn write_session(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).expect("write session file");
}

#[test]
fn test_cli_defaults() {
    let opt = Opt::try_parse_from(["ratellmiter"]).expect("Should parse without arguments");
    assert_eq!(opt.name, "default");
    assert_eq!(opt.lines, "iroef");
    assert!(opt.dir.is_none());
    assert!(opt.file.is_none());
    assert_eq!(
        log::LevelFilter::from(opt.log_level.clone()),
        log::LevelFilter::from(LogLevel::Warn)
    );
    match opt.log_format {
        LogFormat::Plain => {}
        _ => panic!("Should be Plain format"),
    }
}

#[test]
fn test_cli_with_options() {
    let args = vec![
        "ratellmiter",
        "--dir",
        "/tmp/logs",
        "--name",
        "openai/gpt-4o",
        "--file",
        "1718000000.jsonl",
        "--lines",
        "ie",
        "--log-level",
        "debug",
        "--log-format",
        "json",
    ];
    let opt = Opt::try_parse_from(args.iter()).expect("Should parse all options");
    assert_eq!(opt.dir, Some(PathBuf::from("/tmp/logs")));
    assert_eq!(opt.name, "openai/gpt-4o");
    assert_eq!(opt.file.as_deref(), Some("1718000000.jsonl"));
    assert_eq!(opt.lines, "ie");
    assert_eq!(
        log::LevelFilter::from(opt.log_level.clone()),
        log::LevelFilter::Debug
    );
    match opt.log_format {
        LogFormat::Json => {}
        _ => panic!("Should be Json format"),
    }
}

#[test]
fn test_cli_rejects_unknown_log_level() {
    let result = Opt::try_parse_from(["ratellmiter", "--log-level", "loud"]);
    assert!(result.is_err());
}

#[test]
fn test_exit_code_one_without_data() {
    let dir = TempDir::new().unwrap();
    let output = binary()
        .args(["--dir", dir.path().to_str().unwrap()])
        .output()
        .expect("run binary");
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
}

#[test]
fn test_exit_code_one_for_unknown_name() {
    let dir = TempDir::new().unwrap();
    write_session(dir.path(), "1718000000.jsonl", &format!("{EVENT}\n"));
    let output = binary()
        .args(["--dir", dir.path().to_str().unwrap(), "--name", "nobody"])
        .output()
        .expect("run binary");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_prints_selected_series() {
    let dir = TempDir::new().unwrap();
    write_session(dir.path(), "1718000000.jsonl", &format!("{EVENT}\n{EVENT}\n"));
    let output = binary()
        .args(["--dir", dir.path().to_str().unwrap(), "--lines", "ie"])
        .output()
        .expect("run binary");
    assert_eq!(output.status.code(), Some(0));

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("issued"));
    assert!(stdout.contains("exception"));
    assert!(!stdout.contains("requested"));
    let total = stdout
        .lines()
        .find(|l| l.trim_start().starts_with("total"))
        .expect("totals row");
    let values: Vec<&str> = total.split_whitespace().collect();
    assert_eq!(values, vec!["total", "6", "2"]);
}

#[test]
fn test_env_var_selects_directory() {
    let dir = TempDir::new().unwrap();
    write_session(dir.path(), "1718000000.jsonl", &format!("{EVENT}\n"));
    let output = binary()
        .env("RATELLMITER_LOGS", dir.path())
        .output()
        .expect("run binary");
    assert_eq!(output.status.code(), Some(0));
}
