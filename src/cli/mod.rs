use std::{env, ffi::OsString, path::PathBuf};

use clap::{ArgAction, Parser};

pub const NAME: &str = "ec-sensord";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(about = "Identity and file tracking sensor")]
#[clap(version = crate::metadata::VERSION)]
#[clap(disable_help_subcommand = true)]
pub struct SensorDaemonOpts {
    /// INI configuration file
    #[clap(long)]
    pub config_file: Option<String>,

    /// Raw records, one JSON object per line. Read from stdin when absent
    #[clap(long)]
    pub input: Option<PathBuf>,

    /// Print the tracking tables and statistics before shutting down
    #[clap(long)]
    pub dump: bool,

    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl SensorDaemonOpts {
    pub fn log_level(&self) -> log::LevelFilter {
        log_level_from_verbosity_flag_count(self.verbose)
    }
}

pub fn parse_from_args() -> SensorDaemonOpts {
    parse_from(&mut std::env::args_os())
}

pub fn parse_from<I, T>(args: I) -> SensorDaemonOpts
where
    I: Iterator<Item = T>,
    T: Into<OsString> + Clone,
{
    try_parse_from(args).unwrap_or_else(|e| e.exit())
}

pub fn try_parse_from<I, T>(args: I) -> Result<SensorDaemonOpts, clap::Error>
where
    I: Iterator<Item = T>,
    T: Into<OsString> + Clone,
{
    SensorDaemonOpts::try_parse_from(args)
}

fn log_level_from_verbosity_flag_count(num: u8) -> log::LevelFilter {
    match num {
        u8::MIN..=0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        2..=u8::MAX => log::LevelFilter::Trace,
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

/// Log `e` with its whole chain of causes, and the backtrace when debugging.
pub fn report_error(e: &anyhow::Error) {
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<SensorDaemonOpts, clap::Error> {
        try_parse_from(std::iter::once(NAME).chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let opts = parse(&[]).unwrap();
        assert!(opts.config_file.is_none());
        assert!(opts.input.is_none());
        assert!(!opts.dump);
        assert_eq!(opts.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn all_flags() {
        let opts = parse(&[
            "--config-file",
            "/etc/ec.ini",
            "--input",
            "records.jsonl",
            "--dump",
            "-vv",
        ])
        .unwrap();
        assert_eq!(opts.config_file.as_deref(), Some("/etc/ec.ini"));
        assert_eq!(opts.input, Some(PathBuf::from("records.jsonl")));
        assert!(opts.dump);
        assert_eq!(opts.log_level(), log::LevelFilter::Trace);
    }

    #[test]
    fn unknown_flag_is_an_error() {
        assert!(parse(&["--no-such-flag"]).is_err());
    }
}
