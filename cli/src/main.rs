//! mokutil: stage Machine Owner Key requests for shim.
//!
//! Exactly one operation per invocation. Exit status is 0 on success,
//! 1 when `--test-key` finds the key already enrolled, 255 otherwise.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{ArgAction, ArgGroup, CommandFactory, Parser};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use mokreq_core::security::TtyConsole;
use mokreq_core::{Completion, EfivarfsStore, MokConfig, MokError, MokManager, MokOperation};

const EXIT_KEY_ENROLLED: u8 = 1;
const EXIT_FAILURE: u8 = 255;

#[derive(Parser, Debug)]
#[command(name = "mokutil")]
#[command(about = "Manage pending Machine Owner Key requests")]
#[command(group(ArgGroup::new("operation").multiple(false)))]
struct Cli {
    /// List the enrolled keys
    #[arg(short = 'l', long, group = "operation")]
    list_enrolled: bool,

    /// List the keys to be enrolled
    #[arg(short = 'N', long, group = "operation")]
    list_new: bool,

    /// Request enrollment of the given DER certificates
    #[arg(short = 'i', long, group = "operation", action = ArgAction::Set, num_args = 1.., value_name = "FILE")]
    import: Option<Vec<PathBuf>>,

    /// Request deletion of the given DER certificates
    #[arg(short = 'd', long, group = "operation", action = ArgAction::Set, num_args = 1.., value_name = "FILE")]
    delete: Option<Vec<PathBuf>>,

    /// Revoke the pending enrollment request
    #[arg(long, group = "operation")]
    revoke: bool,

    /// Export enrolled keys to MOK-NNNN.der files
    #[arg(short = 'x', long, group = "operation")]
    export: bool,

    /// Set the MOK password
    #[arg(short = 'p', long, group = "operation")]
    password: bool,

    /// Ask shim to stop validating signatures
    #[arg(long, group = "operation")]
    disable_validation: bool,

    /// Ask shim to validate signatures again
    #[arg(long, group = "operation")]
    enable_validation: bool,

    /// Show the SecureBoot state
    #[arg(long, group = "operation")]
    sb_state: bool,

    /// Test whether a key is already enrolled
    #[arg(short = 't', long, group = "operation", value_name = "FILE")]
    test_key: Option<PathBuf>,

    /// Ask shim to clear the enrolled key list
    #[arg(long, group = "operation")]
    reset: bool,

    /// efivarfs mount point
    #[arg(long, env = "MOKUTIL_EFIVARS", value_name = "DIR")]
    efivars: Option<PathBuf>,

    /// Directory for --export output
    #[arg(long, value_name = "DIR")]
    export_dir: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn operation(&self) -> Option<MokOperation> {
        let op = if self.list_enrolled {
            MokOperation::ListEnrolled
        } else if self.list_new {
            MokOperation::ListNew
        } else if let Some(files) = &self.import {
            MokOperation::Import(files.clone())
        } else if let Some(files) = &self.delete {
            MokOperation::Delete(files.clone())
        } else if self.revoke {
            MokOperation::Revoke
        } else if self.export {
            MokOperation::Export
        } else if self.password {
            MokOperation::SetPassword
        } else if self.disable_validation {
            MokOperation::SetValidation(false)
        } else if self.enable_validation {
            MokOperation::SetValidation(true)
        } else if self.sb_state {
            MokOperation::ShowState
        } else if let Some(file) = &self.test_key {
            MokOperation::TestKey(file.clone())
        } else if self.reset {
            MokOperation::Reset
        } else {
            return None;
        };
        Some(op)
    }

    fn config(&self) -> MokConfig {
        let mut config = MokConfig::default();
        if let Some(root) = &self.efivars {
            config.efivarfs_root = root.clone();
        }
        if let Some(dir) = &self.export_dir {
            config.export_dir = dir.clone();
        }
        config
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli, op: MokOperation) -> anyhow::Result<ExitCode> {
    let config = cli.config();
    let store = EfivarfsStore::new(config.efivarfs_root.clone());
    let mut manager = MokManager::new(store, TtyConsole::new(), config)
        .context("invalid configuration")?;

    let completion = manager.run(op)?;
    debug!("mokutil: {:?}", completion);

    Ok(match completion {
        Completion::KeyStatus { enrolled: true } => ExitCode::from(EXIT_KEY_ENROLLED),
        _ => ExitCode::SUCCESS,
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let Some(op) = cli.operation() else {
        let _ = Cli::command().print_help();
        return ExitCode::from(EXIT_FAILURE);
    };

    match run(&cli, op) {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<MokError>() {
                Some(e) if e.is_auth() => eprintln!("Abort: {}", e),
                _ => eprintln!("Error: {:#}", err),
            }
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("mokutil").chain(args.iter().copied()))
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn import_takes_several_files() {
        let cli = parse(&["--import", "a.der", "b.der"]).unwrap();
        assert_eq!(
            cli.operation(),
            Some(MokOperation::Import(vec![PathBuf::from("a.der"), PathBuf::from("b.der")]))
        );
    }

    #[test]
    fn validation_flags_map_to_state() {
        let cli = parse(&["--disable-validation"]).unwrap();
        assert_eq!(cli.operation(), Some(MokOperation::SetValidation(false)));
        let cli = parse(&["--enable-validation"]).unwrap();
        assert_eq!(cli.operation(), Some(MokOperation::SetValidation(true)));
    }

    #[test]
    fn operations_are_mutually_exclusive() {
        assert!(parse(&["--revoke", "--reset"]).is_err());
        assert!(parse(&["--sb-state", "--import", "a.der"]).is_err());
        assert!(parse(&["--revoke", "--revoke"]).is_err());
        assert!(parse(&["--import", "a.der", "--import", "b.der"]).is_err());
        assert!(parse(&["--delete", "a.der", "--delete", "b.der"]).is_err());
        assert!(parse(&["--import", "a.der", "--delete", "b.der"]).is_err());
    }

    #[test]
    fn no_operation_is_none() {
        let cli = parse(&["--verbose"]).unwrap();
        assert_eq!(cli.operation(), None);
    }

    #[test]
    fn overrides_reach_config() {
        let cli = parse(&["--sb-state", "--efivars", "/tmp/vars", "--export-dir", "/tmp/out"]).unwrap();
        let config = cli.config();
        assert_eq!(config.efivarfs_root, PathBuf::from("/tmp/vars"));
        assert_eq!(config.export_dir, PathBuf::from("/tmp/out"));
    }
}
