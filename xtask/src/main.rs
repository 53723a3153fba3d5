//! Development tasks for LanChat
//!
//! Run with: cargo xtask <command>

use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "LanChat development tasks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run unit tests of every crate
    Test,

    /// Run the two-node integration and property tests
    Integration {
        /// Extra proptest cases per property
        #[arg(long)]
        cases: Option<u32>,
    },

    /// Run clippy lints
    Lint,

    /// Check formatting
    Fmt,

    /// Run all CI checks
    Ci,

    /// Generate documentation
    Doc {
        /// Open the docs in a browser
        #[arg(long)]
        open: bool,
    },
}

const CLIPPY: &[&str] = &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"];
const FMT: &[&str] = &["fmt", "--all", "--check"];
const TEST: &[&str] = &["test", "--workspace"];

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test => {
            cargo(&["test", "--workspace", "--exclude", "lanchat-tests"], &[])?;
        }
        Commands::Integration { cases } => {
            let cases = cases.map(|n| n.to_string());
            let env: Vec<(&str, &str)> = cases
                .as_deref()
                .map(|n| vec![("PROPTEST_CASES", n)])
                .unwrap_or_default();
            cargo(&["test", "-p", "lanchat-tests"], &env)?;
        }
        Commands::Lint => cargo(CLIPPY, &[])?,
        Commands::Fmt => cargo(FMT, &[])?,
        Commands::Ci => {
            println!("Running CI checks...");
            cargo(FMT, &[])?;
            cargo(CLIPPY, &[])?;
            cargo(TEST, &[])?;
            println!("All CI checks passed!");
        }
        Commands::Doc { open } => {
            let mut args = vec!["doc", "--workspace", "--no-deps"];
            if open {
                args.push("--open");
            }
            cargo(&args, &[])?;
        }
    }

    Ok(())
}

fn cargo(args: &[&str], env: &[(&str, &str)]) -> anyhow::Result<()> {
    let status = Command::new(env!("CARGO"))
        .args(args)
        .envs(env.iter().copied())
        .status()?;

    if !status.success() {
        anyhow::bail!("cargo {} failed", args.join(" "));
    }

    Ok(())
}
