// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! crtest CLI
//!
//! Command-line interface for the checkpoint/restore validation suite.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crtest_core::{CycleOptions, RunOptions, SuiteConfig};

mod commands;

/// crtest - checkpoint/restore validation suite
#[derive(Parser)]
#[command(name = "crtest")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Test catalog file path
    #[arg(long, default_value = "crtest.list")]
    pub catalog: String,

    /// Path to the checkpoint/restore binary
    #[arg(long, default_value = "criu")]
    pub criu: String,

    /// Directory the test binaries live under
    #[arg(long, default_value = "suite")]
    pub suite_dir: String,

    /// Base directory for dump image trees
    #[arg(long, default_value = "dump")]
    pub output_dir: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run test(s)
    Run {
        /// Run every catalogued test
        #[arg(short, long)]
        all: bool,

        /// Test name (repeatable)
        #[arg(short, long = "test")]
        test: Vec<String>,

        /// Comma-separated flavors to run (h,ns,uns)
        #[arg(short, long)]
        flavor: Option<String>,

        /// Exclude tests matching the pattern (repeatable)
        #[arg(short = 'x', long)]
        exclude: Vec<String>,

        /// Do some pre-dumps before each dump
        #[arg(long, default_value_t = 0)]
        pre: u32,

        /// Do the dump/restore cycle several times before checking
        #[arg(long, default_value_t = 1)]
        iters: u32,

        /// Do not checkpoint anything, just check the test works
        #[arg(long)]
        nocr: bool,

        /// Don't restore tasks, leave them running after dump
        #[arg(long)]
        leave_running: bool,

        /// Use page-server dump
        #[arg(long)]
        page_server: bool,

        /// Run tests in parallel across this many workers; 0 runs inline
        #[arg(short, long, default_value_t = 0)]
        parallel: u32,
    },

    /// List tests
    List,

    /// Internal worker entry point for pooled runs
    #[command(hide = true)]
    Worker {
        /// Serialized job description
        #[arg(long)]
        job: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = SuiteConfig {
        tool_path: PathBuf::from(&cli.criu),
        suite_dir: PathBuf::from(&cli.suite_dir),
        output_dir: PathBuf::from(&cli.output_dir),
    };
    tracing::debug!(tool = %config.tool_path.display(), suite = %config.suite_dir.display(), "configured");

    // Dispatch to command handlers
    match cli.command {
        Commands::Run {
            all,
            test,
            flavor,
            exclude,
            pre,
            iters,
            nocr,
            leave_running,
            page_server,
            parallel,
        } => {
            let opts = RunOptions {
                all,
                tests: test,
                flavor,
                exclude,
                cycle: CycleOptions {
                    iters,
                    pre,
                    leave_running,
                    page_server,
                    nocr,
                },
                parallel,
            };
            commands::run::execute(&cli.catalog, config, &opts)
        }
        Commands::List => commands::list::execute(&cli.catalog),
        Commands::Worker { job } => commands::worker::execute(&job),
    }
}
