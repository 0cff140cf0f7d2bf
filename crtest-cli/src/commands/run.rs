// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `crtest run` command - run selected tests through checkpoint/restore
//! cycles and map the aggregate verdict onto the process exit status.

use std::process::ExitCode;

use crtest_core::{run_tests, Catalog, RunOptions, SuiteConfig, SuiteContext};

pub fn execute(catalog_path: &str, config: SuiteConfig, opts: &RunOptions) -> ExitCode {
    let catalog = match Catalog::load_file(catalog_path) {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let ctx = SuiteContext::new(config);
    match run_tests(opts, &catalog, &ctx) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
