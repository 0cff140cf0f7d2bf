// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `crtest list` command - list catalogued tests.

use std::process::ExitCode;

use crtest_core::Catalog;

pub fn execute(catalog_path: &str) -> ExitCode {
    let catalog = match Catalog::load_file(catalog_path) {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    for name in catalog.names() {
        println!("{}", name);
    }
    ExitCode::SUCCESS
}
