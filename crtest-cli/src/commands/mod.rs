// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Command handlers for the crtest CLI.

pub mod list;
pub mod run;
pub mod worker;
