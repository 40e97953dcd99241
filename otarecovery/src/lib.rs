/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Verification of signed OTA packages and orchestration of the requests that
//! hand installs and wipes over to the recovery environment.
//!
//! Like most of the codebase, the Rust APIs are not stable. The CLI source
//! files use concrete types wherever possible for simplicity, while the
//! "library"-style source files aim to be generic and take their system
//! dependencies as traits (see [`recovery::service`]).

pub mod cli;
pub mod config;
pub mod crypto;
pub mod format;
pub mod package;
pub mod progress;
pub mod recovery;
pub mod stream;
pub mod sync;
pub mod util;
