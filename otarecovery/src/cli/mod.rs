/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod args;
pub mod completion;
pub mod package;
pub mod recovery;

// Human-facing messages go to stderr. Commands like `recovery command` print
// their result on stdout.

macro_rules! status {
    ($($arg:tt)*) => {
        eprintln!("\x1b[1m[*] {}\x1b[0m", format!($($arg)*))
    }
}

macro_rules! warning {
    ($($arg:tt)*) => {
        eprintln!("\x1b[1;31m[WARNING] {}\x1b[0m", format!($($arg)+))
    }
}

pub(crate) use status;
pub(crate) use warning;
