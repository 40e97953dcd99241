/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::Shell;

use crate::cli::args::Cli;

pub fn completion_main(cli: &CompletionCli) -> Result<()> {
    let mut command = Cli::command();
    let bin_name = command.get_name().to_owned();

    match &cli.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to open for writing: {path:?}"))?;
            let mut writer = BufWriter::new(file);

            clap_complete::generate(cli.shell, &mut command, bin_name, &mut writer);

            writer
                .flush()
                .with_context(|| format!("Failed to flush: {path:?}"))?;
        }
        None => clap_complete::generate(cli.shell, &mut command, bin_name, &mut io::stdout()),
    }

    Ok(())
}

/// Generate shell tab completion configs for otarecovery.
#[derive(Debug, Parser)]
pub struct CompletionCli {
    /// The shell to generate completions for.
    #[arg(short, long, value_name = "SHELL", value_parser)]
    pub shell: Shell,

    /// Write the completions to a file instead of stdout.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: Option<PathBuf>,
}
