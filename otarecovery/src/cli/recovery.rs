/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};

use crate::{
    cli::{status, warning},
    config::{self, Config},
    recovery::{
        RequestLock,
        command::{self, RecoveryCommand, SECURITY_UPDATE_SUFFIX},
        locale::Locale,
        resolve_path,
    },
};

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => Ok(config::load_config(p)?),
        None => Ok(Config::default()),
    }
}

fn get_locale(group: &CommonGroup, config: &Config) -> Result<Locale> {
    match &group.locale {
        Some(l) => l
            .parse()
            .with_context(|| format!("Failed to parse locale: {l:?}")),
        None => config.locale().context("Failed to determine locale"),
    }
}

fn build_command(cli: &CommandCli) -> Result<RecoveryCommand> {
    let config = load_config(cli.common.config.as_deref())?;
    let locale = get_locale(&cli.common, &config)?;
    // An empty reason is the same as no reason.
    let reason = cli.common.reason.as_deref().filter(|r| !r.is_empty());

    let command = match &cli.command {
        CommandKind::Install(c) => {
            let canonical = resolve_path(&c.package);
            let paths = config.recovery_paths();
            let security = canonical
                .to_string_lossy()
                .ends_with(SECURITY_UPDATE_SUFFIX);

            if paths.is_on_data_partition(&canonical) {
                warning!("{canonical:?} is on the data partition and must be uncrypted first");
            }

            RecoveryCommand::install(&paths.install_filename(&canonical), &locale, security)
        }
        CommandKind::WipeData(c) => {
            let reason = reason.map(|r| command::reason_with_timestamp(r, &Local::now()));

            RecoveryCommand::wipe_data(c.shutdown, reason.as_deref(), &locale)
        }
        CommandKind::WipeCache => RecoveryCommand::wipe_cache(reason, &locale),
        CommandKind::WipeAb(c) => {
            let canonical = resolve_path(&c.package);

            RecoveryCommand::wipe_ab(&canonical.to_string_lossy(), reason, &locale)
        }
        CommandKind::PromptAndWipe => RecoveryCommand::prompt_and_wipe_data(reason, &locale),
    };

    Ok(command)
}

fn command_subcommand(cli: &CommandCli) -> Result<()> {
    let command = build_command(cli)?;

    print!("{}", command.to_bcb());

    Ok(())
}

fn aftermath_subcommand(cli: &AftermathCli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let paths = config.recovery_paths();
    let lock = RequestLock::new();

    status!("Cleaning up {:?}", paths.recovery_dir);

    match paths.handle_aftermath(&lock) {
        Some(log) => print!("{log}"),
        None => status!("No recovery log found"),
    }

    Ok(())
}

pub fn recovery_main(cli: &RecoveryCli) -> Result<()> {
    match &cli.command {
        RecoveryCommandCli::Command(c) => command_subcommand(c),
        RecoveryCommandCli::Aftermath(c) => aftermath_subcommand(c),
    }
}

#[derive(Debug, Args)]
struct CommonGroup {
    /// Path to config file.
    #[arg(short, long, value_name = "FILE", value_parser, global = true)]
    config: Option<PathBuf>,

    /// Locale for recovery's UI (eg. `en_US` or `en-US`).
    ///
    /// Defaults to the config file's locale or the environment's locale.
    #[arg(long, value_name = "LOCALE", global = true)]
    locale: Option<String>,

    /// Reason to record in recovery's logs.
    #[arg(long, value_name = "TEXT", global = true)]
    reason: Option<String>,
}

#[derive(Debug, Args)]
struct PackageArgs {
    /// Path to OTA zip.
    #[arg(short, long, value_name = "FILE", value_parser)]
    package: PathBuf,
}

#[derive(Debug, Args)]
struct WipeDataArgs {
    /// Power off instead of rebooting after the wipe.
    #[arg(long)]
    shutdown: bool,
}

#[derive(Debug, Subcommand)]
enum CommandKind {
    /// Install an OTA package.
    Install(PackageArgs),
    /// Wipe the data partition.
    WipeData(WipeDataArgs),
    /// Wipe the cache partition.
    WipeCache,
    /// Wipe the inactive A/B slot.
    WipeAb(PackageArgs),
    /// Let the user decide whether to wipe the data partition.
    PromptAndWipe,
}

/// Print the command that would be written to the bootloader control block.
///
/// Nothing is written and the device is not rebooted.
#[derive(Debug, Parser)]
struct CommandCli {
    #[command(subcommand)]
    command: CommandKind,

    #[command(flatten)]
    common: CommonGroup,
}

/// Clean up the recovery directory after booting from recovery.
///
/// The tail of the recovery log, if any, is printed to stdout.
#[derive(Debug, Parser)]
struct AftermathCli {
    /// Path to config file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum RecoveryCommandCli {
    Command(CommandCli),
    Aftermath(AftermathCli),
}

/// Build recovery commands or clean up after recovery.
#[derive(Debug, Parser)]
pub struct RecoveryCli {
    #[command(subcommand)]
    command: RecoveryCommandCli,
}
