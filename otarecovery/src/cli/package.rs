/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    ffi::{OsStr, OsString},
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::atomic::AtomicBool,
    time::Instant,
};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tempfile::NamedTempFile;
use tracing::{debug, error};

use crate::{
    cli::{status, warning},
    config,
    crypto::{self, PassphraseSource},
    format::ota,
    package::{
        compat::{self, CompatibilityChecker},
        verify::{self, VerifyOptions},
    },
    util,
};

/// Runs an external program to decide whether the compatibility fragments
/// match the running system. The fragments are written to temporary files
/// whose paths are passed as arguments. Exit status 0 means compatible.
///
/// Without a program, there is nothing to check against, so every package is
/// considered compatible.
#[derive(Debug)]
pub struct HelperChecker {
    program: Option<PathBuf>,
}

impl HelperChecker {
    pub fn new(program: Option<PathBuf>) -> Self {
        Self { program }
    }

    fn run(&self, program: &Path, fragments: &[String]) -> Result<bool> {
        let temp_dir = tempfile::Builder::new()
            .prefix("otarecovery-compat")
            .tempdir()
            .context("Failed to create temporary directory")?;

        let mut command = Command::new(program);

        for (i, fragment) in fragments.iter().enumerate() {
            let path = temp_dir.path().join(format!("{i}.xml"));

            fs::write(&path, fragment)
                .with_context(|| format!("Failed to write fragment: {path:?}"))?;

            command.arg(path);
        }

        command.stdin(Stdio::null());
        command.stdout(Stdio::inherit());
        command.stderr(Stdio::inherit());

        debug!("Running compatibility helper: {command:?}");

        let status = command
            .status()
            .with_context(|| format!("Failed to run command: {command:?}"))?;

        debug!("Compatibility helper exited with {status}");

        Ok(status.success())
    }
}

impl CompatibilityChecker for HelperChecker {
    fn check(&self, fragments: &[String]) -> bool {
        let Some(program) = &self.program else {
            warning!(
                "No compatibility helper specified; accepting {} fragments",
                fragments.len(),
            );
            return true;
        };

        match self.run(program, fragments) {
            Ok(compatible) => compatible,
            Err(e) => {
                error!("{e:?}");
                false
            }
        }
    }
}

fn verify_subcommand(cli: &VerifyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut options = match &cli.config {
        Some(path) => config::load_config(path)?.verify_options(),
        None => VerifyOptions::default(),
    };
    if let Some(keystore) = &cli.keystore {
        options.keystore = Some(keystore.clone());
    }

    let file = File::open(&cli.input)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.input))?;
    let checker = HelperChecker::new(cli.compat_helper.clone());

    status!("Verifying whole-file signature");

    let start = Instant::now();

    let cert = verify::verify_package(
        BufReader::new(file),
        &options,
        &checker,
        |percent| debug!("Verified {percent}%"),
        cancel_signal,
    )
    .map_err(|e| {
        let what = if e.is_verification_failure() {
            "Signature verification failed"
        } else {
            "Failed to verify package"
        };

        anyhow::Error::new(e).context(format!("{what}: {:?}", cli.input))
    })?;

    status!("Signed by: {}", cert.tbs_certificate.subject);
    status!("Completed after {:.1}s", start.elapsed().as_secs_f64());

    Ok(())
}

fn compat_subcommand(cli: &CompatCli) -> Result<()> {
    let checker = HelperChecker::new(cli.compat_helper.clone());

    let compatible = compat::verify_compatibility_file(&cli.input, &checker)
        .with_context(|| format!("Failed to read compatibility archive: {:?}", cli.input))?;

    if !compatible {
        bail!("Package is not compatible with this device");
    }

    status!("Package is compatible");

    Ok(())
}

fn sign_subcommand(cli: &SignCli, cancel_signal: &AtomicBool) -> Result<()> {
    let source = if let Some(v) = &cli.passphrase.pass_env_var {
        PassphraseSource::EnvVar(v.clone())
    } else if let Some(p) = &cli.passphrase.pass_file {
        PassphraseSource::File(p.clone())
    } else {
        PassphraseSource::None
    };

    let key = crypto::read_pem_key_file(&cli.key, &source)
        .with_context(|| format!("Failed to load key: {:?}", cli.key))?;
    let cert = crypto::read_cert_file(&cli.cert)
        .with_context(|| format!("Failed to load certificate: {:?}", cli.cert))?;

    let public_key = crypto::get_public_key(&cert)
        .with_context(|| format!("Failed to extract public key: {:?}", cli.cert))?;
    if public_key != key.to_public_key() {
        bail!("Private key and certificate do not match");
    }

    let reader = File::open(&cli.input)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.input))?;

    let mut temp_writer = NamedTempFile::with_prefix_in(
        cli.output
            .file_name()
            .unwrap_or_else(|| OsStr::new("otarecovery.tmp")),
        util::parent_path(&cli.output),
    )
    .context("Failed to open temporary output file")?;
    let temp_path = temp_writer.path().to_owned();

    status!("Signing {:?}", cli.input);

    {
        let mut writer = BufWriter::new(&mut temp_writer);

        ota::sign_zip(reader, &mut writer, &key, &cert, cancel_signal)
            .with_context(|| format!("Failed to sign zip: {:?}", cli.input))?;

        writer.flush().context("Failed to flush output zip")?;
    }

    temp_writer.persist(&cli.output).with_context(|| {
        format!(
            "Failed to move temporary file to output path: {temp_path:?} -> {:?}",
            cli.output
        )
    })?;

    Ok(())
}

pub fn package_main(cli: &PackageCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        PackageCommand::Verify(c) => verify_subcommand(c, cancel_signal),
        PackageCommand::Compat(c) => compat_subcommand(c),
        PackageCommand::Sign(c) => sign_subcommand(c, cancel_signal),
    }
}

/// Verify the whole-file signature and compatibility of an OTA package.
#[derive(Debug, Parser)]
pub struct VerifyCli {
    /// Path to OTA zip.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Zip of trusted certificates.
    ///
    /// Overrides the keystore from the config file. If neither is specified,
    /// the system keystore is used.
    #[arg(long, value_name = "ZIP", value_parser)]
    pub keystore: Option<PathBuf>,

    /// Program that checks the compatibility fragments.
    ///
    /// The program receives the paths of the fragments as arguments and must
    /// exit with status 0 if the package is compatible.
    #[arg(long, value_name = "PROGRAM", value_parser)]
    pub compat_helper: Option<PathBuf>,

    /// Path to config file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub config: Option<PathBuf>,
}

/// Check a standalone compatibility.zip archive.
#[derive(Debug, Parser)]
pub struct CompatCli {
    /// Path to compatibility.zip.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Program that checks the compatibility fragments.
    #[arg(long, value_name = "PROGRAM", value_parser)]
    pub compat_helper: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PassphraseGroup {
    /// Environment variable containing private key passphrase.
    #[arg(long, value_name = "ENV_VAR", value_parser, group = "pass")]
    pass_env_var: Option<OsString>,

    /// File containing private key passphrase.
    #[arg(long, value_name = "FILE", value_parser, group = "pass")]
    pass_file: Option<PathBuf>,
}

/// Add a whole-file signature to a zip.
///
/// The input zip must not have an archive comment.
#[derive(Debug, Parser)]
pub struct SignCli {
    /// Path to unsigned zip.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Path to signed output zip.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,

    /// Path to private key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub key: PathBuf,

    /// Path to certificate.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub cert: PathBuf,

    #[command(flatten)]
    passphrase: PassphraseGroup,
}

#[derive(Debug, Subcommand)]
enum PackageCommand {
    Verify(VerifyCli),
    Compat(CompatCli),
    Sign(SignCli),
}

/// Verify or sign OTA packages.
#[derive(Debug, Parser)]
pub struct PackageCli {
    #[command(subcommand)]
    command: PackageCommand,
}
