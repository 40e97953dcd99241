// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read, Seek},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;
use x509_cert::Certificate;
use zip::{ZipArchive, result::ZipError};

use crate::crypto;

/// Location of the certificates that recovery trusts for OTA installation.
pub const DEFAULT_KEYSTORE: &str = "/system/etc/security/otacerts.zip";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open keystore: {0:?}")]
    Open(PathBuf, #[source] io::Error),
    #[error("Failed to read keystore archive")]
    Archive(#[source] ZipError),
    #[error("Failed to read keystore entry: {0:?}")]
    ReadEntry(String, #[source] io::Error),
    #[error("Keystore entry is not a valid certificate: {0:?}")]
    InvalidCertificate(String, #[source] crypto::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Load every certificate from a keystore zip. Each entry must contain exactly
/// one DER or PEM encoded certificate and the first invalid entry aborts the
/// load.
pub fn load_trusted_certs_from_reader(reader: impl Read + Seek) -> Result<Vec<Certificate>> {
    let mut zip = ZipArchive::new(reader).map_err(Error::Archive)?;
    let mut certs = Vec::with_capacity(zip.len());

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(Error::Archive)?;
        let name = entry.name().to_owned();

        let mut data = vec![];
        entry
            .read_to_end(&mut data)
            .map_err(|e| Error::ReadEntry(name.clone(), e))?;

        let cert = crypto::decode_cert(&data).map_err(|e| Error::InvalidCertificate(name, e))?;
        certs.push(cert);
    }

    Ok(certs)
}

/// Load the trusted certificates from the keystore at `path` or from
/// [`DEFAULT_KEYSTORE`] if no path is specified. Nothing is cached, so changes
/// to the keystore take effect on the next call.
pub fn load_trusted_certs(path: Option<&Path>) -> Result<Vec<Certificate>> {
    let path = path.unwrap_or(Path::new(DEFAULT_KEYSTORE));
    let file = File::open(path).map_err(|e| Error::Open(path.to_owned(), e))?;

    let certs = load_trusted_certs_from_reader(file)?;
    debug!("Loaded {} trusted certificates from {path:?}", certs.len());

    Ok(certs)
}
