// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Cursor, Read, Seek},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;
use zip::{ZipArchive, result::ZipError};

use crate::util::NumBytes;

/// Name of the optional compatibility archive inside an OTA package.
pub const COMPATIBILITY_ENTRY: &str = "compatibility.zip";

/// Largest entry that will be read into memory.
const MAX_ENTRY_SIZE: u64 = i32::MAX as u64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open compatibility file: {0:?}")]
    Open(PathBuf, #[source] io::Error),
    #[error("Failed to read compatibility archive")]
    Archive(#[source] ZipError),
    #[error("Invalid entry size {1:?} in the compatibility file: {0:?}")]
    InvalidEntrySize(String, NumBytes<u64>),
    #[error("Failed to read compatibility entry: {0:?}")]
    ReadEntry(String, #[source] io::Error),
    #[error("No entries found in the compatibility file")]
    NoEntries,
}

type Result<T> = std::result::Result<T, Error>;

/// Checks manifest fragments against the capabilities of the running system.
pub trait CompatibilityChecker {
    /// Returns true if the system is compatible with all of the fragments.
    fn check(&self, fragments: &[String]) -> bool;
}

impl<F: Fn(&[String]) -> bool> CompatibilityChecker for F {
    fn check(&self, fragments: &[String]) -> bool {
        self(fragments)
    }
}

fn read_entry(mut reader: impl Read, name: &str, size: u64) -> Result<Vec<u8>> {
    if size > MAX_ENTRY_SIZE {
        return Err(Error::InvalidEntrySize(name.to_owned(), NumBytes(size)));
    }

    let mut data = Vec::with_capacity(size as usize);
    reader
        .read_to_end(&mut data)
        .map_err(|e| Error::ReadEntry(name.to_owned(), e))?;

    Ok(data)
}

/// Read all fragments from a compatibility archive. Each entry is decoded as
/// UTF-8 with invalid sequences replaced.
pub fn read_compatibility_fragments(reader: impl Read + Seek) -> Result<Vec<String>> {
    let mut zip = ZipArchive::new(reader).map_err(Error::Archive)?;
    let mut fragments = Vec::with_capacity(zip.len());

    for i in 0..zip.len() {
        let entry = zip.by_index(i).map_err(Error::Archive)?;
        let name = entry.name().to_owned();
        let size = entry.size();

        let data = read_entry(entry, &name, size)?;
        fragments.push(String::from_utf8_lossy(&data).into_owned());
    }

    if fragments.is_empty() {
        return Err(Error::NoEntries);
    }

    Ok(fragments)
}

/// Check the compatibility archive embedded in an OTA package. Packages
/// without a compatibility archive are always compatible.
pub fn verify_package_compatibility(
    package: impl Read + Seek,
    checker: &(impl CompatibilityChecker + ?Sized),
) -> Result<bool> {
    let mut zip = ZipArchive::new(package).map_err(Error::Archive)?;

    let data = match zip.by_name(COMPATIBILITY_ENTRY) {
        Ok(entry) => {
            let size = entry.size();
            read_entry(entry, COMPATIBILITY_ENTRY, size)?
        }
        Err(ZipError::FileNotFound) => {
            debug!("Package has no {COMPATIBILITY_ENTRY}");
            return Ok(true);
        }
        Err(e) => return Err(Error::Archive(e)),
    };

    let fragments = read_compatibility_fragments(Cursor::new(data))?;
    debug!("Checking {} compatibility fragments", fragments.len());

    Ok(checker.check(&fragments))
}

/// Check a standalone compatibility archive.
pub fn verify_compatibility_file(
    path: &Path,
    checker: &(impl CompatibilityChecker + ?Sized),
) -> Result<bool> {
    let file = File::open(path).map_err(|e| Error::Open(path.to_owned(), e))?;
    let fragments = read_compatibility_fragments(file)?;

    Ok(checker.check(&fragments))
}
