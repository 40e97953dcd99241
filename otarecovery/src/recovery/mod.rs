// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Requests to the recovery environment. Recovery reads its instructions from
//! the bootloader control block (BCB). Everything that writes the BCB is
//! serialized by a [`RequestLock`] so that only one request can be in flight
//! at a time.

use std::{
    fs, io,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use thiserror::Error;
use tracing::warn;

use crate::{
    progress::PUBLISH_PROGRESS_INTERVAL,
    recovery::{
        euicc::EuiccTimeoutPolicy,
        locale::Locale,
        service::{
            Broadcaster, EuiccManager, PowerManager, RecoveryService, Settings,
            StorageCheckpoint, SubscriptionManager, UserRestrictions,
        },
    },
};

pub mod command;
pub mod euicc;
mod install;
pub mod locale;
pub mod service;
mod wipe;

pub use wipe::FactoryResetRequest;

/// Where recovery sees the block map of an uncrypted package. Recovery cannot
/// read the data partition, so packages stored there are referenced through
/// this file instead.
pub const BLOCK_MAP_INDIRECTION: &str = "@/cache/recovery/block.map";

pub const DEFAULT_RECOVERY_DIR: &str = "/cache/recovery";
pub const DEFAULT_DATA_DIR: &str = "/data";

/// Reboot reason for installing an update.
pub const REBOOT_RECOVERY_UPDATE: &str = "recovery-update";

/// Files in the recovery directory with this prefix are kept by
/// [`RecoverySystem::handle_aftermath()`].
pub const LAST_PREFIX: &str = "last_";
pub const LAST_INSTALL: &str = "last_install";

/// Maximum amount of the recovery log returned by
/// [`RecoverySystem::handle_aftermath()`].
pub const LOG_FILE_MAX_LENGTH: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to find block map file: {0:?}")]
    MissingBlockMap(PathBuf),
    #[error("Setup BCB failed")]
    BcbSetupFailed,
    #[error("Clearing BCB failed")]
    ClearBcbFailed,
    #[error("Reboot failed (no permissions?)")]
    RebootFailed,
    #[error("Wiping data is not allowed for this user")]
    Policy,
    #[error("Process package failed (uncrypt)")]
    ProcessFailed,
    #[error("Preparation for unattended update failed")]
    LskfRequestFailed,
    #[error("Could not reset unattended update state")]
    LskfClearFailed,
    #[error("System not prepared to apply update")]
    LskfRebootFailed,
    #[error("Update token is empty")]
    EmptyToken,
    #[error("Failed to write file: {0:?}")]
    WriteFile(PathBuf, #[source] io::Error),
    #[error("Recovery service call failed")]
    Service(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The lock that serializes all requests to recovery. There must only be one
/// instance per process and every [`RecoverySystem`] must share it.
#[derive(Debug, Default)]
pub struct RequestLock(Mutex<()>);

impl RequestLock {
    pub fn new() -> Self {
        Self::default()
    }

    // Nothing is guarded, so poisoning is irrelevant.
    fn acquire(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Locations of the files shared with uncrypt and recovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecoveryPaths {
    pub recovery_dir: PathBuf,
    /// Root of the data partition. Packages below this directory must be
    /// uncrypted before recovery can read them.
    pub data_dir: PathBuf,
}

impl RecoveryPaths {
    pub fn new(recovery_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            recovery_dir: recovery_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    pub fn log_file(&self) -> PathBuf {
        self.recovery_dir.join("log")
    }

    /// Created by uncrypt once the package has been mapped successfully.
    pub fn block_map_file(&self) -> PathBuf {
        self.recovery_dir.join("block.map")
    }

    /// Contains the path of the package that uncrypt should process.
    pub fn uncrypt_file(&self) -> PathBuf {
        self.recovery_dir.join("uncrypt_file")
    }

    pub fn uncrypt_status_file(&self) -> PathBuf {
        self.recovery_dir.join("uncrypt_status")
    }

    /// Whether `path` is on the data partition. Both paths are resolved first
    /// so that symlinks and `..` components can't hide the location.
    pub fn is_on_data_partition(&self, path: &Path) -> bool {
        let data_dir = resolve_path(&self.data_dir);
        resolve_path(path).starts_with(data_dir)
    }
}

impl Default for RecoveryPaths {
    fn default() -> Self {
        Self::new(DEFAULT_RECOVERY_DIR, DEFAULT_DATA_DIR)
    }
}

/// Canonicalize a path. If it doesn't exist, `.` and `..` components are
/// resolved lexically and only the longest existing ancestor is canonicalized.
pub fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(p) = fs::canonicalize(path) {
        return p;
    }

    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_owned());
    let mut normalized = PathBuf::new();

    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            c => normalized.push(c),
        }
    }

    let mut missing = vec![];
    let mut existing = normalized.as_path();

    loop {
        if let Ok(mut p) = fs::canonicalize(existing) {
            p.extend(missing.iter().rev());
            return p;
        }

        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => return normalized,
        }
    }
}

/// Delete a file, ignoring it if it doesn't exist. Other failures are logged
/// because a leftover file is not fatal.
fn delete_file(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!("Failed to delete {path:?}: {e}");
    }
}

/// The system services that recovery requests depend on.
#[derive(Clone)]
pub struct Services {
    pub recovery: Arc<dyn RecoveryService>,
    pub power: Arc<dyn PowerManager>,
    pub restrictions: Arc<dyn UserRestrictions>,
    pub broadcaster: Arc<dyn Broadcaster>,
    /// Absent on devices without an eUICC.
    pub euicc: Option<Arc<dyn EuiccManager>>,
    pub subscriptions: Arc<dyn SubscriptionManager>,
    pub settings: Arc<dyn Settings>,
    pub checkpoint: Arc<dyn StorageCheckpoint>,
}

/// Entry point for installing updates and wiping the device through recovery.
pub struct RecoverySystem {
    lock: Arc<RequestLock>,
    paths: RecoveryPaths,
    services: Services,
    locale: Locale,
    progress_interval: Duration,
    factory_reset_timeout: EuiccTimeoutPolicy,
    removing_invisible_profiles_timeout: EuiccTimeoutPolicy,
}

impl RecoverySystem {
    pub fn new(lock: Arc<RequestLock>, paths: RecoveryPaths, services: Services) -> Self {
        Self {
            lock,
            paths,
            services,
            locale: Locale::from_env(),
            progress_interval: PUBLISH_PROGRESS_INTERVAL,
            factory_reset_timeout: EuiccTimeoutPolicy::FACTORY_RESET,
            removing_invisible_profiles_timeout: EuiccTimeoutPolicy::REMOVING_INVISIBLE_PROFILES,
        }
    }

    pub fn with_locale(mut self, locale: Locale) -> Self {
        self.locale = locale;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_euicc_timeouts(
        mut self,
        factory_reset: EuiccTimeoutPolicy,
        removing_invisible_profiles: EuiccTimeoutPolicy,
    ) -> Self {
        self.factory_reset_timeout = factory_reset;
        self.removing_invisible_profiles_timeout = removing_invisible_profiles;
        self
    }

    pub fn paths(&self) -> &RecoveryPaths {
        &self.paths
    }

    pub fn locale(&self) -> &Locale {
        &self.locale
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn data_partition_detection() {
        let temp_dir = tempfile::tempdir().unwrap();
        let data_dir = temp_dir.path().join("data");
        fs::create_dir(&data_dir).unwrap();
        fs::write(data_dir.join("ota.zip"), b"").unwrap();

        let paths = RecoveryPaths::new(temp_dir.path().join("cache"), &data_dir);

        assert!(paths.is_on_data_partition(&data_dir.join("ota.zip")));
        assert!(paths.is_on_data_partition(&data_dir.join("missing.zip")));
        assert!(paths.is_on_data_partition(&data_dir.join("x/../ota.zip")));
        assert!(!paths.is_on_data_partition(&temp_dir.path().join("database/ota.zip")));
        assert!(!paths.is_on_data_partition(&data_dir.join("../ota.zip")));
    }

    #[test]
    fn file_locations() {
        let paths = RecoveryPaths::default();

        assert_eq!(paths.log_file(), Path::new("/cache/recovery/log"));
        assert_eq!(paths.block_map_file(), Path::new("/cache/recovery/block.map"));
        assert_eq!(paths.uncrypt_file(), Path::new("/cache/recovery/uncrypt_file"));
        assert_eq!(
            format!("@{}", paths.block_map_file().display()),
            BLOCK_MAP_INDIRECTION
        );
    }
}
