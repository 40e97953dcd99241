// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    convert::Infallible,
    fs::{self, File},
    io::{self, Seek, SeekFrom},
    path::Path,
};

use tracing::{debug, error, info, warn};

use crate::{
    progress::ProgressThrottle,
    recovery::{
        BLOCK_MAP_INDIRECTION, Error, LAST_INSTALL, LAST_PREFIX, LOG_FILE_MAX_LENGTH,
        REBOOT_RECOVERY_UPDATE, RecoveryPaths, RecoverySystem, RequestLock, Result,
        command::{RecoveryCommand, SECURITY_UPDATE_SUFFIX},
        delete_file, resolve_path,
        service::LskfCallback,
    },
    stream::ReadFixedSizeExt,
    util::NumBytes,
};

/// Read up to `max_len` bytes from the end of a text file. If the file is
/// larger, the result is prefixed with an ellipsis line.
fn read_text_tail(path: &Path, max_len: u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    let size = file.seek(SeekFrom::End(0))?;

    let mut result = String::new();
    let offset = if size > max_len {
        result.push_str("...\n");
        size - max_len
    } else {
        0
    };

    file.seek(SeekFrom::Start(offset))?;
    let data = file.read_vec_exact((size - offset) as usize)?;
    result.push_str(&String::from_utf8_lossy(&data));

    Ok(result)
}

fn remove_recursive(path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("Can't delete {path:?}: {e}");
    }
}

#[cfg(unix)]
fn make_world_accessible(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o666))
}

#[cfg(not(unix))]
fn make_world_accessible(_path: &Path) -> io::Result<()> {
    Ok(())
}

impl RecoverySystem {
    fn install_command(&self, canonical: &Path) -> RecoveryCommand {
        let security = canonical
            .to_string_lossy()
            .ends_with(SECURITY_UPDATE_SUFFIX);

        RecoveryCommand::install(&self.paths.install_filename(canonical), &self.locale, security)
    }

    fn setup_bcb(&self, command: &RecoveryCommand) -> Result<()> {
        let ok = self
            .services
            .recovery
            .setup_bcb(&command.to_bcb())
            .unwrap_or_else(|e| {
                warn!("Failed to call recovery service: {e}");
                false
            });

        if !ok {
            return Err(Error::BcbSetupFailed);
        }

        Ok(())
    }

    /// Reboot into recovery to install the package. If the package is on the
    /// data partition, it must be uncrypted first. When `processed` is true,
    /// [`Self::process_package()`] must have been called beforehand.
    /// Otherwise, uncrypt is requested to run during the reboot.
    ///
    /// This never returns successfully.
    pub fn install_package(&self, package: &Path, processed: bool) -> Result<Infallible> {
        let _guard = self.lock.acquire();

        delete_file(&self.paths.log_file());
        // It may have been created by someone else with different permissions.
        delete_file(&self.paths.uncrypt_file());

        let canonical = resolve_path(package);
        warn!("!!! REBOOTING TO INSTALL {canonical:?} !!!");

        if self.paths.is_on_data_partition(&canonical) {
            let block_map = self.paths.block_map_file();

            if processed {
                if !block_map.exists() {
                    error!("Package claimed to have been processed, but no block map exists");
                    return Err(Error::MissingBlockMap(block_map));
                }
            } else {
                let uncrypt_file = self.paths.uncrypt_file();
                let contents = format!("{}\n", canonical.to_string_lossy());

                fs::write(&uncrypt_file, contents)
                    .map_err(|e| Error::WriteFile(uncrypt_file.clone(), e))?;

                // uncrypt runs as a different user.
                if let Err(e) = make_world_accessible(&uncrypt_file) {
                    error!("Error setting permissions for {uncrypt_file:?}: {e}");
                }

                delete_file(&block_map);
            }
        }

        let command = self.install_command(&canonical);
        info!("Installing with command: {:?}", command.to_bcb());

        self.setup_bcb(&command)?;

        let mut reason = REBOOT_RECOVERY_UPDATE.to_owned();
        if self.services.power.should_reboot_quiescently() {
            reason.push_str(",quiescent");
        }

        self.services.power.reboot(&reason);

        Err(Error::RebootFailed)
    }

    /// Run uncrypt on a package that is on the data partition so that recovery
    /// can read it via the block map. Packages elsewhere are left alone.
    /// `on_progress` receives throttled percentages from uncrypt.
    pub fn process_package(&self, package: &Path, mut on_progress: impl FnMut(u8)) -> Result<()> {
        let canonical = resolve_path(package);
        if !self.paths.is_on_data_partition(&canonical) {
            debug!("No need to process {canonical:?}");
            return Ok(());
        }

        let mut throttle = ProgressThrottle::new(self.progress_interval);
        let mut listener = |percent: u8| {
            if throttle.update(percent) {
                on_progress(percent);
            }
        };

        let ok = self
            .services
            .recovery
            .uncrypt(&canonical, &mut listener)
            .unwrap_or_else(|e| {
                warn!("Failed to call recovery service: {e}");
                false
            });

        if !ok {
            return Err(Error::ProcessFailed);
        }

        Ok(())
    }

    /// Write the install command to the BCB without rebooting. The update is
    /// installed the next time the device boots into recovery.
    pub fn schedule_update_on_boot(&self, package: &Path) -> Result<()> {
        let _guard = self.lock.acquire();

        let canonical = resolve_path(package);
        let command = self.install_command(&canonical);

        self.setup_bcb(&command)
    }

    pub fn cancel_scheduled_update(&self) -> Result<()> {
        let _guard = self.lock.acquire();

        let ok = self.services.recovery.clear_bcb().unwrap_or_else(|e| {
            warn!("Failed to call recovery service: {e}");
            false
        });

        if !ok {
            return Err(Error::ClearBcbFailed);
        }

        Ok(())
    }

    /// Ask the user for their lock screen knowledge factor so that an update
    /// can be applied without user interaction after the next reboot.
    pub fn prepare_for_unattended_update(
        &self,
        token: &str,
        callback: Option<LskfCallback>,
    ) -> Result<()> {
        if token.is_empty() {
            return Err(Error::EmptyToken);
        }

        if !self
            .services
            .recovery
            .request_lskf(token, callback)
            .map_err(Error::Service)?
        {
            return Err(Error::LskfRequestFailed);
        }

        Ok(())
    }

    pub fn clear_prepare_for_unattended_update(&self) -> Result<()> {
        if !self.services.recovery.clear_lskf().map_err(Error::Service)? {
            return Err(Error::LskfClearFailed);
        }

        Ok(())
    }

    /// Reboot to apply an update that was prepared with
    /// [`Self::prepare_for_unattended_update()`].
    pub fn reboot_and_apply(&self, token: &str, reason: &str) -> Result<()> {
        if token.is_empty() {
            return Err(Error::EmptyToken);
        }

        let _guard = self.lock.acquire();

        if !self
            .services
            .recovery
            .reboot_with_lskf(token, reason)
            .map_err(Error::Service)?
        {
            return Err(Error::LskfRebootFailed);
        }

        Ok(())
    }

    /// Clean up after a boot into recovery. See
    /// [`RecoveryPaths::handle_aftermath()`].
    pub fn handle_aftermath(&self) -> Option<String> {
        self.paths.handle_aftermath(&self.lock)
    }
}

impl RecoveryPaths {
    /// Returns the path that recovery should install from. Packages on the
    /// data partition are referenced through the block map.
    pub fn install_filename(&self, canonical: &Path) -> String {
        if self.is_on_data_partition(canonical) {
            BLOCK_MAP_INDIRECTION.to_owned()
        } else {
            canonical.to_string_lossy().into_owned()
        }
    }

    /// Clean up after a boot into recovery. Returns the tail of recovery's log,
    /// if there is one. Everything in the recovery directory is removed, except
    /// for the `last_*` logs and, if uncrypt finished mapping a package, the
    /// block map and uncrypt file so that the package doesn't need to be
    /// processed again.
    pub fn handle_aftermath(&self, lock: &RequestLock) -> Option<String> {
        let _guard = lock.acquire();

        let log_file = self.log_file();
        let log = match read_text_tail(&log_file, LOG_FILE_MAX_LENGTH) {
            Ok(l) => Some(l),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No recovery log file");
                None
            }
            Err(e) => {
                error!("Error reading recovery log: {e}");
                None
            }
        };

        let block_map = self.block_map_file();
        let uncrypt_file = self.uncrypt_file();
        let reserve_package = block_map.exists();

        if !reserve_package && let Ok(p) = fs::read_to_string(&uncrypt_file) {
            info!("Discarding partially processed package: {:?}", p.trim_end());
        }

        let entries = match fs::read_dir(&self.recovery_dir) {
            Ok(e) => e,
            Err(e) => {
                error!("Failed to list {:?}: {e}", self.recovery_dir);
                return log;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    error!("Failed to list {:?}: {e}", self.recovery_dir);
                    continue;
                }
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if name.starts_with(LAST_PREFIX) || name == LAST_INSTALL {
                continue;
            }

            let path = entry.path();
            if reserve_package && (path == block_map || path == uncrypt_file) {
                continue;
            }

            debug!("Deleting {path:?}");
            remove_recursive(&path);
        }

        if let Some(l) = &log {
            debug!("Recovery log: {:?}", NumBytes(l.len()));
        }

        log
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn log_tail() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("log");

        fs::write(&path, b"short log").unwrap();
        assert_eq!(read_text_tail(&path, 64).unwrap(), "short log");

        fs::write(&path, b"0123456789").unwrap();
        assert_eq!(read_text_tail(&path, 4).unwrap(), "...\n6789");
        assert_eq!(read_text_tail(&path, 10).unwrap(), "0123456789");

        let err = read_text_tail(&temp_dir.path().join("missing"), 4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
