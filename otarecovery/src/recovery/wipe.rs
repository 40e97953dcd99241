// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    convert::Infallible,
    path::Path,
    sync::{Arc, atomic::AtomicBool},
};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::{
    recovery::{
        Error, RecoverySystem, Result,
        command::{self, RecoveryCommand},
        delete_file,
        euicc::EuiccContext,
        resolve_path,
    },
    sync::Latch,
};

/// Reboot reason used when the storage checkpoint can't be aborted.
const REBOOT_RESCUE_PARTY: &str = "rescueparty";

#[derive(Clone, Debug, Default)]
pub struct FactoryResetRequest {
    /// Power off instead of rebooting after the wipe.
    pub shutdown: bool,
    /// Free-form reason recorded in recovery's logs.
    pub reason: String,
    /// Wipe even if the user is restricted from doing so.
    pub force: bool,
    /// Erase all eUICC profiles instead of only the invisible ones.
    pub wipe_euicc: bool,
}

impl RecoverySystem {
    fn euicc_context(&self) -> EuiccContext<'_> {
        EuiccContext {
            settings: self.services.settings.as_ref(),
            manager: self.services.euicc.as_deref(),
            subscriptions: self.services.subscriptions.as_ref(),
        }
    }

    /// Hand the command to recovery and reboot. The caller must hold the
    /// request lock.
    fn boot_command_locked(&self, command: &RecoveryCommand) -> Result<Infallible> {
        delete_file(&self.paths.log_file());

        let command = command.to_bcb();
        info!("Rebooting into recovery with command: {command:?}");

        if let Err(e) = self
            .services
            .recovery
            .reboot_recovery_with_command(&command)
        {
            warn!("Failed to call recovery service: {e}");
        }

        Err(Error::RebootFailed)
    }

    /// Reboot into recovery and wipe the data partition. Before doing so, the
    /// rest of the system is notified and the eUICC profiles are disposed of.
    /// Failing to dispose of the eUICC profiles does not prevent the wipe.
    ///
    /// `cancel_signal` only interrupts the eUICC steps. This never returns
    /// successfully.
    pub fn reboot_wipe_user_data(
        &self,
        request: &FactoryResetRequest,
        cancel_signal: &AtomicBool,
    ) -> Result<Infallible> {
        let _guard = self.lock.acquire();

        if !request.force && self.services.restrictions.is_factory_reset_disallowed() {
            return Err(Error::Policy);
        }

        // Wait for every receiver of the ordered broadcast to finish.
        {
            let latch = Arc::new(Latch::new(1));
            let on_complete = latch.clone();

            self.services
                .broadcaster
                .send_master_clear_notification(Box::new(move || on_complete.count_down()));

            latch.wait_indefinitely();
            debug!("Master clear notification delivered");
        }

        let euicc = self.euicc_context();
        let disposition = if request.wipe_euicc {
            euicc.wipe(&self.factory_reset_timeout, cancel_signal)
        } else {
            euicc.remove_invisible(&self.removing_invisible_profiles_timeout, cancel_signal)
        };

        if disposition.success() {
            info!("eUICC disposition: {disposition:?}");
        } else {
            warn!("eUICC disposition failed, wiping anyway: {disposition:?}");
        }

        let reason = (!request.reason.is_empty())
            .then(|| command::reason_with_timestamp(&request.reason, &Local::now()));
        let command = RecoveryCommand::wipe_data(request.shutdown, reason.as_deref(), &self.locale);

        self.boot_command_locked(&command)
    }

    /// Erase all eUICC profiles. Returns whether the profiles were erased or
    /// there was nothing to erase.
    pub fn wipe_euicc_data(&self, cancel_signal: &AtomicBool) -> bool {
        let disposition = self
            .euicc_context()
            .wipe(&self.factory_reset_timeout, cancel_signal);

        debug!("eUICC disposition: {disposition:?}");

        disposition.success()
    }

    /// Reboot into recovery and wipe the cache partition. This never returns
    /// successfully.
    pub fn reboot_wipe_cache(&self, reason: Option<&str>) -> Result<Infallible> {
        let _guard = self.lock.acquire();

        let command = RecoveryCommand::wipe_cache(reason, &self.locale);

        self.boot_command_locked(&command)
    }

    /// Reboot into recovery and wipe the inactive A/B slot. `package` must be
    /// readable by recovery. This never returns successfully.
    pub fn reboot_wipe_ab(&self, package: &Path, reason: Option<&str>) -> Result<Infallible> {
        let _guard = self.lock.acquire();

        let canonical = resolve_path(package);
        let command =
            RecoveryCommand::wipe_ab(&canonical.to_string_lossy(), reason, &self.locale);

        self.boot_command_locked(&command)
    }

    /// Reboot into recovery and let the user decide whether to wipe data. If an
    /// update is still being checkpointed, the update is rolled back instead,
    /// which may fix whatever prompted the wipe. In that case, this returns
    /// once the rollback or fallback reboot has been requested.
    pub fn reboot_prompt_and_wipe_user_data(&self, reason: Option<&str>) -> Result<()> {
        let _guard = self.lock.acquire();

        let checkpointing = self
            .services
            .checkpoint
            .needs_checkpoint()
            .unwrap_or_else(|e| {
                warn!("Failed to check for checkpointing: {e}");
                false
            });

        if checkpointing {
            match self
                .services
                .checkpoint
                .abort_changes(REBOOT_RESCUE_PARTY, false)
            {
                Ok(()) => info!("Wipe requested during checkpoint. Aborting update"),
                Err(e) => {
                    info!("Wipe requested during checkpoint. Rebooting instead: {e}");
                    self.services.power.reboot(REBOOT_RESCUE_PARTY);
                }
            }

            return Ok(());
        }

        let command = RecoveryCommand::prompt_and_wipe_data(reason, &self.locale);

        let Err(e) = self.boot_command_locked(&command);
        Err(e)
    }
}
