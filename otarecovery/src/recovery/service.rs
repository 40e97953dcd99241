// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Narrow interfaces to the system services that the recovery request logic
//! depends on. None of these are implemented here.

use std::{io, path::Path, time::Duration};

/// Progress callback for uncrypt, called with a percentage.
pub type UncryptProgress<'a> = &'a mut dyn FnMut(u8);

/// Completion callback for an unattended update preparation request.
pub type LskfCallback = Box<dyn FnOnce() + Send>;

/// The system service that writes the BCB and runs uncrypt.
pub trait RecoveryService: Send + Sync {
    /// Map the blocks of the package listed in the uncrypt file. Returns
    /// whether uncrypt succeeded.
    fn uncrypt(&self, package: &Path, progress: UncryptProgress<'_>) -> io::Result<bool>;

    /// Write `command` to the BCB.
    fn setup_bcb(&self, command: &str) -> io::Result<bool>;

    /// Remove any pending command from the BCB.
    fn clear_bcb(&self) -> io::Result<bool>;

    /// Write `command` to the BCB and reboot into recovery. This does not
    /// return if the reboot succeeds.
    fn reboot_recovery_with_command(&self, command: &str) -> io::Result<()>;

    fn request_lskf(&self, token: &str, callback: Option<LskfCallback>) -> io::Result<bool>;

    fn clear_lskf(&self) -> io::Result<bool>;

    fn reboot_with_lskf(&self, token: &str, reason: &str) -> io::Result<bool>;
}

pub trait PowerManager: Send + Sync {
    /// Reboot the device. This does not return if the reboot succeeds.
    fn reboot(&self, reason: &str);

    /// Whether reboots should keep the display off, which is the case for TVs
    /// whose screen is currently off.
    fn should_reboot_quiescently(&self) -> bool {
        false
    }
}

pub trait UserRestrictions: Send + Sync {
    /// Whether the current user is not allowed to factory reset the device.
    fn is_factory_reset_disallowed(&self) -> bool;
}

/// Sends the ordered broadcast that notifies the system of an upcoming factory
/// reset.
pub trait Broadcaster: Send + Sync {
    /// `on_complete` must be called once the last receiver has finished. It may
    /// be called from any thread, but not synchronously from a thread that
    /// waits on the broadcast.
    fn send_master_clear_notification(&self, on_complete: Box<dyn FnOnce() + Send>);
}

/// Result of an asynchronous eUICC operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EuiccResult {
    pub ok: bool,
    pub detailed_code: i32,
}

impl EuiccResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            detailed_code: 0,
        }
    }

    pub fn error(detailed_code: i32) -> Self {
        Self {
            ok: false,
            detailed_code,
        }
    }
}

pub type EuiccCallback = Box<dyn FnOnce(EuiccResult) + Send>;

pub trait EuiccManager: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Erase all operational subscriptions. `callback` is called exactly once,
    /// from any thread.
    fn erase_subscriptions(&self, callback: EuiccCallback);

    /// Delete one subscription. `callback` is called exactly once, from any
    /// thread.
    fn delete_subscription(&self, card_id: i32, subscription_id: i32, callback: EuiccCallback);
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscriptionInfo {
    pub subscription_id: i32,
    pub card_id: i32,
    pub embedded: bool,
    pub group_uuid: Option<String>,
    pub opportunistic: bool,
}

impl SubscriptionInfo {
    /// An invisible subscription is an embedded subscription that belongs to a
    /// group and is only used opportunistically. Users never see these, so
    /// they would otherwise survive a factory reset.
    pub fn is_invisible(&self) -> bool {
        self.embedded && self.group_uuid.is_some() && self.opportunistic
    }
}

pub trait SubscriptionManager: Send + Sync {
    fn available_subscriptions(&self) -> Vec<SubscriptionInfo>;
}

/// Persistent settings that influence the factory reset sequence. Timeouts are
/// the raw, unclamped values.
pub trait Settings: Send + Sync {
    fn euicc_provisioned(&self) -> bool;

    fn euicc_factory_reset_timeout(&self) -> Option<Duration>;

    fn euicc_removing_invisible_profiles_timeout(&self) -> Option<Duration>;
}

/// The storage checkpoint daemon, which keeps an in-progress update revertible
/// until it is committed.
pub trait StorageCheckpoint: Send + Sync {
    fn needs_checkpoint(&self) -> io::Result<bool>;

    /// Abort the pending changes. If `retry` is true, the device retries the
    /// update. This reboots the device on success.
    fn abort_changes(&self, message: &str, retry: bool) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invisible_subscriptions() {
        let sub = SubscriptionInfo {
            subscription_id: 1,
            card_id: 2,
            embedded: true,
            group_uuid: Some("0f7a4b5e-7f0a-4fb7-9a5f-4ef1a51b3a21".to_owned()),
            opportunistic: true,
        };
        assert!(sub.is_invisible());

        assert!(
            !SubscriptionInfo {
                embedded: false,
                ..sub.clone()
            }
            .is_invisible()
        );
        assert!(
            !SubscriptionInfo {
                group_uuid: None,
                ..sub.clone()
            }
            .is_invisible()
        );
        assert!(
            !SubscriptionInfo {
                opportunistic: false,
                ..sub
            }
            .is_invisible()
        );
    }
}
