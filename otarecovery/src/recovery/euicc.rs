// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tracing::{debug, error, info};

use crate::{
    recovery::service::{EuiccManager, EuiccResult, Settings, SubscriptionManager},
    sync::{Latch, WaitResult},
};

/// Bounds for how long to wait for eUICC operations. Configured values outside
/// of the bounds are clamped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EuiccTimeoutPolicy {
    pub default: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl EuiccTimeoutPolicy {
    pub const FACTORY_RESET: Self = Self {
        default: Duration::from_secs(30),
        min: Duration::from_secs(5),
        max: Duration::from_secs(60),
    };

    pub const REMOVING_INVISIBLE_PROFILES: Self = Self {
        default: Duration::from_secs(45),
        min: Duration::from_secs(15),
        max: Duration::from_secs(90),
    };

    pub fn resolve(&self, configured: Option<Duration>) -> Duration {
        configured.unwrap_or(self.default).clamp(self.min, self.max)
    }
}

/// What happened to the eUICC profiles before a factory reset. Failures are
/// only reported and never stop the reset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EuiccDisposition {
    /// All profiles were erased.
    Wiped(bool),
    /// Only invisible profiles were removed.
    RemovedInvisible(bool),
    /// eUICC is not provisioned or not available.
    Skipped,
}

impl EuiccDisposition {
    pub fn success(self) -> bool {
        match self {
            Self::Wiped(s) | Self::RemovedInvisible(s) => s,
            Self::Skipped => true,
        }
    }
}

/// Access to everything needed to dispose of eUICC profiles.
pub struct EuiccContext<'a> {
    pub settings: &'a dyn Settings,
    pub manager: Option<&'a dyn EuiccManager>,
    pub subscriptions: &'a dyn SubscriptionManager,
}

impl EuiccContext<'_> {
    fn enabled_manager(&self) -> Option<&dyn EuiccManager> {
        self.manager.filter(|m| m.is_enabled())
    }

    /// Erase every profile on the eUICC and wait for the result.
    pub fn wipe(&self, policy: &EuiccTimeoutPolicy, cancel_signal: &AtomicBool) -> EuiccDisposition {
        if !self.settings.euicc_provisioned() {
            debug!("Skipping eUICC wipe as it is not provisioned");
            return EuiccDisposition::Skipped;
        }

        let Some(manager) = self.enabled_manager() else {
            info!("Skipping eUICC wipe as eUICC manager is not available");
            return EuiccDisposition::Skipped;
        };

        let latch = Arc::new(Latch::new(1));
        let succeeded = Arc::new(AtomicBool::new(false));

        {
            let latch = latch.clone();
            let succeeded = succeeded.clone();

            manager.erase_subscriptions(Box::new(move |result: EuiccResult| {
                if result.ok {
                    debug!("Successfully wiped eUICC data");
                    succeeded.store(true, Ordering::SeqCst);
                } else {
                    error!(
                        "Error wiping eUICC data, detailed code = {}",
                        result.detailed_code
                    );
                }

                latch.count_down();
            }));
        }

        let timeout = policy.resolve(self.settings.euicc_factory_reset_timeout());

        match latch.wait(timeout, cancel_signal) {
            WaitResult::Completed => EuiccDisposition::Wiped(succeeded.load(Ordering::SeqCst)),
            WaitResult::TimedOut => {
                error!("Timed out wiping eUICC data after {timeout:?}");
                EuiccDisposition::Wiped(false)
            }
            WaitResult::Interrupted => {
                error!("Wiping eUICC data interrupted");
                EuiccDisposition::Wiped(false)
            }
        }
    }

    /// Remove the invisible profiles, leaving all user-visible profiles on the
    /// eUICC, and wait for all deletions to finish.
    pub fn remove_invisible(
        &self,
        policy: &EuiccTimeoutPolicy,
        cancel_signal: &AtomicBool,
    ) -> EuiccDisposition {
        if !self.settings.euicc_provisioned() {
            info!("Skipping removal of invisible eUICC profiles as it is not provisioned");
            return EuiccDisposition::Skipped;
        }

        let Some(manager) = self.enabled_manager() else {
            info!("Skipping removal of invisible eUICC profiles as eUICC manager is not available");
            return EuiccDisposition::Skipped;
        };

        let available = self.subscriptions.available_subscriptions();
        if available.is_empty() {
            info!("Skipping removal of invisible eUICC profiles as no profiles are available");
            return EuiccDisposition::Skipped;
        }

        let invisible = available
            .into_iter()
            .filter(|s| s.is_invisible())
            .collect::<Vec<_>>();
        if invisible.is_empty() {
            info!("There are no invisible eUICC profiles to remove");
            return EuiccDisposition::RemovedInvisible(true);
        }

        let latch = Arc::new(Latch::new(invisible.len()));
        let removed = Arc::new(AtomicUsize::new(0));

        for sub in &invisible {
            let latch = latch.clone();
            let removed = removed.clone();
            let subscription_id = sub.subscription_id;

            manager.delete_subscription(
                sub.card_id,
                subscription_id,
                Box::new(move |result: EuiccResult| {
                    if result.ok {
                        debug!("Removed invisible eUICC profile {subscription_id}");
                        removed.fetch_add(1, Ordering::SeqCst);
                    } else {
                        error!(
                            "Error removing invisible eUICC profile {subscription_id}, detailed code = {}",
                            result.detailed_code
                        );
                    }

                    latch.count_down();
                }),
            );
        }

        let timeout = policy.resolve(self.settings.euicc_removing_invisible_profiles_timeout());

        match latch.wait(timeout, cancel_signal) {
            WaitResult::Completed => {}
            WaitResult::TimedOut => {
                error!(
                    "Timed out removing invisible eUICC profiles after {timeout:?}, {} outstanding",
                    latch.count()
                );
                return EuiccDisposition::RemovedInvisible(false);
            }
            WaitResult::Interrupted => {
                error!("Removing invisible eUICC profiles interrupted");
                return EuiccDisposition::RemovedInvisible(false);
            }
        }

        EuiccDisposition::RemovedInvisible(removed.load(Ordering::SeqCst) == invisible.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timeout_clamping() {
        let policy = EuiccTimeoutPolicy::FACTORY_RESET;
        assert_eq!(policy.resolve(None), Duration::from_secs(30));
        assert_eq!(policy.resolve(Some(Duration::from_secs(1))), Duration::from_secs(5));
        assert_eq!(policy.resolve(Some(Duration::from_secs(600))), Duration::from_secs(60));
        assert_eq!(policy.resolve(Some(Duration::from_secs(42))), Duration::from_secs(42));

        let policy = EuiccTimeoutPolicy::REMOVING_INVISIBLE_PROFILES;
        assert_eq!(policy.resolve(None), Duration::from_secs(45));
        assert_eq!(policy.resolve(Some(Duration::ZERO)), Duration::from_secs(15));
        assert_eq!(policy.resolve(Some(Duration::from_secs(91))), Duration::from_secs(90));
    }

    #[test]
    fn disposition_success() {
        assert!(EuiccDisposition::Skipped.success());
        assert!(EuiccDisposition::Wiped(true).success());
        assert!(!EuiccDisposition::Wiped(false).success());
        assert!(!EuiccDisposition::RemovedInvisible(false).success());
    }
}
