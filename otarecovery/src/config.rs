// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    package::verify::VerifyOptions,
    progress::PUBLISH_PROGRESS_INTERVAL,
    recovery::{
        DEFAULT_DATA_DIR, DEFAULT_RECOVERY_DIR, RecoveryPaths,
        euicc::EuiccTimeoutPolicy,
        locale::{InvalidLocale, Locale},
        service::Settings,
    },
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config: {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse config: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
    #[error("Invalid locale in config")]
    Locale(#[from] InvalidLocale),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EuiccConfig {
    pub provisioned: bool,
    /// Clamped to [`EuiccTimeoutPolicy::FACTORY_RESET`].
    pub factory_reset_timeout_ms: Option<u64>,
    /// Clamped to [`EuiccTimeoutPolicy::REMOVING_INVISIBLE_PROFILES`].
    pub removing_invisible_profiles_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub recovery_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Keystore zip with the trusted certificates. The system keystore is used
    /// if unset.
    pub keystore: Option<PathBuf>,
    /// Locale passed to recovery. Taken from the environment if unset.
    pub locale: Option<String>,
    pub progress_interval_ms: Option<u64>,
    pub euicc: EuiccConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recovery_dir: DEFAULT_RECOVERY_DIR.into(),
            data_dir: DEFAULT_DATA_DIR.into(),
            keystore: None,
            locale: None,
            progress_interval_ms: None,
            euicc: EuiccConfig::default(),
        }
    }
}

impl Config {
    pub fn recovery_paths(&self) -> RecoveryPaths {
        RecoveryPaths::new(&self.recovery_dir, &self.data_dir)
    }

    pub fn locale(&self) -> Result<Locale> {
        match &self.locale {
            Some(l) => Ok(l.parse()?),
            None => Ok(Locale::from_env()),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval_ms
            .map_or(PUBLISH_PROGRESS_INTERVAL, Duration::from_millis)
    }

    pub fn verify_options(&self) -> VerifyOptions {
        VerifyOptions {
            keystore: self.keystore.clone(),
            progress_interval: self.progress_interval(),
        }
    }

    /// The eUICC timeouts after clamping.
    pub fn euicc_timeouts(&self) -> (Duration, Duration) {
        (
            EuiccTimeoutPolicy::FACTORY_RESET.resolve(self.euicc_factory_reset_timeout()),
            EuiccTimeoutPolicy::REMOVING_INVISIBLE_PROFILES
                .resolve(self.euicc_removing_invisible_profiles_timeout()),
        )
    }
}

impl Settings for Config {
    fn euicc_provisioned(&self) -> bool {
        self.euicc.provisioned
    }

    fn euicc_factory_reset_timeout(&self) -> Option<Duration> {
        self.euicc.factory_reset_timeout_ms.map(Duration::from_millis)
    }

    fn euicc_removing_invisible_profiles_timeout(&self) -> Option<Duration> {
        self.euicc
            .removing_invisible_profiles_timeout_ms
            .map(Duration::from_millis)
    }
}

pub fn parse_config(contents: &str, path: &Path) -> Result<Config> {
    toml_edit::de::from_str(contents).map_err(|e| Error::Parse(path.to_owned(), e))
}

/// Load the config from `path`. All fields are optional.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path).map_err(|e| Error::Read(path.to_owned(), e))?;

    parse_config(&contents, path)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults() {
        let config = parse_config("", Path::new("empty.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.recovery_paths(), RecoveryPaths::default());
        assert_eq!(config.progress_interval(), PUBLISH_PROGRESS_INTERVAL);
        assert_eq!(
            config.euicc_timeouts(),
            (Duration::from_secs(30), Duration::from_secs(45))
        );
    }

    #[test]
    fn full_config() {
        let config = parse_config(
            r#"
            recovery_dir = "/tmp/recovery"
            data_dir = "/tmp/data"
            keystore = "/tmp/otacerts.zip"
            locale = "fr_CA.UTF-8"
            progress_interval_ms = 100

            [euicc]
            provisioned = true
            factory_reset_timeout_ms = 1000
            removing_invisible_profiles_timeout_ms = 120000
            "#,
            Path::new("full.toml"),
        )
        .unwrap();

        assert_eq!(
            config.recovery_paths(),
            RecoveryPaths::new("/tmp/recovery", "/tmp/data")
        );
        assert_eq!(config.locale().unwrap().language_tag(), "fr-CA");
        assert_eq!(config.progress_interval(), Duration::from_millis(100));
        assert!(config.euicc_provisioned());
        assert_eq!(
            config.euicc_timeouts(),
            (Duration::from_secs(5), Duration::from_secs(90))
        );

        let options = config.verify_options();
        assert_eq!(options.keystore.as_deref(), Some(Path::new("/tmp/otacerts.zip")));
        assert_eq!(options.progress_interval, Duration::from_millis(100));
    }

    #[test]
    fn invalid_config() {
        assert_matches!(
            parse_config("bogus = 1", Path::new("bad.toml")),
            Err(Error::Parse(_, _))
        );

        let config = parse_config("locale = \"C\"", Path::new("c.toml")).unwrap();
        assert_matches!(config.locale(), Err(Error::Locale(_)));

        assert_matches!(
            load_config(Path::new("/nonexistent/otarecovery.toml")),
            Err(Error::Read(_, _))
        );
    }
}
