// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use chrono::{DateTime, TimeZone};

use crate::recovery::locale::Locale;

/// Suffix of package file names that are security-only updates.
pub const SECURITY_UPDATE_SUFFIX: &str = "_s.zip";

/// Replace characters that would split an argument into multiple lines of the
/// recovery command. Recovery treats each line as a separate argument.
pub fn sanitize_arg(arg: &str) -> String {
    arg.replace(['\0', '\n'], "?")
}

/// Join arguments into a recovery command. Every argument is terminated by a
/// newline and missing or blank arguments are skipped.
pub fn build_command<S: AsRef<str>>(args: impl IntoIterator<Item = Option<S>>) -> String {
    let mut command = String::new();

    for arg in args.into_iter().flatten() {
        let arg = arg.as_ref();
        if arg.trim().is_empty() {
            continue;
        }

        command.push_str(arg);
        command.push('\n');
    }

    command
}

/// Format the reason for a data wipe. The time of the request is appended so
/// that it shows up in recovery's logs.
pub fn reason_with_timestamp<Tz: TimeZone>(reason: &str, now: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    format!("{reason},{}", now.format("%Y-%m-%dT%H:%M:%S%z"))
}

/// A single argument for the recovery binary. Values are sanitized when
/// formatted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecoveryArg {
    UpdatePackage(String),
    Locale(String),
    Security,
    WipeData,
    WipeCache,
    WipeAb,
    WipePackage(String),
    PromptAndWipeData,
    Reason(String),
    ShutdownAfter,
}

impl fmt::Display for RecoveryArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpdatePackage(v) => write!(f, "--update_package={}", sanitize_arg(v)),
            Self::Locale(v) => write!(f, "--locale={}", sanitize_arg(v)),
            Self::Security => f.write_str("--security"),
            Self::WipeData => f.write_str("--wipe_data"),
            Self::WipeCache => f.write_str("--wipe_cache"),
            Self::WipeAb => f.write_str("--wipe_ab"),
            Self::WipePackage(v) => write!(f, "--wipe_package={}", sanitize_arg(v)),
            Self::PromptAndWipeData => f.write_str("--prompt_and_wipe_data"),
            Self::Reason(v) => write!(f, "--reason={}", sanitize_arg(v)),
            Self::ShutdownAfter => f.write_str("--shutdown_after"),
        }
    }
}

/// An ordered list of recovery arguments. The argument order is significant
/// to recovery and is preserved as is.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecoveryCommand {
    args: Vec<RecoveryArg>,
}

impl RecoveryCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, arg: RecoveryArg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn arg_if(self, condition: bool, arg: RecoveryArg) -> Self {
        if condition { self.arg(arg) } else { self }
    }

    /// Add a reason argument unless the reason is empty.
    pub fn reason(self, reason: Option<&str>) -> Self {
        match reason {
            Some(r) if !r.is_empty() => self.arg(RecoveryArg::Reason(r.to_owned())),
            _ => self,
        }
    }

    pub fn args(&self) -> &[RecoveryArg] {
        &self.args
    }

    /// Format as the newline-delimited text stored in the BCB.
    pub fn to_bcb(&self) -> String {
        build_command(self.args.iter().map(|a| Some(a.to_string())))
    }

    /// Install an update package. `filename` is either a path that recovery
    /// can read directly or the block map indirection for uncrypted packages.
    pub fn install(filename: &str, locale: &Locale, security: bool) -> Self {
        Self::new()
            .arg(RecoveryArg::UpdatePackage(filename.to_owned()))
            .arg(RecoveryArg::Locale(locale.language_tag()))
            .arg_if(security, RecoveryArg::Security)
    }

    /// Wipe the data partition. `reason` should already include the timestamp.
    pub fn wipe_data(shutdown: bool, reason: Option<&str>, locale: &Locale) -> Self {
        Self::new()
            .arg_if(shutdown, RecoveryArg::ShutdownAfter)
            .arg(RecoveryArg::WipeData)
            .reason(reason)
            .arg(RecoveryArg::Locale(locale.language_tag()))
    }

    pub fn wipe_cache(reason: Option<&str>, locale: &Locale) -> Self {
        Self::new()
            .arg(RecoveryArg::WipeCache)
            .reason(reason)
            .arg(RecoveryArg::Locale(locale.language_tag()))
    }

    /// Wipe the inactive A/B slot. `package` must be a package that recovery can
    /// read directly.
    pub fn wipe_ab(package: &str, reason: Option<&str>, locale: &Locale) -> Self {
        Self::new()
            .arg(RecoveryArg::WipeAb)
            .arg(RecoveryArg::WipePackage(package.to_owned()))
            .reason(reason)
            .arg(RecoveryArg::Locale(locale.language_tag()))
    }

    /// Ask the user whether to wipe data. Recovery expects the POSIX locale
    /// name for this command.
    pub fn prompt_and_wipe_data(reason: Option<&str>, locale: &Locale) -> Self {
        Self::new()
            .arg(RecoveryArg::PromptAndWipeData)
            .reason(reason)
            .arg(RecoveryArg::Locale(locale.posix_name()))
    }
}

impl fmt::Display for RecoveryCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_bcb())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, TimeZone, Utc};

    use super::*;

    fn en_us() -> Locale {
        Locale::parse("en_US").unwrap()
    }

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_arg("a\nb\0c"), "a?b?c");
        assert_eq!(sanitize_arg("plain"), "plain");
    }

    #[test]
    fn build_skips_missing_and_blank() {
        let command = build_command([Some("--a"), None, Some(""), Some("  "), Some("--b")]);
        assert_eq!(command, "--a\n--b\n");

        assert_eq!(build_command::<&str>([]), "");
    }

    #[test]
    fn install_command() {
        let command = RecoveryCommand::install("/cache/ota.zip", &en_us(), false);
        assert_eq!(
            command.to_bcb(),
            "--update_package=/cache/ota.zip\n--locale=en-US\n"
        );

        let command = RecoveryCommand::install("@/cache/recovery/block.map", &en_us(), true);
        assert_eq!(
            command.to_bcb(),
            "--update_package=@/cache/recovery/block.map\n--locale=en-US\n--security\n"
        );
    }

    #[test]
    fn wipe_commands() {
        let command = RecoveryCommand::wipe_data(true, Some("user\nrequest"), &en_us());
        assert_eq!(
            command.to_bcb(),
            "--shutdown_after\n--wipe_data\n--reason=user?request\n--locale=en-US\n"
        );

        let command = RecoveryCommand::wipe_data(false, Some(""), &en_us());
        assert_eq!(command.to_bcb(), "--wipe_data\n--locale=en-US\n");

        let command = RecoveryCommand::wipe_cache(Some("low space"), &en_us());
        assert_eq!(
            command.to_bcb(),
            "--wipe_cache\n--reason=low space\n--locale=en-US\n"
        );

        let command = RecoveryCommand::wipe_ab("/data/wipe.zip", None, &en_us());
        assert_eq!(
            command.to_bcb(),
            "--wipe_ab\n--wipe_package=/data/wipe.zip\n--locale=en-US\n"
        );

        let command = RecoveryCommand::prompt_and_wipe_data(Some("rescue"), &en_us());
        assert_eq!(
            command.to_bcb(),
            "--prompt_and_wipe_data\n--reason=rescue\n--locale=en_US\n"
        );
    }

    #[test]
    fn argument_order() {
        let command = RecoveryCommand::new()
            .arg(RecoveryArg::WipeCache)
            .reason(Some(""))
            .arg_if(false, RecoveryArg::ShutdownAfter)
            .reason(Some("why"))
            .arg(RecoveryArg::Locale("fr-CA".to_owned()));

        assert_eq!(
            command.args(),
            [
                RecoveryArg::WipeCache,
                RecoveryArg::Reason("why".to_owned()),
                RecoveryArg::Locale("fr-CA".to_owned()),
            ]
        );
        assert_eq!(command.to_string(), command.to_bcb());
    }

    #[test]
    fn timestamped_reason() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            reason_with_timestamp("factory", &now),
            "factory,2024-03-09T07:05:01+0000"
        );

        let offset = FixedOffset::west_opt(8 * 3600).unwrap();
        let now = offset.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            reason_with_timestamp("factory", &now),
            "factory,2024-03-09T07:05:01-0800"
        );
    }
}
