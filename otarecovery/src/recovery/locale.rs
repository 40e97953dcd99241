// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{env, fmt, str::FromStr};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("Invalid locale: {0:?}")]
pub struct InvalidLocale(String);

/// The subset of a locale that recovery cares about for picking the language
/// of its UI text.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Locale {
    language: String,
    region: Option<String>,
}

impl Locale {
    const UNDETERMINED: &'static str = "und";

    pub fn undetermined() -> Self {
        Self {
            language: Self::UNDETERMINED.to_owned(),
            region: None,
        }
    }

    /// Parse a locale in either POSIX (`en_US.UTF-8@euro`) or BCP 47 (`en-US`)
    /// form. Script and variant subtags are dropped. The `C` and `POSIX`
    /// locales have no language and are rejected.
    pub fn parse(value: &str) -> Option<Self> {
        // Strip the codeset and modifier.
        let value = value.split(['.', '@']).next().unwrap_or_default();

        let mut subtags = value.split(['_', '-']);
        let language = subtags.next()?;

        if !(2..=3).contains(&language.len()) || !language.bytes().all(|c| c.is_ascii_alphabetic())
        {
            return None;
        }

        let region = subtags.find_map(|s| {
            let is_alpha = s.len() == 2 && s.bytes().all(|c| c.is_ascii_alphabetic());
            let is_numeric = s.len() == 3 && s.bytes().all(|c| c.is_ascii_digit());

            (is_alpha || is_numeric).then(|| s.to_ascii_uppercase())
        });

        Some(Self {
            language: language.to_ascii_lowercase(),
            region,
        })
    }

    /// Determine the locale from the usual environment variables, in order of
    /// precedence. Falls back to [`Self::undetermined()`].
    pub fn from_env() -> Self {
        Self::from_lookup(|k| env::var(k).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        ["LC_ALL", "LC_MESSAGES", "LANG"]
            .into_iter()
            .filter_map(lookup)
            .find(|v| !v.is_empty())
            .and_then(|v| Self::parse(&v))
            .unwrap_or_else(Self::undetermined)
    }

    /// Format as a BCP 47 language tag, like `en-US`.
    pub fn language_tag(&self) -> String {
        match &self.region {
            Some(r) => format!("{}-{r}", self.language),
            None => self.language.clone(),
        }
    }

    /// Format as a POSIX locale name without a codeset, like `en_US`.
    pub fn posix_name(&self) -> String {
        match &self.region {
            Some(r) => format!("{}_{r}", self.language),
            None => self.language.clone(),
        }
    }
}

impl Default for Locale {
    fn default() -> Self {
        Self::undetermined()
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.language_tag())
    }
}

impl FromStr for Locale {
    type Err = InvalidLocale;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidLocale(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        let locale = Locale::parse("en_US.UTF-8").unwrap();
        assert_eq!(locale.language_tag(), "en-US");
        assert_eq!(locale.posix_name(), "en_US");

        let locale = Locale::parse("de_DE@euro").unwrap();
        assert_eq!(locale.language_tag(), "de-DE");

        let locale = Locale::parse("zh-Hant-TW").unwrap();
        assert_eq!(locale.language_tag(), "zh-TW");

        let locale = Locale::parse("es-419").unwrap();
        assert_eq!(locale.posix_name(), "es_419");

        let locale = Locale::parse("FR").unwrap();
        assert_eq!(locale.language_tag(), "fr");

        assert_eq!(Locale::parse("C"), None);
        assert_eq!(Locale::parse("POSIX"), None);
        assert_eq!(Locale::parse(""), None);
        assert!("C.UTF-8".parse::<Locale>().is_err());
    }

    #[test]
    fn env_precedence() {
        let locale = Locale::from_lookup(|k| match k {
            "LC_ALL" => Some(String::new()),
            "LC_MESSAGES" => Some("ja_JP.UTF-8".to_owned()),
            "LANG" => Some("en_US.UTF-8".to_owned()),
            _ => None,
        });
        assert_eq!(locale.language_tag(), "ja-JP");

        let locale = Locale::from_lookup(|k| (k == "LANG").then(|| "C".to_owned()));
        assert_eq!(locale, Locale::undetermined());
        assert_eq!(locale.language_tag(), "und");

        let locale = Locale::from_lookup(|_| None);
        assert_eq!(locale, Locale::undetermined());
    }
}
