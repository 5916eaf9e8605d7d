//! Version string codec and channel ordering.
//!
//! A version string is three numeric components with an optional
//! `-beta.N` or `-dev.hex` suffix, e.g. `1.4.0`, `1.4.0-beta.2`,
//! `1.4.1-dev.7f3acc`. The suffix decides the release channel; the
//! absence of one means stable.
//!
//! Ordering is total and stable under ties: numeric triple first, then
//! stable outranks beta outranks dev, then the beta counter, then the
//! creation timestamp of the version document. "Latest in channel" is
//! defined over this order.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Accepted version syntax. Numeric components are capped at five digits,
/// dev suffixes at 40 hex characters.
static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(0|[1-9][0-9]{0,4})\.(0|[1-9][0-9]{0,4})\.(0|[1-9][0-9]{0,4})(-dev\.[a-f0-9]{1,40}|-beta\.(0|[1-9][0-9]{0,4}))?$",
    )
    .expect("version regex is valid")
});

const DEV_SUFFIX: &str = "-dev.";
const BETA_SUFFIX: &str = "-beta.";

/// A release channel, derived from the version string suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// No suffix.
    Stable,
    /// `-beta.N` suffix.
    Beta,
    /// `-dev.hex` suffix.
    Dev,
}

impl Channel {
    /// All channels, widest last. Iteration order matters to callers that
    /// fall back from stable to dev.
    pub const ALL: [Self; 3] = [Self::Stable, Self::Beta, Self::Dev];

    /// The channel name as used in URLs and documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Dev => "dev",
        }
    }

    /// Whether a version of channel `other` is visible from this channel.
    ///
    /// Stable sees only stable; beta sees stable and beta; dev sees all.
    #[must_use]
    pub const fn includes(self, other: Self) -> bool {
        match self {
            Self::Stable => matches!(other, Self::Stable),
            Self::Beta => matches!(other, Self::Stable | Self::Beta),
            Self::Dev => true,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(Self::Stable),
            "beta" => Ok(Self::Beta),
            "dev" => Ok(Self::Dev),
            _ => Err(RegistryError::ChannelInvalid),
        }
    }
}

/// The suffix part of a version string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Suffix {
    None,
    Beta(u32),
    Dev(String),
}

/// A syntactically valid version string, kept alongside its parsed parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionString {
    raw: String,
    major: u32,
    minor: u32,
    patch: u32,
    suffix: Suffix,
}

impl VersionString {
    /// Parses a version string, rejecting anything outside the accepted
    /// syntax.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::VersionInvalid`] on malformed input.
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        let caps = VERSION_REGEX
            .captures(raw)
            .ok_or_else(|| RegistryError::VersionInvalid(format!("bad syntax: {raw:?}")))?;

        // The regex caps each component at five digits, so u32 cannot
        // overflow here.
        let component = |idx: usize| -> u32 {
            caps.get(idx)
                .map(|m| m.as_str().parse().expect("digits within u32 range"))
                .unwrap_or(0)
        };

        let suffix = match caps.get(4).map(|m| m.as_str()) {
            None => Suffix::None,
            Some(s) if s.starts_with(BETA_SUFFIX) => {
                let counter = caps
                    .get(5)
                    .map(|m| m.as_str().parse().expect("digits within u32 range"))
                    .unwrap_or(0);
                Suffix::Beta(counter)
            },
            Some(s) => Suffix::Dev(s[DEV_SUFFIX.len()..].to_owned()),
        };

        Ok(Self {
            raw: raw.to_owned(),
            major: component(1),
            minor: component(2),
            patch: component(3),
            suffix,
        })
    }

    /// The verbatim version string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The channel this version belongs to.
    #[must_use]
    pub fn channel(&self) -> Channel {
        match self.suffix {
            Suffix::None => Channel::Stable,
            Suffix::Beta(_) => Channel::Beta,
            Suffix::Dev(_) => Channel::Dev,
        }
    }

    /// The three numeric components, irrespective of suffix.
    #[must_use]
    pub fn split(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }

    /// Whether two versions share the same `MAJOR.MINOR.PATCH` prefix.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.split() == other.split()
    }

    /// The ordering key for this version given its document timestamp.
    #[must_use]
    pub fn ordering_key(&self, created_at: DateTime<Utc>) -> OrderingKey {
        OrderingKey {
            triple: self.split(),
            channel_rank: match self.channel() {
                Channel::Stable => 2,
                Channel::Beta => 1,
                Channel::Dev => 0,
            },
            beta_counter: match self.suffix {
                Suffix::Beta(n) => n,
                _ => 0,
            },
            created_at,
        }
    }
}

impl fmt::Display for VersionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for VersionString {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Classifies a raw string without full validation. Total over valid
/// version strings.
#[must_use]
pub fn channel_of(version: &str) -> Channel {
    if version.contains(DEV_SUFFIX) {
        Channel::Dev
    } else if version.contains(BETA_SUFFIX) {
        Channel::Beta
    } else {
        Channel::Stable
    }
}

/// Strips the optional leading `v` accepted on the HTTP surface.
/// `v1.3.2` becomes `1.3.2`.
#[must_use]
pub fn strip_v_prefix(version: &str) -> &str {
    version.strip_prefix('v').unwrap_or(version)
}

/// Total ordering key over versions: numeric triple, then stable over beta
/// over dev, then the beta counter, then the document timestamp. Derived
/// comparison over the fields in declaration order realises the rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderingKey {
    triple: (u32, u32, u32),
    channel_rank: u8,
    beta_counter: u32,
    created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn v(s: &str) -> VersionString {
        VersionString::parse(s).expect("valid version")
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn accepts_well_formed_versions() {
        for ok in [
            "0.0.0",
            "1.0.0",
            "12345.0.99999",
            "1.2.3-beta.0",
            "1.2.3-beta.42",
            "1.2.3-dev.a",
            "1.2.3-dev.7f3acc0123456789abcdef0123456789abcdef01",
        ] {
            assert!(VersionString::parse(ok).is_ok(), "{ok} should parse");
        }
    }

    #[test]
    fn rejects_malformed_versions() {
        for bad in [
            "",
            "1",
            "1.2",
            "1.2.3.4",
            "01.2.3",
            "1.2.3-beta.01",
            "1.2.3-beta.",
            "1.2.3-dev.",
            "1.2.3-dev.XYZ",
            "1.2.3-rc.1",
            "123456.0.0",
            "v1.2.3",
            "1.2.3-dev.0123456789012345678901234567890123456789a",
        ] {
            assert!(VersionString::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn channel_classification_is_total() {
        assert_eq!(v("1.0.0").channel(), Channel::Stable);
        assert_eq!(v("1.0.0-beta.3").channel(), Channel::Beta);
        assert_eq!(v("1.0.0-dev.ffffff").channel(), Channel::Dev);
        assert_eq!(channel_of("2.1.0-beta.1"), Channel::Beta);
        assert_eq!(channel_of("2.1.0-dev.abc"), Channel::Dev);
        assert_eq!(channel_of("2.1.0"), Channel::Stable);
    }

    #[test]
    fn split_ignores_suffix() {
        assert_eq!(v("1.2.0-dev.abc12").split(), (1, 2, 0));
        assert_eq!(v("1.2.0").split(), (1, 2, 0));
        assert!(v("1.2.0-dev.abc12").matches(&v("1.2.0")));
        assert!(!v("1.2.1").matches(&v("1.2.0")));
    }

    #[test]
    fn v_prefix_is_stripped() {
        assert_eq!(strip_v_prefix("v1.3.2"), "1.3.2");
        assert_eq!(strip_v_prefix("1.3.2"), "1.3.2");
    }

    #[test]
    fn numeric_components_dominate_ordering() {
        let t = at(0);
        assert!(v("2.0.0").ordering_key(t) > v("1.9.9").ordering_key(t));
        assert!(v("1.10.0").ordering_key(t) > v("1.9.0").ordering_key(t));
        assert!(v("1.0.10").ordering_key(t) > v("1.0.9").ordering_key(t));
    }

    #[test]
    fn stable_outranks_beta_outranks_dev() {
        let t = at(0);
        let stable = v("1.0.0").ordering_key(t);
        let beta = v("1.0.0-beta.3").ordering_key(at(10));
        let dev = v("1.0.0-dev.ffffff").ordering_key(at(20));
        assert!(stable > beta);
        assert!(beta > dev);
        assert!(stable > dev);
    }

    #[test]
    fn beta_counters_break_ties() {
        let t = at(0);
        assert!(v("1.0.0-beta.10").ordering_key(t) > v("1.0.0-beta.9").ordering_key(t));
    }

    #[test]
    fn newer_dev_wins_on_timestamp() {
        let older = v("1.0.0-dev.aaaa").ordering_key(at(100));
        let newer = v("1.0.0-dev.bbbb").ordering_key(at(200));
        assert!(newer > older);
    }

    #[test]
    fn channel_visibility() {
        assert!(Channel::Stable.includes(Channel::Stable));
        assert!(!Channel::Stable.includes(Channel::Beta));
        assert!(Channel::Beta.includes(Channel::Stable));
        assert!(!Channel::Beta.includes(Channel::Dev));
        assert!(Channel::Dev.includes(Channel::Beta));
    }

    #[test]
    fn channel_parsing() {
        assert_eq!("stable".parse::<Channel>().unwrap(), Channel::Stable);
        assert_eq!("beta".parse::<Channel>().unwrap(), Channel::Beta);
        assert_eq!("dev".parse::<Channel>().unwrap(), Channel::Dev);
        assert!("nightly".parse::<Channel>().is_err());
    }
}
