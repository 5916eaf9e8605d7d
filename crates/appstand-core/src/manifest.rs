//! Manifest decoding and cross-field consistency checks.
//!
//! The manifest travels as an opaque JSON blob and is round-tripped to
//! clients untouched (apart from an optional injected `parameters` object).
//! Only the small subset needed by the ingestion pipeline is decoded here.
//! Consistency failures are aggregated and reported as one error.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::version::{Channel, VersionString};

/// The subset of manifest attributes the registry reads. Everything else in
/// the manifest is opaque.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestInfo {
    /// The publishing editor, as declared by the manifest.
    #[serde(default)]
    pub editor: String,
    /// The application slug, as declared by the manifest.
    #[serde(default)]
    pub slug: String,
    /// The version declared by the manifest.
    #[serde(default)]
    pub version: String,
    /// Path of the icon file inside the archive.
    #[serde(default)]
    pub icon: String,
    /// Screenshot paths inside the archive.
    #[serde(default)]
    pub screenshots: Vec<String>,
    /// Per-locale sections; only their screenshots matter here.
    #[serde(default)]
    pub locales: HashMap<String, LocaleInfo>,
}

/// A locale section of the manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocaleInfo {
    /// Locale-specific screenshot paths.
    #[serde(default)]
    pub screenshots: Vec<String>,
}

/// Manifest decode or consistency failure.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest bytes are not valid JSON.
    #[error("content of the manifest is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),

    /// The archive contains no manifest file at all.
    #[error("application tarball does not contain a manifest")]
    Missing,

    /// One or more fields disagree with the supplied version options.
    #[error("content of the manifest does not match: {0}")]
    Inconsistent(Issues),
}

/// Aggregated consistency failures, joined for display.
#[derive(Debug)]
pub struct Issues(pub Vec<String>);

impl fmt::Display for Issues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}

impl ManifestInfo {
    /// Decodes the registry-facing subset from raw manifest bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::NotJson`] if the bytes are not a JSON
    /// object of the expected shape.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ManifestError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Screenshot paths in discovery order: the top-level list first, then
    /// each locale's, duplicates dropped. Paths are returned as declared;
    /// the caller normalises them against the archive root.
    #[must_use]
    pub fn all_screenshots(&self) -> Vec<String> {
        let mut seen = self.screenshots.clone();
        for locale in self.locales.values() {
            for shot in &locale.screenshots {
                if !seen.contains(shot) {
                    seen.push(shot.clone());
                }
            }
        }
        seen
    }
}

/// Checks the decoded manifest against the supplied version string, plus
/// the optional `package.json` version if the archive carried one.
///
/// The version rule depends on the channel: stable and beta demand exact
/// equality, dev only requires the `MAJOR.MINOR.PATCH` prefix to match.
/// All failures are aggregated into one [`ManifestError::Inconsistent`].
///
/// # Errors
///
/// Returns the aggregated issues when any field is empty or mismatched.
pub fn check_consistency(
    manifest: &ManifestInfo,
    supplied: &VersionString,
    package_version: Option<&str>,
) -> Result<(), ManifestError> {
    let mut issues = Vec::new();

    if manifest.editor.is_empty() {
        issues.push(r#""editor" field is empty"#.to_owned());
    }
    if manifest.slug.is_empty() {
        issues.push(r#""slug" field is empty"#.to_owned());
    }

    if !version_rule_holds(supplied, &manifest.version) {
        issues.push(format!(
            r#""version" field does not match ({:?} != {:?})"#,
            manifest.version,
            supplied.as_str()
        ));
    }

    if let Some(pack) = package_version {
        if !pack.is_empty() && !version_rule_holds(supplied, pack) {
            issues.push(format!(
                r#"version from package.json does not match ({pack:?} != {:?})"#,
                supplied.as_str()
            ));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ManifestError::Inconsistent(Issues(issues)))
    }
}

fn version_rule_holds(supplied: &VersionString, declared: &str) -> bool {
    if declared.is_empty() {
        return false;
    }
    if supplied.channel() == Channel::Dev {
        match VersionString::parse(declared) {
            Ok(declared) => supplied.matches(&declared),
            Err(_) => false,
        }
    } else {
        supplied.as_str() == declared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(json: &str) -> ManifestInfo {
        ManifestInfo::from_bytes(json.as_bytes()).expect("valid manifest")
    }

    fn supplied(s: &str) -> VersionString {
        VersionString::parse(s).expect("valid version")
    }

    #[test]
    fn decodes_the_subset_and_ignores_the_rest() {
        let m = manifest(
            r#"{"editor":"acme","slug":"notes","version":"1.0.0","icon":"icon.svg",
               "screenshots":["shots/one.png"],"name":"Notes","permissions":{"files":{}}}"#,
        );
        assert_eq!(m.editor, "acme");
        assert_eq!(m.slug, "notes");
        assert_eq!(m.icon, "icon.svg");
        assert_eq!(m.screenshots, vec!["shots/one.png"]);
    }

    #[test]
    fn stable_requires_exact_version() {
        let m = manifest(r#"{"editor":"acme","slug":"notes","version":"1.0.0"}"#);
        assert!(check_consistency(&m, &supplied("1.0.0"), None).is_ok());
        assert!(check_consistency(&m, &supplied("1.0.1"), None).is_err());
    }

    #[test]
    fn dev_accepts_prefix_match() {
        let m = manifest(r#"{"editor":"acme","slug":"notes","version":"1.2.0"}"#);
        assert!(check_consistency(&m, &supplied("1.2.0-dev.abc12"), None).is_ok());
        assert!(check_consistency(&m, &supplied("1.3.0-dev.abc12"), None).is_err());
    }

    #[test]
    fn package_json_version_follows_the_same_rule() {
        let m = manifest(r#"{"editor":"acme","slug":"notes","version":"1.0.0"}"#);
        assert!(check_consistency(&m, &supplied("1.0.0"), Some("1.0.0")).is_ok());
        assert!(check_consistency(&m, &supplied("1.0.0"), Some("1.0.1")).is_err());
        let dev = manifest(r#"{"editor":"acme","slug":"notes","version":"1.2.0"}"#);
        assert!(check_consistency(&dev, &supplied("1.2.0-dev.ff"), Some("1.2.0")).is_ok());
    }

    #[test]
    fn failures_are_aggregated() {
        let m = manifest(r#"{"version":"0.9.0"}"#);
        let err = check_consistency(&m, &supplied("1.0.0"), None).unwrap_err();
        let text = err.to_string();
        assert!(text.contains(r#""editor" field is empty"#), "{text}");
        assert!(text.contains(r#""slug" field is empty"#), "{text}");
        assert!(text.contains(r#""version" field does not match"#), "{text}");
    }

    #[test]
    fn locale_screenshots_are_collected_in_discovery_order() {
        let m = manifest(
            r#"{"editor":"acme","slug":"notes","version":"1.0.0",
                "screenshots":["a.png","b.png"],
                "locales":{"fr":{"screenshots":["b.png","c.png"]}}}"#,
        );
        assert_eq!(m.all_screenshots(), vec!["a.png", "b.png", "c.png"]);
    }
}
