//! MAC-authenticated publish tokens.
//!
//! A token is the message `name \0 expiry-unix-seconds \0 scope`, tagged
//! with HMAC-SHA256 under the editor secret and base64-encoded. The scope
//! is `*` for any app of the editor, otherwise an app-slug prefix. The tag
//! is checked in constant time.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::Editor;
use crate::error::RegistryError;

type HmacSha256 = Hmac<Sha256>;

/// Tag length produced by the keyed hash.
const TAG_LEN: usize = 32;

const SEPARATOR: u8 = 0x00;

/// Parameters of one token family.
#[derive(Debug, Clone, Copy)]
pub struct MacConfig {
    /// Domain-separation label mixed into the MAC.
    pub label: &'static str,
    /// Maximum length of the encoded token, in bytes.
    pub max_len: usize,
}

/// The publish-token family.
pub const EDITOR_TOKEN: MacConfig = MacConfig {
    label: "editor-token",
    max_len: 256,
};

/// Mints a token for `editor` limited to `scope`, valid for `max_age`
/// seconds from now.
///
/// # Errors
///
/// Fails when the encoded token would exceed the family's length cap.
pub fn generate_token(
    editor: &Editor,
    scope: &str,
    max_age_secs: u64,
) -> Result<String, RegistryError> {
    generate_token_at(editor, scope, max_age_secs, Utc::now())
}

/// Checks a token presented by `editor` for an operation on `app_slug`.
///
/// # Errors
///
/// [`RegistryError::Unauthorized`] on any failure: oversized or
/// undecodable token, bad tag, expiry, name mismatch, or scope not
/// prefixing the slug.
pub fn verify_token(editor: &Editor, app_slug: &str, token: &str) -> Result<(), RegistryError> {
    verify_token_at(editor, app_slug, token, Utc::now())
}

pub(crate) fn generate_token_at(
    editor: &Editor,
    scope: &str,
    max_age_secs: u64,
    now: DateTime<Utc>,
) -> Result<String, RegistryError> {
    let expiry = now.timestamp().saturating_add(max_age_secs as i64);
    let mut payload = Vec::new();
    payload.extend_from_slice(editor.name.as_bytes());
    payload.push(SEPARATOR);
    payload.extend_from_slice(expiry.to_string().as_bytes());
    payload.push(SEPARATOR);
    payload.extend_from_slice(scope.as_bytes());

    let tag = compute_tag(&editor.secret, &payload);
    payload.extend_from_slice(&tag);

    let encoded = STANDARD.encode(payload);
    if encoded.len() > EDITOR_TOKEN.max_len {
        return Err(RegistryError::Unauthorized);
    }
    Ok(encoded)
}

pub(crate) fn verify_token_at(
    editor: &Editor,
    app_slug: &str,
    token: &str,
    now: DateTime<Utc>,
) -> Result<(), RegistryError> {
    if token.len() > EDITOR_TOKEN.max_len {
        return Err(RegistryError::Unauthorized);
    }
    let raw = STANDARD.decode(token).map_err(|_| RegistryError::Unauthorized)?;
    if raw.len() <= TAG_LEN {
        return Err(RegistryError::Unauthorized);
    }
    let (payload, tag) = raw.split_at(raw.len() - TAG_LEN);

    let expected = compute_tag(&editor.secret, payload);
    if !bool::from(expected.as_slice().ct_eq(tag)) {
        return Err(RegistryError::Unauthorized);
    }

    let mut parts = payload.split(|&b| b == SEPARATOR);
    let (Some(name), Some(expiry), Some(scope), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RegistryError::Unauthorized);
    };

    let name = std::str::from_utf8(name).map_err(|_| RegistryError::Unauthorized)?;
    if !editor.is_named(name) {
        return Err(RegistryError::Unauthorized);
    }

    let expiry: i64 = std::str::from_utf8(expiry)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RegistryError::Unauthorized)?;
    if now.timestamp() > expiry {
        return Err(RegistryError::Unauthorized);
    }

    let scope = std::str::from_utf8(scope).map_err(|_| RegistryError::Unauthorized)?;
    if scope != "*" && !app_slug.starts_with(scope) {
        return Err(RegistryError::Unauthorized);
    }

    Ok(())
}

fn compute_tag(secret: &[u8], payload: &[u8]) -> [u8; TAG_LEN] {
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("hmac accepts keys of any length");
    mac.update(EDITOR_TOKEN.label.as_bytes());
    mac.update(&[SEPARATOR]);
    mac.update(payload);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn editor(name: &str) -> Editor {
        Editor::generate(name).expect("valid editor name")
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn round_trip_within_expiry() {
        let acme = editor("acme");
        let token = generate_token_at(&acme, "*", 3600, at(1_000)).unwrap();
        assert!(verify_token_at(&acme, "notes", &token, at(1_000)).is_ok());
        assert!(verify_token_at(&acme, "notes", &token, at(4_600)).is_ok());
        assert!(verify_token_at(&acme, "notes", &token, at(4_601)).is_err());
    }

    #[test]
    fn scope_is_a_slug_prefix() {
        let acme = editor("acme");
        let token = generate_token_at(&acme, "not", 3600, at(0)).unwrap();
        assert!(verify_token_at(&acme, "notes", &token, at(0)).is_ok());
        assert!(verify_token_at(&acme, "notary", &token, at(0)).is_ok());
        assert!(verify_token_at(&acme, "chat", &token, at(0)).is_err());
    }

    #[test]
    fn wildcard_scope_grants_any_app() {
        let acme = editor("acme");
        let token = generate_token_at(&acme, "*", 3600, at(0)).unwrap();
        assert!(verify_token_at(&acme, "anything", &token, at(0)).is_ok());
    }

    #[test]
    fn another_editor_cannot_use_the_token() {
        let acme = editor("acme");
        let other = editor("other");
        let token = generate_token_at(&acme, "*", 3600, at(0)).unwrap();
        assert!(verify_token_at(&other, "notes", &token, at(0)).is_err());
    }

    #[test]
    fn editor_name_in_token_is_case_insensitive() {
        let acme = editor("Acme");
        let token = generate_token_at(&acme, "*", 3600, at(0)).unwrap();
        let mut presented = acme.clone();
        presented.name = "ACME".to_owned();
        assert!(verify_token_at(&presented, "notes", &token, at(0)).is_ok());
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let acme = editor("acme");
        let token = generate_token_at(&acme, "not", 3600, at(0)).unwrap();

        let mut raw = STANDARD.decode(&token).unwrap();
        // Flip one payload byte; the tag no longer matches.
        raw[0] ^= 0x01;
        let forged = STANDARD.encode(raw);
        assert!(verify_token_at(&acme, "notes", &forged, at(0)).is_err());

        assert!(verify_token_at(&acme, "notes", "garbage!!", at(0)).is_err());
        assert!(verify_token_at(&acme, "notes", "", at(0)).is_err());
    }

    #[test]
    fn oversized_tokens_are_rejected_before_decoding() {
        let acme = editor("acme");
        let long = "A".repeat(EDITOR_TOKEN.max_len + 1);
        assert!(verify_token_at(&acme, "notes", &long, at(0)).is_err());
        // A long scope can push the encoded token over the cap at mint time.
        let wide_scope = "s".repeat(300);
        assert!(generate_token_at(&acme, &wide_scope, 3600, at(0)).is_err());
    }
}
