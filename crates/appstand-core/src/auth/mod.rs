//! Editors and their credentials.
//!
//! An editor is a publisher principal: a case-preserving display name with
//! case-insensitive identity, a random session salt, an optional ed25519
//! public key for version signature verification, and a per-editor secret
//! used as the MAC key for publish tokens.

mod token;
mod vault;

use std::sync::LazyLock;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use token::{generate_token, verify_token, EDITOR_TOKEN, MacConfig};
pub use vault::EditorVault;

use crate::error::RegistryError;

static EDITOR_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("editor name regex is valid"));

/// Byte length of the per-editor MAC secret.
const SECRET_LEN: usize = 32;

/// Byte length of the session salt.
const SALT_LEN: usize = 16;

/// A publisher principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Editor {
    /// Display name; identity is its lowercase form.
    pub name: String,
    /// Random salt regenerated on every update.
    #[serde(with = "b64")]
    pub session_salt: Vec<u8>,
    /// Optional ed25519 public key for version signatures.
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Vec<u8>>,
    /// MAC key for publish tokens.
    #[serde(with = "b64")]
    pub secret: Vec<u8>,
}

impl Editor {
    /// Creates an editor with fresh random salt and secret.
    ///
    /// # Errors
    ///
    /// Rejects names outside `^[A-Za-z][A-Za-z0-9_-]*$`.
    pub fn generate(name: &str) -> Result<Self, RegistryError> {
        if !EDITOR_NAME_REGEX.is_match(name) {
            return Err(RegistryError::AppInvalid(
                "the editor name contains invalid characters".to_owned(),
            ));
        }
        let mut rng = rand::thread_rng();
        let mut session_salt = vec![0u8; SALT_LEN];
        rng.fill_bytes(&mut session_salt);
        let mut secret = vec![0u8; SECRET_LEN];
        rng.fill_bytes(&mut secret);
        Ok(Self {
            name: name.to_owned(),
            session_salt,
            public_key: None,
            secret,
        })
    }

    /// The case-insensitive identity of this editor.
    #[must_use]
    pub fn id(&self) -> String {
        self.name.to_lowercase()
    }

    /// Whether `other` names this editor, ignoring case.
    #[must_use]
    pub fn is_named(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other)
    }

    /// Replaces the session salt and keys, keeping name and secret.
    pub fn rotate_salt(&mut self) {
        rand::thread_rng().fill_bytes(&mut self.session_salt);
    }

    /// Verifies an ed25519 signature over `data` against the editor public
    /// key.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unauthorized`] when no key is registered, the key
    /// is malformed, or the signature does not verify.
    pub fn verify_signature(&self, data: &[u8], signature: &[u8]) -> Result<(), RegistryError> {
        let key_bytes = self.public_key.as_deref().ok_or(RegistryError::Unauthorized)?;
        let key_bytes: &[u8; 32] = key_bytes.try_into().map_err(|_| RegistryError::Unauthorized)?;
        let key = VerifyingKey::from_bytes(key_bytes).map_err(|_| RegistryError::Unauthorized)?;
        let signature = Signature::from_slice(signature).map_err(|_| RegistryError::Unauthorized)?;
        key.verify(data, &signature)
            .map_err(|_| RegistryError::Unauthorized)
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
