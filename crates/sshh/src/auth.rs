//! Authentication callbacks and public-key permission extensions.
//!
//! Callers supply authentication policy as callbacks; the framework never
//! decides who may log in. On successful public-key authentication the
//! returned permissions are augmented with extensions describing the key,
//! so sessions can recover the authenticating key later without re-running
//! the callback.

use std::collections::HashMap;
use std::sync::Arc;

use russh_keys::PublicKeyBase64;
use russh_keys::key::PublicKey;

use crate::events::ConnInfo;

/// Extension key holding the algorithm name of the authenticating key.
pub const PERM_KEY_TYPE: &str = "pub-key-type";
/// Extension key holding the base64 wire encoding of the authenticating key.
pub const PERM_KEY_DATA: &str = "pub-key-data";
/// Extension key holding the legacy MD5 colon-hex fingerprint.
pub const PERM_KEY_FINGERPRINT: &str = "pub-key-fingerprint";

/// Permissions granted by an authentication callback.
///
/// Extensions are a free-form carrier across the authentication boundary;
/// the framework reserves the `pub-key-*` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    /// Free-form key/value pairs available to sessions.
    pub extensions: HashMap<String, String>,
}

impl Permissions {
    /// Returns an extension value by key.
    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).map(String::as_str)
    }
}

/// Why an authentication attempt was refused.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct AuthRejection(pub String);

impl AuthRejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Outcome of an authentication callback: granted permissions (possibly
/// none) or a rejection.
pub type AuthOutcome = Result<Option<Permissions>, AuthRejection>;

/// Password authentication callback.
pub type PasswordCallback = Arc<dyn Fn(&ConnInfo, &str) -> AuthOutcome + Send + Sync>;

/// Public-key authentication callback. The key has already been verified
/// against the client's signature by the transport.
pub type PublicKeyCallback = Arc<dyn Fn(&ConnInfo, &PublicKey) -> AuthOutcome + Send + Sync>;

/// Called once per authentication attempt with the method name and the
/// rejection, if any.
pub type AuthLogCallback = Arc<dyn Fn(&ConnInfo, &str, Option<&AuthRejection>) + Send + Sync>;

/// Computes the legacy MD5 fingerprint of a public key as lowercase
/// colon-separated hex pairs over the wire encoding.
pub fn fingerprint_md5(key: &PublicKey) -> String {
    let digest = md5::compute(key.public_key_bytes());
    digest
        .0
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Wraps a public-key callback so successful results always carry
/// materialized permissions with the `pub-key-*` extensions injected.
/// Rejections pass through untouched.
pub(crate) fn wrap_public_key_callback(callback: PublicKeyCallback) -> PublicKeyCallback {
    Arc::new(move |conn, key| {
        let mut permissions = callback(conn, key)?.unwrap_or_default();
        permissions
            .extensions
            .insert(PERM_KEY_TYPE.to_string(), key.name().to_string());
        permissions
            .extensions
            .insert(PERM_KEY_DATA.to_string(), key.public_key_base64());
        permissions
            .extensions
            .insert(PERM_KEY_FINGERPRINT.to_string(), fingerprint_md5(key));
        Ok(Some(permissions))
    })
}
