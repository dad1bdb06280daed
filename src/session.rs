use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters of the session digest kept in a [`SessionKey`].
///
/// 16 hex chars = 64 bits of the SHA-256 digest, which is enough that two
/// distinct session strings will not collide in any realistic deployment.
const FINGERPRINT_LEN: usize = 16;

/// Credentials for one Telegram account session.
///
/// Treated as opaque input: this layer never decodes or persists the session
/// string, it only fingerprints it to key the connection pool.
#[derive(Clone)]
pub struct SessionCredential {
    /// Numeric application id issued by Telegram.
    pub api_id: i64,
    /// Application secret paired with `api_id`.
    pub api_hash: String,
    /// Serialized session string produced by a prior login.
    pub session: String,
}

impl SessionCredential {
    pub fn new(api_id: i64, api_hash: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            api_id,
            api_hash: api_hash.into(),
            session: session.into(),
        }
    }

    /// Stable fingerprint of the session string.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.session.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..FINGERPRINT_LEN].to_string()
    }
}

// Secrets must not end up in logs; keep Debug output redacted.
impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("api_id", &self.api_id)
            .field("api_hash", &"<redacted>")
            .field("session", &"<redacted>")
            .finish()
    }
}

/// Identity of one pooled connection: account id plus session fingerprint.
///
/// Repeated lookups with the same credential always derive the same key, and
/// two different session strings for the same account map to different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    api_id: i64,
    fingerprint: String,
}

impl SessionKey {
    pub fn derive(credential: &SessionCredential) -> Self {
        Self {
            api_id: credential.api_id,
            fingerprint: credential.fingerprint(),
        }
    }

    pub fn api_id(&self) -> i64 {
        self.api_id
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.api_id, self.fingerprint)
    }
}
