//! Stateless S3 credentials.
//!
//! An access key encodes everything needed to re-derive its secret:
//! `<namespace>.<kid>.<sid>`, where `kid` names a master secret and `sid`
//! is random. The secret is `base64url(HMAC-SHA256(master[kid], sid))`, so
//! nothing is persisted when credentials are issued. Rotating master secrets
//! is a matter of adding a new kid and switching the active one; keys issued
//! under older kids keep verifying while their kid remains resolvable.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::auth::hmac_sha256;

/// Fixed tag that prefixes every access key issued here.
pub const ACCESS_KEY_NAMESPACE: &str = "SBC";

/// Length of the random session id embedded in an access key.
pub const SID_LEN: usize = 12;

/// Credential lifetime when none (or an unparsable one) is configured.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// Default environment variable prefix for master secrets.
pub const DEFAULT_ENV_PREFIX: &str = "STATEBRIDGE_STS_HMAC_";

const SID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IssueError {
    #[error("subject must not be empty")]
    InvalidSubject,
    #[error("no master secret for active key id {0:?}")]
    UnknownKid(String),
}

// ── Access key codec ────────────────────────────────────────────────

/// The decoded form of an access key id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyId {
    pub kid: String,
    pub sid: String,
}

impl AccessKeyId {
    /// Split `<namespace>.<kid>.<sid>`; anything else yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, '.');
        let (ns, kid, sid) = (parts.next()?, parts.next()?, parts.next()?);
        if ns != ACCESS_KEY_NAMESPACE || kid.is_empty() || sid.is_empty() {
            return None;
        }
        Some(Self {
            kid: kid.to_string(),
            sid: sid.to_string(),
        })
    }
}

impl std::fmt::Display for AccessKeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{ACCESS_KEY_NAMESPACE}.{}.{}", self.kid, self.sid)
    }
}

/// `base64url_nopad(HMAC-SHA256(master, sid))`.
pub fn derive_secret(master: &[u8], sid: &str) -> String {
    URL_SAFE_NO_PAD.encode(hmac_sha256(master, sid.as_bytes()))
}

fn random_sid() -> String {
    let mut rng = rand::thread_rng();
    (0..SID_LEN)
        .map(|_| SID_ALPHABET[rng.gen_range(0..SID_ALPHABET.len())] as char)
        .collect()
}

/// A fresh random master secret, base64url-encoded.
pub fn generate_master_secret() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
}

fn decode_master_secret(encoded: &str) -> Option<Vec<u8>> {
    let trimmed = encoded.trim().trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .ok()
        .filter(|bytes| !bytes.is_empty())
}

// ── Secret sources ──────────────────────────────────────────────────

/// Fallback lookup for master secrets not loaded at startup.
pub trait SecretSource: Send + Sync + 'static {
    fn master_secret(&self, kid: &str) -> Option<Vec<u8>>;
}

/// Reads `<prefix><kid>` from the process environment (base64url value).
#[derive(Debug, Clone)]
pub struct EnvSecretSource {
    prefix: String,
}

impl EnvSecretSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn var_name(&self, kid: &str) -> String {
        format!("{}{kid}", self.prefix)
    }
}

impl Default for EnvSecretSource {
    fn default() -> Self {
        Self::new(DEFAULT_ENV_PREFIX)
    }
}

impl SecretSource for EnvSecretSource {
    fn master_secret(&self, kid: &str) -> Option<Vec<u8>> {
        let raw = std::env::var(self.var_name(kid)).ok()?;
        let decoded = decode_master_secret(&raw);
        if decoded.is_none() {
            warn!(kid, "master secret in environment is not valid base64url");
        }
        decoded
    }
}

// ── Key store ───────────────────────────────────────────────────────

/// Immutable map of kid → master secret, plus the kid used for new keys.
///
/// Built once at startup and shared behind an `Arc`.
pub struct SigningKeyStore {
    active_kid: String,
    keys: HashMap<String, Vec<u8>>,
    fallback: Option<Arc<dyn SecretSource>>,
}

impl std::fmt::Debug for SigningKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kids: Vec<&String> = self.keys.keys().collect();
        kids.sort();
        f.debug_struct("SigningKeyStore")
            .field("active_kid", &self.active_kid)
            .field("kids", &kids)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl SigningKeyStore {
    pub fn new(active_kid: impl Into<String>, keys: HashMap<String, Vec<u8>>) -> Self {
        Self {
            active_kid: active_kid.into(),
            keys,
            fallback: None,
        }
    }

    /// Build from base64url-encoded configured secrets and a fallback source.
    ///
    /// If the active kid resolves nowhere, a random process-local secret is
    /// generated for it. Credentials issued under that secret stop verifying
    /// when the process restarts.
    pub fn load(
        active_kid: &str,
        configured: &HashMap<String, String>,
        source: Arc<dyn SecretSource>,
    ) -> Self {
        let mut keys = HashMap::new();
        for (kid, encoded) in configured {
            match decode_master_secret(encoded) {
                Some(secret) => {
                    keys.insert(kid.clone(), secret);
                }
                None => warn!(kid = %kid, "ignoring configured master secret: not valid base64url"),
            }
        }
        if !keys.contains_key(active_kid) {
            match source.master_secret(active_kid) {
                Some(secret) => {
                    keys.insert(active_kid.to_string(), secret);
                }
                None => {
                    warn!(
                        kid = active_kid,
                        "no master secret configured; using a random development secret"
                    );
                    keys.insert(active_kid.to_string(), rand::random::<[u8; 32]>().to_vec());
                }
            }
        }
        Self {
            active_kid: active_kid.to_string(),
            keys,
            fallback: Some(source),
        }
    }

    pub fn with_fallback(mut self, source: Arc<dyn SecretSource>) -> Self {
        self.fallback = Some(source);
        self
    }

    pub fn active_kid(&self) -> &str {
        &self.active_kid
    }

    /// Master secret for `kid`: loaded keys first, then the fallback source.
    pub fn resolve(&self, kid: &str) -> Option<Vec<u8>> {
        self.keys
            .get(kid)
            .cloned()
            .or_else(|| self.fallback.as_ref()?.master_secret(kid))
    }

    /// Re-derive the secret for an access key. `None` when the key is not
    /// in our namespace or its kid is unknown.
    pub fn secret_for(&self, access_key_id: &str) -> Option<String> {
        let key = AccessKeyId::parse(access_key_id)?;
        let master = self.resolve(&key.kid)?;
        Some(derive_secret(&master, &key.sid))
    }
}

// ── Issuer ──────────────────────────────────────────────────────────

/// An issued credential triple.
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_key_id: String,
    pub secret_access_key: String,
    /// The caller's bearer token, echoed back.
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CredentialIssuer {
    keys: Arc<SigningKeyStore>,
    ttl: Duration,
}

impl CredentialIssuer {
    pub fn new(keys: Arc<SigningKeyStore>, ttl: Duration) -> Self {
        Self { keys, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a credential for `subject`, bound to `session_token`.
    pub fn issue(&self, subject: &str, session_token: &str) -> Result<Credential, IssueError> {
        if subject.trim().is_empty() {
            return Err(IssueError::InvalidSubject);
        }
        let kid = self.keys.active_kid();
        let master = self
            .keys
            .resolve(kid)
            .ok_or_else(|| IssueError::UnknownKid(kid.to_string()))?;

        let key = AccessKeyId {
            kid: kid.to_string(),
            sid: random_sid(),
        };
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(15));
        Ok(Credential {
            secret_access_key: derive_secret(&master, &key.sid),
            access_key_id: key.to_string(),
            session_token: session_token.to_string(),
            expires_at: Utc::now() + ttl,
        })
    }
}

/// Parse a duration such as `900s`, `15m`, `1h30m` or a bare number of
/// seconds. Unparsable or zero values fall back to [`DEFAULT_TTL`].
pub fn parse_ttl(raw: &str) -> Duration {
    let raw = raw.trim();
    let parsed = match raw.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => humantime::parse_duration(raw).ok(),
    };
    match parsed {
        Some(d) if !d.is_zero() => d,
        _ => {
            if !raw.is_empty() {
                warn!(ttl = raw, "unparsable credential ttl; using default");
            }
            DEFAULT_TTL
        }
    }
}
