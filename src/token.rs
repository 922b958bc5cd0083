//! Bearer access-token verification.
//!
//! Each S3 request carries the access token it was issued against (in
//! `X-Amz-Security-Token`). The token is what binds a derived key to a
//! principal, so it is verified on every request before the signature is.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

use crate::config::TokenConfig;

/// Identity established by a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
}

/// A verified token: the principal plus what the token is valid for.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub principal: Principal,
    pub audience: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl VerifiedToken {
    pub fn has_audience(&self, audience: &str) -> bool {
        self.audience.iter().any(|a| a == audience)
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token has no subject")]
    MissingSubject,
}

/// Verifies bearer tokens.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<VerifiedToken, TokenError>> + Send + 'a>>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AudienceClaim {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    aud: Option<AudienceClaim>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    groups: Vec<String>,
}

/// JWT verifier for HS256 shared-secret or EdDSA public-key tokens.
pub struct JwtTokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtTokenVerifier {
    pub fn hs256(secret: &[u8]) -> Self {
        Self::with_key(DecodingKey::from_secret(secret), Algorithm::HS256)
    }

    pub fn eddsa_pem(pem: &[u8]) -> Result<Self, TokenError> {
        Ok(Self::with_key(DecodingKey::from_ed_pem(pem)?, Algorithm::EdDSA))
    }

    fn with_key(key: DecodingKey, algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        // Audience is checked per use by the caller.
        validation.validate_aud = false;
        Self { key, validation }
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.validation.leeway = secs;
        self
    }

    /// Build from configuration: `HS256` uses the shared secret, `EdDSA`
    /// reads a PEM public key from disk.
    pub fn from_config(config: &TokenConfig) -> anyhow::Result<Self> {
        let verifier = match config.algorithm.to_ascii_uppercase().as_str() {
            "HS256" => {
                if config.hmac_secret.is_empty() {
                    anyhow::bail!("auth.token.hmac_secret is required for HS256");
                }
                Self::hs256(config.hmac_secret.as_bytes())
            }
            "EDDSA" => {
                let pem = std::fs::read(&config.public_key_pem).map_err(|e| {
                    anyhow::anyhow!("reading {}: {e}", config.public_key_pem)
                })?;
                Self::eddsa_pem(&pem)?
            }
            other => anyhow::bail!("unsupported token algorithm: {other}"),
        };
        let verifier = verifier.with_leeway(config.leeway);
        Ok(if config.issuer.is_empty() {
            verifier
        } else {
            verifier.with_issuer(&config.issuer)
        })
    }

    fn verify_sync(&self, token: &str) -> Result<VerifiedToken, TokenError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(TokenError::MissingSubject);
        }
        let audience = match claims.aud {
            Some(AudienceClaim::One(a)) => vec![a],
            Some(AudienceClaim::Many(list)) => list,
            None => Vec::new(),
        };
        Ok(VerifiedToken {
            principal: Principal {
                subject: claims.sub,
                roles: claims.roles,
                groups: claims.groups,
            },
            audience,
            expires_at: claims.exp.and_then(|t| Utc.timestamp_opt(t, 0).single()),
        })
    }
}

impl TokenVerifier for JwtTokenVerifier {
    fn verify<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<VerifiedToken, TokenError>> + Send + 'a>> {
        Box::pin(async move { self.verify_sync(token) })
    }
}
