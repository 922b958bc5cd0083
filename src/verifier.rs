//! S3 request verification.
//!
//! A request is accepted when:
//! 1. it carries a bearer token (`X-Amz-Security-Token` header or query
//!    parameter) that verifies and whose audience includes `s3`;
//! 2. its SigV4 credential names service `s3` and an access key whose
//!    secret we can re-derive;
//! 3. re-signing a clone of the request with that secret reproduces the
//!    client's signature.
//!
//! Failures before the comparison are `Unauthorized`; a well-formed request
//! whose signature differs is `SignatureMismatch`.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::auth::{
    constant_time_eq, detect_auth_type, hash_payload, parse_amz_date, parse_date_stamp,
    parse_query_string, presign_request, presigned_still_valid, sign_request, within_clock_skew,
    AuthType, SignableRequest, SigningParams, STREAMING_PAYLOAD, UNSIGNED_PAYLOAD,
};
use crate::credentials::SigningKeyStore;
use crate::errors::ApiError;
use crate::token::{Principal, TokenVerifier};

/// Audience a token must carry to be used against the S3 surface.
pub const S3_AUDIENCE: &str = "s3";

const S3_SERVICE: &str = "s3";
const SECURITY_TOKEN_PARAM: &str = "X-Amz-Security-Token";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("signature mismatch")]
    SignatureMismatch,
}

impl AuthError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Unauthorized(_) => "unauthorized",
            AuthError::SignatureMismatch => "signature_mismatch",
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized(reason) => ApiError::Unauthorized { reason },
            AuthError::SignatureMismatch => ApiError::SignatureMismatch,
        }
    }
}

fn unauthorized(reason: impl Into<String>) -> AuthError {
    AuthError::Unauthorized(reason.into())
}

/// The parts of an inbound request that take part in verification.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a str,
    /// Raw path as sent on the request line.
    pub path: &'a str,
    /// Raw query string without the leading `?`.
    pub query: &'a str,
    pub headers: &'a HeaderMap,
    /// Fully buffered body.
    pub body: &'a [u8],
}

pub struct SignatureVerifier {
    keys: Arc<SigningKeyStore>,
    tokens: Arc<dyn TokenVerifier>,
    max_clock_skew: u64,
}

impl SignatureVerifier {
    pub fn new(keys: Arc<SigningKeyStore>, tokens: Arc<dyn TokenVerifier>) -> Self {
        Self {
            keys,
            tokens,
            max_clock_skew: 900,
        }
    }

    /// Seconds `X-Amz-Date` may differ from the server clock; 0 disables.
    pub fn with_max_clock_skew(mut self, secs: u64) -> Self {
        self.max_clock_skew = secs;
        self
    }

    pub async fn verify(&self, req: &InboundRequest<'_>) -> Result<Principal, AuthError> {
        let query = parse_query_string(req.query);

        let token = req
            .headers
            .get("x-amz-security-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| query.get(SECURITY_TOKEN_PARAM).cloned())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| unauthorized("missing security token"))?;

        let verified = self
            .tokens
            .verify(&token)
            .await
            .map_err(|e| unauthorized(format!("security token rejected: {e}")))?;
        if !verified.has_audience(S3_AUDIENCE) {
            return Err(unauthorized("security token lacks the s3 audience"));
        }

        let authorization = req.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        let auth = detect_auth_type(authorization, &query).map_err(unauthorized)?;
        let credential = auth
            .credential()
            .ok_or_else(|| unauthorized("request is not signed"))?
            .clone();
        if credential.service != S3_SERVICE {
            return Err(unauthorized(format!(
                "credential scope names service {:?}",
                credential.service
            )));
        }
        let secret = self
            .keys
            .secret_for(&credential.access_key_id)
            .ok_or_else(|| unauthorized("access key cannot be resolved"))?;

        let clone = SignableRequest {
            method: req.method.to_string(),
            path: req.path.to_string(),
            query: req.query.to_string(),
            headers: req.headers.clone(),
        };
        let now = Utc::now();

        let (expected, provided) = match auth {
            AuthType::Header(parsed) => {
                let amz_date = req
                    .headers
                    .get("x-amz-date")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| unauthorized("missing X-Amz-Date"))?;
                let time = parse_amz_date(amz_date)
                    .or_else(|| parse_date_stamp(&credential.date_stamp))
                    .ok_or_else(|| unauthorized("unparsable request time"))?;
                if self.max_clock_skew > 0 && !within_clock_skew(time, now, self.max_clock_skew) {
                    return Err(unauthorized("request time outside the allowed clock skew"));
                }

                let payload_hash = payload_hash(req);
                let params = SigningParams {
                    access_key_id: &credential.access_key_id,
                    secret_access_key: &secret,
                    session_token: None,
                    region: &credential.region,
                    service: &credential.service,
                    time,
                };
                let mut clone = clone;
                let expected = sign_request(
                    &mut clone,
                    &params,
                    &payload_hash,
                    Some(&parsed.signed_headers),
                )
                .map_err(|e| unauthorized(format!("unsignable request: {e}")))?;
                (expected, parsed.signature)
            }
            AuthType::Presigned(parsed) => {
                let time = parse_amz_date(&parsed.amz_date)
                    .or_else(|| parse_date_stamp(&credential.date_stamp))
                    .ok_or_else(|| unauthorized("unparsable request time"))?;
                if let Some(expires) = parsed.expires {
                    if !presigned_still_valid(time, expires, now) {
                        return Err(unauthorized("presigned URL has expired"));
                    }
                }
                let params = SigningParams {
                    access_key_id: &credential.access_key_id,
                    secret_access_key: &secret,
                    session_token: None,
                    region: &credential.region,
                    service: &credential.service,
                    time,
                };
                let presigned =
                    presign_request(&clone, &params, parsed.expires, Some(&parsed.signed_headers));
                (presigned.signature, parsed.signature)
            }
            AuthType::None => return Err(unauthorized("request is not signed")),
        };

        if !constant_time_eq(&expected, &provided) {
            debug!(
                access_key = %credential.access_key_id,
                subject = %verified.principal.subject,
                "signature mismatch"
            );
            return Err(AuthError::SignatureMismatch);
        }

        Ok(verified.principal)
    }
}

/// The payload hash the client must have signed.
///
/// Unsigned and streaming sentinels are used verbatim. Anything else is
/// replaced by the digest of the body actually received, whatever the
/// method, so a tampered body fails the comparison.
fn payload_hash(req: &InboundRequest<'_>) -> String {
    let declared = req
        .headers
        .get("x-amz-content-sha256")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if declared.eq_ignore_ascii_case(UNSIGNED_PAYLOAD) || declared.starts_with("STREAMING-") {
        return declared.to_string();
    }
    hash_payload(req.body)
}
