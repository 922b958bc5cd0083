//! Axum router construction and S3 route mapping.
//!
//! The [`app`] function wires every endpoint to its handler and returns a
//! ready-to-serve [`axum::Router`].
//!
//! Everything under `/s3` is authenticated by [`auth_middleware`], which
//! buffers the body, verifies the bearer token and SigV4 signature, and
//! hands the request on with the caller's `Principal` attached. Object
//! keys are dispatched on their final segment: `terraform.tfstate` is the
//! state object, `terraform.tfstate.lock`/`.tflock` the lock object.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, OriginalUri, Path, RawQuery, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use utoipa::{OpenApi, ToSchema};

use crate::auth::parse_query_string;
use crate::credentials::IssueError;
use crate::errors::{generate_request_id, ApiError};
use crate::handlers::{bucket, lock, route_object, state, ObjectKind};
use crate::metrics::{metrics_handler, metrics_middleware, record_auth_failure, CREDENTIALS_ISSUED_TOTAL};
use crate::verifier::InboundRequest;
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    info(
        title = "statebridge",
        version = "0.1.0",
        description = "Terraform state backend speaking the S3 protocol"
    ),
    paths(
        health_check,
        issue_s3_creds,
        crate::handlers::bucket::list_objects_v2,
        crate::handlers::state::get_state,
        crate::handlers::state::head_state,
        crate::handlers::state::put_state,
        crate::handlers::lock::put_lock,
        crate::handlers::lock::get_lock,
        crate::handlers::lock::head_lock,
        crate::handlers::lock::delete_lock,
    ),
    components(schemas(IssuedCredentials)),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Auth", description = "Credential exchange"),
        (name = "Bucket", description = "Workspace listing"),
        (name = "State", description = "Unit state objects"),
        (name = "Lock", description = "Unit lock objects"),
    )
)]
pub struct ApiDoc;

/// Build the axum [`Router`].
pub fn app(state: Arc<AppState>) -> Router {
    let server = &state.config.server;
    let body_limit = server.max_state_size;
    let request_timeout = Duration::from_secs(server.request_timeout.max(1));

    let s3 = Router::new()
        .route("/:bucket", get(handle_get_bucket))
        .route("/:bucket/", get(handle_get_bucket))
        .route(
            "/:bucket/*key",
            get(handle_get_object)
                .head(handle_head_object)
                .put(handle_put_object)
                .delete(handle_delete_object),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/openapi.json", get(openapi_json))
        .route("/v1/auth/issue-s3-creds", post(issue_s3_creds))
        .nest("/s3", s3)
        .with_state(state)
        // Inner layers run first; the body limit applies to extractors after auth re-buffers.
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-amz-request-id`, `Date` and `Server` to every response.
async fn common_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-amz-request-id") {
        if let Ok(id) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-amz-request-id", id);
        }
    }
    if let Ok(date) = HeaderValue::from_str(&httpdate::fmt_http_date(std::time::SystemTime::now())) {
        headers.insert(header::DATE, date);
    }
    headers.insert(header::SERVER, HeaderValue::from_static("statebridge"));

    response
}

// -- Auth middleware ---------------------------------------------------------

/// Bearer-bound SigV4 authentication for the S3 routes.
///
/// The body is buffered once (bounded by `server.max_state_size`) so the
/// verifier can hash it, then re-attached for the handler.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let (mut parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, state.config.server.max_state_size)
        .await
        .map_err(|e| ApiError::bad_request("body_too_large", e.to_string()))?;

    // Signatures cover the path as sent, before `/s3` was stripped by nesting.
    let uri = parts
        .extensions
        .get::<OriginalUri>()
        .map(|original| original.0.clone())
        .unwrap_or_else(|| parts.uri.clone());

    let inbound = InboundRequest {
        method: parts.method.as_str(),
        path: uri.path(),
        query: uri.query().unwrap_or(""),
        headers: &parts.headers,
        body: &body,
    };
    let principal = match state.verifier.verify(&inbound).await {
        Ok(principal) => principal,
        Err(err) => {
            record_auth_failure(err.reason());
            debug!(method = %parts.method, path = %uri.path(), error = %err, "request rejected");
            return Err(err.into());
        }
    };

    debug!(subject = %principal.subject, method = %parts.method, path = %uri.path(), "authenticated");
    parts.extensions.insert(principal);
    Ok(next.run(Request::from_parts(parts, Body::from(body))).await)
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status":"ok"}"#,
    )
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

// -- Credential exchange -----------------------------------------------------

/// AWS `credential_process` output.
#[derive(Debug, Serialize, ToSchema)]
pub struct IssuedCredentials {
    #[serde(rename = "Version")]
    pub version: u8,
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "SessionToken")]
    pub session_token: String,
    /// RFC 3339.
    #[serde(rename = "Expiration")]
    pub expiration: String,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// `POST /v1/auth/issue-s3-creds` -- exchange a bearer token for S3
/// credentials bound to it.
#[utoipa::path(
    post,
    path = "/v1/auth/issue-s3-creds",
    tag = "Auth",
    operation_id = "IssueS3Credentials",
    responses(
        (status = 200, description = "Credentials", body = IssuedCredentials),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 500, description = "Issuing failed")
    )
)]
async fn issue_s3_creds(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<IssuedCredentials>, ApiError> {
    let token = bearer_token(&headers).ok_or_else(|| ApiError::BearerRejected {
        code: "missing_bearer",
        reason: "no bearer token".to_string(),
    })?;
    let verified = state
        .tokens
        .verify(token)
        .await
        .map_err(|e| ApiError::BearerRejected {
            code: "invalid_access",
            reason: e.to_string(),
        })?;

    let credential = state
        .issuer
        .issue(&verified.principal.subject, token)
        .map_err(|e| match e {
            IssueError::InvalidSubject => ApiError::BearerRejected {
                code: "invalid_access",
                reason: e.to_string(),
            },
            other => ApiError::internal("sts_issue_failed", other),
        })?;

    // The credential is useless once its bearer token expires.
    let expires_at = match verified.expires_at {
        Some(token_exp) if token_exp < credential.expires_at => token_exp,
        _ => credential.expires_at,
    };

    metrics::counter!(CREDENTIALS_ISSUED_TOTAL).increment(1);
    info!(
        subject = %verified.principal.subject,
        access_key = %credential.access_key_id,
        expires_at = %expires_at,
        "issued S3 credentials"
    );

    Ok(Json(IssuedCredentials {
        version: 1,
        access_key_id: credential.access_key_id,
        secret_access_key: credential.secret_access_key,
        session_token: credential.session_token,
        expiration: expires_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    }))
}

// -- Bucket-level dispatch ---------------------------------------------------

/// `GET /s3/:bucket` -- only `?list-type=2` is served.
async fn handle_get_bucket(
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, ApiError> {
    let query = parse_query_string(raw_query.as_deref().unwrap_or(""));
    if query.get("list-type").is_some_and(|v| v == "2") {
        bucket::list_objects_v2(&bucket, &query).await
    } else {
        Err(ApiError::UnknownObject)
    }
}

// -- Object-level dispatch ---------------------------------------------------

async fn handle_get_object(
    State(app): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let target = route_object(&bucket, &key)?;
    match target.kind {
        ObjectKind::State => state::get_state(app, &target.unit_id).await,
        ObjectKind::Lock => lock::get_lock(app, &target.unit_id).await,
    }
}

async fn handle_head_object(
    State(app): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let target = route_object(&bucket, &key)?;
    match target.kind {
        ObjectKind::State => state::head_state(app, &target.unit_id).await,
        ObjectKind::Lock => lock::head_lock(app, &target.unit_id).await,
    }
}

async fn handle_put_object(
    State(app): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let target = route_object(&bucket, &key)?;
    match target.kind {
        ObjectKind::State => {
            let query = parse_query_string(raw_query.as_deref().unwrap_or(""));
            state::put_state(app, &target.unit_id, &headers, &query, body).await
        }
        ObjectKind::Lock => lock::put_lock(app, &target.unit_id, &body).await,
    }
}

/// `DELETE` -- releases a lock; state objects cannot be deleted.
async fn handle_delete_object(
    State(app): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let target = route_object(&bucket, &key)?;
    match target.kind {
        ObjectKind::State => Err(ApiError::MethodNotAllowed),
        ObjectKind::Lock => lock::delete_lock(app, &target.unit_id, &headers, &body).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer  xyz "));
        assert_eq!(bearer_token(&headers), Some("xyz"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_openapi_lists_routes() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        assert!(paths.iter().any(|p| p.as_str() == "/health"));
        assert!(paths.iter().any(|p| p.as_str() == "/v1/auth/issue-s3-creds"));
        assert!(paths
            .iter()
            .any(|p| p.as_str() == "/s3/{bucket}/{unit}/terraform.tfstate"));
    }
}
