//! statebridge -- a Terraform state backend speaking the S3 protocol.
//!
//! Clients exchange a bearer token for short-lived SigV4 credentials and
//! then use Terraform's stock `s3` backend against `/s3/{bucket}/{unit}/…`.
//! Each unit's state lives in a [`storage::backend::UnitStore`]; writes
//! refresh the dependency graph kept in a dedicated unit.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod deps;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod token;
pub mod verifier;
pub mod xml;

use std::sync::Arc;

use crate::config::Config;
use crate::credentials::CredentialIssuer;
use crate::deps::RefreshQueue;
use crate::storage::backend::UnitStore;
use crate::token::TokenVerifier;
use crate::verifier::SignatureVerifier;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Unit state and lock storage.
    pub store: Arc<dyn UnitStore>,
    /// SigV4 verification for the S3 surface.
    pub verifier: SignatureVerifier,
    /// Mints `SBC.` credentials for the issue endpoint.
    pub issuer: CredentialIssuer,
    /// Bearer token verification for the issue endpoint.
    pub tokens: Arc<dyn TokenVerifier>,
    /// Dependency-graph refresh queue; `None` when disabled.
    pub graph: Option<RefreshQueue>,
}
