//! Bucket-level handler: the ListObjectsV2 shim.
//!
//! Terraform's S3 backend lists `env:/` to discover workspaces. Units are
//! addressed directly, so every listing is empty.

use std::collections::BTreeMap;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::errors::ApiError;
use crate::xml::{render_list_bucket_result, ListBucketResult};

const DEFAULT_MAX_KEYS: u32 = 1000;

/// `GET /s3/{bucket}?list-type=2` -- always-empty ListObjectsV2.
#[utoipa::path(
    get,
    path = "/s3/{bucket}",
    tag = "Bucket",
    operation_id = "ListObjectsV2",
    params(
        ("bucket" = String, Path, description = "Bucket name (not validated)"),
        ("list-type" = String, Query, description = "Must be 2"),
        ("prefix" = Option<String>, Query, description = "Echoed back"),
        ("max-keys" = Option<u32>, Query, description = "Echoed back, default 1000"),
    ),
    responses(
        (status = 200, description = "Empty ListBucketResult", content_type = "application/xml"),
        (status = 404, description = "Not a ListObjectsV2 request")
    )
)]
pub async fn list_objects_v2(
    bucket: &str,
    query: &BTreeMap<String, String>,
) -> Result<Response, ApiError> {
    let prefix = query.get("prefix").map(String::as_str).unwrap_or("");
    let max_keys = query
        .get("max-keys")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(DEFAULT_MAX_KEYS);

    let xml = render_list_bucket_result(&ListBucketResult {
        name: bucket,
        prefix,
        max_keys,
        key_count: 0,
        is_truncated: false,
    })
    .map_err(|e| ApiError::internal("list_failed", e))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        xml,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_listing_is_always_empty() {
        let query = BTreeMap::from([
            ("list-type".to_string(), "2".to_string()),
            ("prefix".to_string(), "env:/".to_string()),
        ]);
        let resp = list_objects_v2("tfstate", &query).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "application/xml");
        let xml = body_text(resp).await;
        assert!(xml.contains("<Name>tfstate</Name>"));
        assert!(xml.contains("<Prefix>env:/</Prefix>"));
        assert!(xml.contains("<KeyCount>0</KeyCount>"));
        assert!(xml.contains("<MaxKeys>1000</MaxKeys>"));
        assert!(xml.contains("<IsTruncated>false</IsTruncated>"));
    }

    #[tokio::test]
    async fn test_max_keys_is_echoed() {
        let query = BTreeMap::from([("max-keys".to_string(), "5".to_string())]);
        let xml = body_text(list_objects_v2("b", &query).await.unwrap()).await;
        assert!(xml.contains("<MaxKeys>5</MaxKeys>"));

        let query = BTreeMap::from([("max-keys".to_string(), "lots".to_string())]);
        let xml = body_text(list_objects_v2("b", &query).await.unwrap()).await;
        assert!(xml.contains("<MaxKeys>1000</MaxKeys>"));
    }
}
