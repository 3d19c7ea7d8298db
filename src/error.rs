use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

/// Every error kind a request handler can surface, mapped to the HTTP
/// status the client sees. Bodies are plain text, never XML: this proxy
/// doesn't speak the S3 error-document format.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("unknown host")]
    UnknownHost,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("metadata store busy")]
    StoreBusy,

    #[error("origin unavailable: {0}")]
    OriginUnavailable(String),

    #[error("cache io error: {0}")]
    CacheIo(#[from] std::io::Error),

    #[error("metadata store error: {0}")]
    Metadata(#[from] crate::metadata::MetadataError),

    #[error("origin error: {0}")]
    Origin(#[from] crate::origin::OriginError),

    #[error("cache error: {0}")]
    Cache(#[from] crate::cache::CacheError),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ProxyError::UnknownHost => {
                warn!("rejected request for unknown host");
                (StatusCode::NOT_FOUND, "not found".to_string())
            }
            ProxyError::MalformedRequest(msg) => {
                warn!(%msg, "malformed request");
                (StatusCode::BAD_REQUEST, "bad request".to_string())
            }
            ProxyError::StoreBusy => {
                error!("metadata store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "temporarily unavailable".to_string(),
                )
            }
            ProxyError::OriginUnavailable(msg) => {
                warn!(%msg, "origin unavailable");
                (StatusCode::BAD_GATEWAY, "bad gateway".to_string())
            }
            ProxyError::CacheIo(err) => {
                error!(error = %err, "cache io error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
            ProxyError::Metadata(err) => {
                error!(error = %err, "metadata store error");
                match err {
                    crate::metadata::MetadataError::Busy(_) => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "temporarily unavailable".to_string(),
                    ),
                    _ => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal error".to_string(),
                    ),
                }
            }
            ProxyError::Origin(err) => {
                warn!(error = %err, "origin fetch failed");
                (StatusCode::BAD_GATEWAY, "bad gateway".to_string())
            }
            ProxyError::Cache(err) => {
                warn!(error = %err, "cache engine error");
                match err {
                    crate::cache::CacheError::UnknownHost => {
                        (StatusCode::NOT_FOUND, "not found".to_string())
                    }
                    crate::cache::CacheError::MalformedPath => {
                        (StatusCode::BAD_REQUEST, "bad request".to_string())
                    }
                    crate::cache::CacheError::Metadata(
                        crate::metadata::MetadataError::Busy(_),
                    ) => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "temporarily unavailable".to_string(),
                    ),
                    crate::cache::CacheError::Origin(_) => {
                        (StatusCode::BAD_GATEWAY, "bad gateway".to_string())
                    }
                    _ => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal error".to_string(),
                    ),
                }
            }
        };

        Response::builder()
            .status(status)
            .header("content-type", "text/plain; charset=utf-8")
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
