use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Extension, Query, Request};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::cache::CacheEngine;
use crate::config::Config;
use crate::error::ProxyError;

pub async fn purge(
    Extension(cache): Extension<Arc<CacheEngine>>,
    Extension(config): Extension<Arc<Config>>,
    req: Request,
) -> Result<Response, ProxyError> {
    let host_header = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or(ProxyError::UnknownHost)?;
    let host = config.host(host_header).ok_or(ProxyError::UnknownHost)?;

    let query: HashMap<String, String> = req
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    // Scoped to the caller's own virtual host only: `hostName + "/" + prefix`,
    // not `host.host_path(prefix)` (which would also insert the bucket/path
    // segments and over-narrow what a caller can purge).
    let full_prefix = format!("{}/{}", host.name, prefix);

    let count = cache.purge_prefix(&full_prefix).await?;
    Ok((StatusCode::OK, format!("purged {count} entries\n")).into_response())
}

pub async fn shrink(
    Extension(cache): Extension<Arc<CacheEngine>>,
    Extension(config): Extension<Arc<Config>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ProxyError> {
    let target = params
        .get("targetBytes")
        .and_then(|v| v.parse::<i64>().ok())
        .or(config.max_cache_bytes.map(|v| v as i64))
        .unwrap_or(50 << 10);

    let count = cache.shrink_to(target).await?;
    Ok((StatusCode::OK, format!("removed {count} entries\n")).into_response())
}

pub async fn serve_cache(
    Extension(cache): Extension<Arc<CacheEngine>>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    cache.handle(req).await.map_err(ProxyError::from)
}
