use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{info, instrument, warn};

use crate::config::{Config, Host};
use crate::metadata::{FileMeta, MetadataStore};
use crate::origin::{OriginBody, OriginClient, OriginError};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unknown host")]
    UnknownHost,

    #[error("malformed request path")]
    MalformedPath,

    #[error(transparent)]
    Metadata(#[from] crate::metadata::MetadataError),

    #[error(transparent)]
    Origin(#[from] OriginError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Orchestrates the whole request lifecycle: path normalization, the
/// metadata lookup, serving a hit (honoring `Range`/`If-Modified-Since`),
/// and, on a miss, fetching from the origin while simultaneously streaming
/// the response to the client and writing it to a temp file that is
/// renamed onto the cache path only once the write has fully succeeded.
pub struct CacheEngine {
    config: Arc<Config>,
    metadata: Arc<MetadataStore>,
    origin: Arc<OriginClient>,
    inflight: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl CacheEngine {
    pub fn new(config: Arc<Config>, metadata: Arc<MetadataStore>, origin: Arc<OriginClient>) -> Self {
        Self {
            config,
            metadata,
            origin,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[instrument(skip(self, req), fields(path = %req.uri().path()))]
    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, CacheError> {
        let method = req.method().clone();
        let normalized = normalize_path(req.uri().path())?;

        let host_header = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().host())
            .ok_or(CacheError::UnknownHost)?
            .to_string();

        let host = self
            .config
            .host(&host_header)
            .cloned()
            .ok_or(CacheError::UnknownHost)?;

        let rel_path = host.host_path(&normalized);
        let object_path = host.bucket_path(&normalized);
        let headers = req.headers().clone();

        if let Some(meta) = self.metadata.get(&rel_path)? {
            if let Some(resp) = self.try_serve_hit(&meta, &method, &headers).await? {
                return Ok(resp);
            }
            warn!(rel_path, "cached metadata present but file missing on disk, treating as a miss");
        }

        self.handle_miss(rel_path, object_path, host, method, headers).await
    }

    async fn try_serve_hit(
        &self,
        meta: &FileMeta,
        method: &Method,
        headers: &HeaderMap,
    ) -> Result<Option<Response<Body>>, CacheError> {
        let path = self.cache_file_path(&meta.filename);
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io(e)),
        };

        let file_len = file.metadata().await?.len();
        if meta.status_code == 200 && file_len != meta.size as u64 {
            warn!(filename = %meta.filename, "on-disk size disagrees with metadata, treating as a miss");
            return Ok(None);
        }

        if meta.status_code == 200 && method != Method::HEAD {
            if let Some(since) = headers
                .get(header::IF_MODIFIED_SINCE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_http_date)
            {
                if since >= meta.mod_time {
                    return Ok(Some(not_modified_response(meta)));
                }
            }
        }

        if meta.status_code == 200 {
            if let Some(range_header) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
                if let Some((start, end)) = parse_range(range_header, file_len) {
                    return Ok(Some(
                        self.partial_response(file, meta, start, end, file_len).await?,
                    ));
                }
                return Ok(Some(range_not_satisfiable(file_len)));
            }
        }

        Ok(Some(self.full_response(file, meta, method).await?))
    }

    async fn full_response(
        &self,
        file: tokio::fs::File,
        meta: &FileMeta,
        method: &Method,
    ) -> Result<Response<Body>, CacheError> {
        let mut builder = Response::builder().status(
            StatusCode::from_u16(meta.status_code).unwrap_or(StatusCode::OK),
        );
        copy_retained_headers(&mut builder, meta);
        builder = builder.header(header::LAST_MODIFIED, http_date(meta.mod_time));
        builder = builder.header(header::ACCEPT_RANGES, "bytes");

        let body = if *method == Method::HEAD {
            Body::empty()
        } else {
            Body::from_stream(file_byte_stream(file))
        };

        builder.body(body).map_err(|_| CacheError::MalformedPath)
    }

    async fn partial_response(
        &self,
        mut file: tokio::fs::File,
        meta: &FileMeta,
        start: u64,
        end: u64,
        total: u64,
    ) -> Result<Response<Body>, CacheError> {
        use tokio::io::AsyncSeekExt;
        file.seek(io::SeekFrom::Start(start)).await?;
        let len = end - start + 1;

        let mut builder = Response::builder().status(StatusCode::PARTIAL_CONTENT);
        copy_retained_headers(&mut builder, meta);
        builder = builder.header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}"));
        builder = builder.header(header::CONTENT_LENGTH, len.to_string());
        builder = builder.header(header::ACCEPT_RANGES, "bytes");

        let limited = file.take(len);
        let body = Body::from_stream(file_byte_stream(limited));
        builder.body(body).map_err(|_| CacheError::MalformedPath)
    }

    async fn handle_miss(
        &self,
        rel_path: String,
        object_path: String,
        host: Host,
        method: Method,
        headers: HeaderMap,
    ) -> Result<Response<Body>, CacheError> {
        loop {
            let (is_leader, notify) = {
                let mut inflight = self.inflight.lock().await;
                if let Some(notify) = inflight.get(&rel_path) {
                    (false, notify.clone())
                } else {
                    let notify = Arc::new(Notify::new());
                    inflight.insert(rel_path.clone(), notify.clone());
                    (true, notify)
                }
            };

            if !is_leader {
                notify.notified().await;
                if let Some(meta) = self.metadata.get(&rel_path)? {
                    if let Some(resp) = self.try_serve_hit(&meta, &method, &headers).await? {
                        return Ok(resp);
                    }
                }
                // The leader's fetch failed to produce a usable cache entry;
                // fall through and race to become the new leader ourselves.
                continue;
            }

            let result = self.fetch_and_store(rel_path.clone(), object_path, host).await;
            return result;
        }
    }

    #[instrument(skip(self, host), fields(rel_path = %rel_path))]
    async fn fetch_and_store(
        &self,
        rel_path: String,
        object_path: String,
        host: Host,
    ) -> Result<Response<Body>, CacheError> {
        let origin_result = self.origin.fetch(&object_path, &host).await;
        let (meta, body) = match origin_result {
            Ok(v) => v,
            Err(e) => {
                finish_inflight(&self.inflight, &rel_path).await;
                return Err(CacheError::from(e));
            }
        };

        let dest = self.cache_file_path(&meta.filename);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = tmp_path_for(&dest);

        let file = match tokio::fs::File::create(&tmp_path).await {
            Ok(f) => f,
            Err(e) => {
                finish_inflight(&self.inflight, &rel_path).await;
                return Err(CacheError::Io(e));
            }
        };

        let status = StatusCode::from_u16(meta.status_code).unwrap_or(StatusCode::OK);
        let mut response_headers = HeaderMap::new();
        for (name, values) in &meta.header {
            if let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) {
                for value in values {
                    if let Ok(header_value) = HeaderValue::from_str(value) {
                        response_headers.append(header_name.clone(), header_value);
                    }
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, io::Error>>();

        let metadata_store = self.metadata.clone();
        let meta_for_task = meta.clone();
        let dest_for_task = dest.clone();
        let tmp_for_task = tmp_path.clone();
        let inflight_for_task = self.inflight.clone();
        let rel_path_for_task = rel_path.clone();

        tokio::spawn(async move {
            let write_result = tee_body(body, file, tx).await;
            match write_result {
                Ok(()) => match tokio::fs::rename(&tmp_for_task, &dest_for_task).await {
                    Ok(()) => {
                        if let Err(e) = metadata_store.put(&meta_for_task) {
                            tracing::error!(error = %e, "failed to persist metadata after cache write");
                        } else {
                            info!(filename = %meta_for_task.filename, "cached object stored");
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "rename onto cache path failed, discarding temp file");
                        let _ = tokio::fs::remove_file(&tmp_for_task).await;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "origin stream interrupted, discarding partial cache file");
                    let _ = tokio::fs::remove_file(&tmp_for_task).await;
                }
            }
            // Waiters are only woken once the cache entry is durably visible
            // (or the attempt has definitively failed); notifying any earlier
            // lets a waiter's `metadata.get` race the rename/put above and
            // see `None`, defeating the single-flight coalescing.
            finish_inflight(&inflight_for_task, &rel_path_for_task).await;
        });

        let mut builder = Response::builder().status(status);
        *builder.headers_mut().unwrap() = response_headers;
        builder = builder.header(header::LAST_MODIFIED, http_date(meta.mod_time));

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let response_body = Body::from_stream(stream);

        builder.body(response_body).map_err(|_| CacheError::MalformedPath)
    }

    /// Deletes every cached entry whose cache key starts with `prefix`, on
    /// disk and in the metadata store.
    #[instrument(skip(self))]
    pub async fn purge_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let entries = self.metadata.find_by_filename_prefix(prefix)?;
        let count = entries.len();
        for entry in &entries {
            let path = self.cache_file_path(&entry.filename);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(error = %e, filename = %entry.filename, "failed to remove cache file during purge");
                }
            }
            self.metadata.delete(&entry.filename)?;
        }
        info!(prefix, count, "purged cache entries");
        Ok(count)
    }

    /// Deletes entries oldest-first (by `CreatedAt`) until total cached
    /// bytes are at or below `target_bytes`.
    #[instrument(skip(self))]
    pub async fn shrink_to(&self, target_bytes: i64) -> Result<usize, CacheError> {
        let ordered = self.metadata.iter_by_created_at_asc()?;
        let mut total: i64 = ordered.iter().map(|m| m.size).sum();
        let mut to_delete = total - target_bytes;
        let mut deleted = 0usize;

        for entry in ordered {
            if to_delete <= 0 {
                break;
            }
            let path = self.cache_file_path(&entry.filename);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(error = %e, filename = %entry.filename, "failed to remove cache file during shrink");
                }
            }
            self.metadata.delete(&entry.filename)?;
            to_delete -= entry.size;
            total -= entry.size;
            deleted += 1;
        }

        info!(target_bytes, remaining_bytes = total, deleted, "shrink complete");
        Ok(deleted)
    }

    fn cache_file_path(&self, rel_path: &str) -> PathBuf {
        Path::new(&self.config.cache_dir).join(rel_path)
    }
}

/// Wakes any requests coalesced onto the in-flight leader for `rel_path`.
/// Called only once the cache entry is durably visible (or the fetch has
/// definitively failed), so a woken waiter's `metadata.get` can't race the
/// leader's own write.
async fn finish_inflight(inflight: &Mutex<HashMap<String, Arc<Notify>>>, rel_path: &str) {
    let notify = {
        let mut inflight = inflight.lock().await;
        inflight.remove(rel_path)
    };
    if let Some(notify) = notify {
        notify.notify_waiters();
    }
}

fn tmp_path_for(dest: &Path) -> PathBuf {
    let suffix = format!(
        "{}.tmp-{}",
        dest.file_name().and_then(|n| n.to_str()).unwrap_or("cache"),
        uuid::Uuid::new_v4()
    );
    match dest.parent() {
        Some(parent) => parent.join(suffix),
        None => PathBuf::from(suffix),
    }
}

async fn tee_body(
    body: OriginBody,
    mut file: tokio::fs::File,
    tx: mpsc::UnboundedSender<Result<Bytes, io::Error>>,
) -> Result<(), io::Error> {
    match body {
        OriginBody::StatusText(text) => {
            let bytes = Bytes::from(text.into_bytes());
            file.write_all(&bytes).await?;
            let _ = tx.send(Ok(bytes));
            file.flush().await?;
            file.sync_all().await?;
        }
        OriginBody::Upstream(response) => {
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                file.write_all(&chunk).await?;
                if tx.send(Ok(chunk)).is_err() {
                    // client disconnected: cancel the tee rather than finish
                    // populating the cache on its behalf (spec.md §5 "client
                    // disconnect cancels the streaming tee"). The caller
                    // removes the partial temp file and skips the metadata
                    // write on this error.
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "client disconnected mid-stream",
                    ));
                }
            }
            file.flush().await?;
            file.sync_all().await?;
        }
    }
    Ok(())
}

fn file_byte_stream(
    file: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) -> impl futures_util::Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    futures_util::stream::unfold(
        (file, vec![0u8; 64 * 1024]),
        |(mut file, mut buf)| async move {
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => Some((Ok(Bytes::copy_from_slice(&buf[..n])), (file, buf))),
                Err(e) => Some((Err(e), (file, buf))),
            }
        },
    )
}

fn copy_retained_headers(builder: &mut axum::http::response::Builder, meta: &FileMeta) {
    for (name, values) in &meta.header {
        if let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) {
            for value in values {
                if let Ok(header_value) = HeaderValue::from_str(value) {
                    if let Some(headers) = builder.headers_mut() {
                        headers.append(header_name.clone(), header_value);
                    }
                }
            }
        }
    }
}

fn not_modified_response(meta: &FileMeta) -> Response<Body> {
    let mut builder = Response::builder().status(StatusCode::NOT_MODIFIED);
    builder = builder.header(header::LAST_MODIFIED, http_date(meta.mod_time));
    builder.body(Body::empty()).unwrap()
}

fn range_not_satisfiable(total: u64) -> Response<Body> {
    Response::builder()
        .status(StatusCode::RANGE_NOT_SATISFIABLE)
        .header(header::CONTENT_RANGE, format!("bytes */{total}"))
        .body(Body::empty())
        .unwrap()
}

fn http_date(unix_ts: i64) -> String {
    chrono::DateTime::from_timestamp(unix_ts, 0)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn parse_http_date(s: &str) -> Option<i64> {
    chrono::NaiveDateTime::parse_from_str(s, "%a, %d %b %Y %H:%M:%S GMT")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Parses a single-range `Range: bytes=start-end` header. Multi-range
/// requests are not supported: anything other than exactly one range is
/// treated as unsatisfiable by the caller.
fn parse_range(header_value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = header_value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;

    if start_str.is_empty() {
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 || total == 0 {
            return None;
        }
        let start = total.saturating_sub(suffix_len);
        return Some((start, total - 1));
    }

    let start: u64 = start_str.parse().ok()?;
    if start >= total {
        return None;
    }
    let end: u64 = if end_str.is_empty() {
        total - 1
    } else {
        end_str.parse().ok()?
    };
    if end >= total || end < start {
        return None;
    }
    Some((start, end))
}

/// Normalizes a request path: strips the leading slash, defaults an
/// empty/trailing-slash path to `index.html`, and rejects any `..`
/// component to prevent escaping the bucket namespace.
pub fn normalize_path(raw: &str) -> Result<String, CacheError> {
    let trimmed = raw.trim().trim_start_matches('/');
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err(CacheError::MalformedPath);
    }
    if trimmed.is_empty() || trimmed.ends_with('/') {
        return Ok(format!("{trimmed}index.html"));
    }
    Ok(trimmed.to_string())
}
