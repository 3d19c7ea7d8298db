use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::{instrument, warn};

use crate::config::Host;
use crate::metadata::FileMeta;

type HmacSha1 = Hmac<Sha1>;

/// Response headers we never copy from the origin into the cached/served
/// response: connection-scoped or origin-identity-leaking values that would
/// be meaningless (or wrong) replayed from disk later.
const HEADER_BLACKLIST: &[&str] = &[
    "server",
    "date",
    "content-length",
    "connection",
    "accept-ranges",
    "x-amz-request-id",
    "x-amz-id-2",
    "transfer-encoding",
];

/// Origin responses whose bodies are worth caching as-is. Anything else
/// (5xx, redirects, etc.) is surfaced to the caller but never written to
/// disk.
fn is_cacheable(status: u16) -> bool {
    status == 200 || status == 404
}

#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("request to origin failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("origin returned a non-cacheable status: {0}")]
    NotCacheable(u16),
}

/// Body payload returned alongside a [`FileMeta`]: either the origin's own
/// streamed response body, or a small synthetic status-text body used for
/// non-200 responses the original implementation substitutes in place of
/// an origin-supplied error body.
pub enum OriginBody {
    Upstream(reqwest::Response),
    StatusText(String),
}

pub struct OriginClient {
    http: reqwest::Client,
}

impl OriginClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent("s3tlsproxy")
            .build()?;
        Ok(Self { http })
    }

    /// Fetches `object_path` from `host`'s bucket, signing the request with
    /// AWS SigV2 using the host's access/secret key pair.
    #[instrument(skip(self, host), fields(host = %host.name, bucket = %host.bucket))]
    pub async fn fetch(
        &self,
        object_path: &str,
        host: &Host,
    ) -> Result<(FileMeta, OriginBody), OriginError> {
        let bucket_path = host.bucket_path(object_path);
        let url = format!("http://{}.s3.amazonaws.com/{}", host.bucket, bucket_path);
        let date = httpdate_now();

        let string_to_sign = format!("GET\n\n\n{date}\n/{}/{}", host.bucket, bucket_path);
        let signature = sign_v2(&host.secret_key, &string_to_sign);
        let authorization = format!("AWS {}:{}", host.access_key, signature);

        let response = self
            .http
            .get(&url)
            .header("Date", &date)
            .header("Accept-Encoding", "gzip")
            .header("Authorization", authorization)
            .send()
            .await?;

        let status = response.status().as_u16();
        if !is_cacheable(status) {
            warn!(status, url, "origin returned non-cacheable status");
            return Err(OriginError::NotCacheable(status));
        }

        let mut retained: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in response.headers().iter() {
            let lower = name.as_str().to_ascii_lowercase();
            if HEADER_BLACKLIST.contains(&lower.as_str()) {
                continue;
            }
            let value = if lower == "content-type" && status != 200 {
                "text/plain".to_string()
            } else {
                value.to_str().unwrap_or_default().to_string()
            };
            // Keyed by the lowercased header name so a later fallback insert
            // (e.g. a synthesized `content-type` for a non-200 response with
            // no origin-supplied one) can't land as a second, differently-
            // cased entry for the same header.
            retained.entry(lower).or_default().push(value);
        }

        let filename = host.host_path(object_path);
        let now = chrono::Utc::now().timestamp();

        let body = if status == 200 {
            let content_length = response.content_length().unwrap_or(0) as i64;
            let meta = FileMeta {
                filename,
                size: content_length,
                mod_time: now,
                status_code: status,
                header: retained,
                created_at: now,
            };
            (meta, OriginBody::Upstream(response))
        } else {
            let reason = reqwest::StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("Error");
            let text = format!("{status} {reason}");
            retained
                .entry("content-type".to_string())
                .or_insert_with(|| vec!["text/plain".to_string()]);
            let meta = FileMeta {
                filename,
                size: text.len() as i64,
                mod_time: now,
                status_code: status,
                header: retained,
                created_at: now,
            };
            (meta, OriginBody::StatusText(text))
        };

        Ok(body)
    }
}

fn sign_v2(secret: &str, string_to_sign: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts a key of any length");
    mac.update(string_to_sign.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

fn httpdate_now() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigv2_signature_is_deterministic() {
        let string_to_sign = "GET\n\n\nThu, 17 Nov 2005 18:49:58 GMT\n/johnsmith/photos/puppy.jpg";
        let sig_a = sign_v2("secret", string_to_sign);
        let sig_b = sign_v2("secret", string_to_sign);
        assert_eq!(sig_a, sig_b);
    }

    #[test]
    fn cacheable_status_classification() {
        assert!(is_cacheable(200));
        assert!(is_cacheable(404));
        assert!(!is_cacheable(403));
        assert!(!is_cacheable(500));
        assert!(!is_cacheable(301));
    }
}
