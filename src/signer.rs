use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tracing::instrument;
use url::Url;

/// Signs and verifies maintenance-route URLs with a deterministic,
/// SHA-1-based scheme: unrelated to AWS SigV2/V4, used only to gate
/// `/__s3p/purge` and `/__s3p/shrink`.
#[derive(Clone)]
pub struct Signer {
    secret: String,
    now: fn() -> i64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("url, method and a non-zero duration are required")]
    InvalidArgs,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("url is missing a signature or expiry")]
    Missing,
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Signer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            now: unix_now,
        }
    }

    #[cfg(test)]
    fn with_clock(secret: impl Into<String>, now: fn() -> i64) -> Self {
        Self {
            secret: secret.into(),
            now,
        }
    }

    /// Produces a signed URL valid for `ttl` from now. `exclude` names query
    /// parameters whose values are allowed to change after signing (e.g. a
    /// CDN edge rewriting a cache-buster) without invalidating the
    /// signature: their values are carried in cleartext in the `exclude`
    /// parameter but excluded from the signed string.
    #[instrument(skip(self, url), fields(method))]
    pub fn sign_url(
        &self,
        url: &str,
        method: &str,
        ttl: Duration,
        exclude: &[&str],
    ) -> Result<String, SignerError> {
        if url.is_empty() || method.is_empty() || ttl.as_secs() == 0 {
            return Err(SignerError::InvalidArgs);
        }

        let mut parsed = Url::parse(url).map_err(|e| SignerError::InvalidUrl(e.to_string()))?;
        let mut query = query_map(&parsed);

        query.insert("secret".to_string(), vec![self.secret.clone()]);
        query.insert("method".to_string(), vec![method.to_ascii_uppercase()]);
        let expires = (self.now)() + ttl.as_secs() as i64;
        query.insert("expires".to_string(), vec![expires.to_string()]);

        let mut excluded_values: Vec<(String, String)> = Vec::new();
        if !exclude.is_empty() {
            query.insert("exclude".to_string(), vec![exclude.join(",")]);
            for key in exclude {
                if let Some(values) = query.remove(*key) {
                    if let Some(first) = values.into_iter().next() {
                        excluded_values.push(((*key).to_string(), first));
                    }
                }
            }
        }

        set_query(&mut parsed, &query);
        let signature = self.sum(parsed.as_str());

        let mut query = query_map(&parsed);
        query.remove("method");
        query.remove("secret");
        for (key, value) in excluded_values {
            query.insert(key, vec![value]);
        }
        query.insert("sig".to_string(), vec![signature]);
        set_query(&mut parsed, &query);

        Ok(parsed.into())
    }

    /// Verifies a previously signed URL against `method`. Returns `Ok(true)`
    /// only when the signature matches and the URL has not expired; returns
    /// `Ok(false)` for a tampered signature or an expired one without
    /// distinguishing the two (both are simply "not verified").
    #[instrument(skip(self, url), fields(method))]
    pub fn verify_url(&self, url: &str, method: &str) -> Result<bool, SignerError> {
        let mut parsed = Url::parse(url).map_err(|e| SignerError::InvalidUrl(e.to_string()))?;
        let mut query = query_map(&parsed);

        let sig = query.get("sig").and_then(|v| v.first()).cloned();
        let expires_raw = query.get("expires").and_then(|v| v.first()).cloned();

        let (sig, expires_raw) = match (sig, expires_raw) {
            (Some(sig), Some(expires)) => (sig, expires),
            _ => return Err(SignerError::Missing),
        };

        let expires: i64 = expires_raw
            .parse()
            .map_err(|_| SignerError::InvalidUrl("expires is not a unix timestamp".into()))?;

        if let Some(excluded) = query.get("exclude").and_then(|v| v.first()).cloned() {
            for key in excluded.split(',') {
                query.remove(key);
            }
        }

        if (self.now)() > expires {
            return Ok(false);
        }

        query.remove("sig");
        query.insert("secret".to_string(), vec![self.secret.clone()]);
        query.insert("method".to_string(), vec![method.to_ascii_uppercase()]);
        set_query(&mut parsed, &query);

        Ok(self.sum(parsed.as_str()) == sig)
    }

    fn sum(&self, s: &str) -> String {
        let digest = Sha1::digest(s.as_bytes());
        URL_SAFE.encode(digest)
    }
}

fn query_map(url: &Url) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url.query_pairs() {
        map.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    map
}

fn set_query(url: &mut Url, map: &BTreeMap<String, Vec<String>>) {
    if map.is_empty() {
        url.set_query(None);
        return;
    }
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, values) in map {
        for value in values {
            serializer.append_pair(key, value);
        }
    }
    url.set_query(Some(&serializer.finish()));
}
