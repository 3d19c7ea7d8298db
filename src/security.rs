use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::response::Response;
use tower::{Layer, Service};
use tracing::warn;

use crate::config::Config;

/// Security headers and host/scheme admission, reimplementing the fixed
/// option set a hardened-defaults middleware library would apply: HSTS,
/// frame-deny, content-type sniffing protection, and an SSL redirect for
/// requests that reach us over a proxy-terminated plaintext hop.
#[derive(Clone)]
pub struct SecurityLayer {
    config: Arc<Config>,
}

impl SecurityLayer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for SecurityLayer {
    type Service = SecurityMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityMiddleware {
            inner,
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SecurityMiddleware<S> {
    inner: S,
    config: Arc<Config>,
}

impl<S> Service<Request> for SecurityMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let config = self.config.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // `unrolled/secure`'s `HostsProxyHeaders: ["X-Forwarded-Host"]`
            // option (see `server_secure.go`) makes the proxy-set header take
            // precedence over `Host` whenever present, since a TLS-terminating
            // load balancer in front of us rewrites `Host` to its own address.
            let host_header = req
                .headers()
                .get("x-forwarded-host")
                .and_then(|v| v.to_str().ok())
                .or_else(|| req.headers().get(header::HOST).and_then(|v| v.to_str().ok()))
                .map(|s| s.split(':').next().unwrap_or(s).to_string());

            if !config.host_names().is_empty() {
                let allowed = host_header
                    .as_deref()
                    .map(|h| config.host(h).is_some())
                    .unwrap_or(false);
                if !allowed {
                    warn!(?host_header, "rejected request: host not in allow-list");
                    let mut response = forbidden_response();
                    apply_security_headers(response.headers_mut());
                    return Ok(response);
                }
            }

            if config.is_tls_configured() {
                let forwarded_proto = req
                    .headers()
                    .get("x-forwarded-proto")
                    .and_then(|v| v.to_str().ok());
                if let Some(proto) = forwarded_proto {
                    if proto != "https" {
                        if let Some(host) = host_header.as_deref() {
                            let mut response = redirect_to_https(host, req.uri());
                            apply_security_headers(response.headers_mut());
                            return Ok(response);
                        }
                    }
                }
            }

            let mut response = inner.call(req).await?;
            apply_security_headers(response.headers_mut());
            Ok(response)
        })
    }
}

fn apply_security_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=315360000; preload"),
    );
    headers.insert(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    );
}

fn forbidden_response() -> Response {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .body(Body::from("forbidden"))
        .unwrap()
}

fn redirect_to_https(host: &str, uri: &Uri) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{host}{path_and_query}");
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .unwrap()
}
