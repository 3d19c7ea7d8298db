use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::Response;
use tower::{Layer, Service};
use tracing::warn;

use crate::signer::{Signer, SignerError};

/// Gates `/__s3p/purge` and `/__s3p/shrink` behind the URL signer. When
/// `strict` is false (the default, matching the original deployment's
/// behavior), a failed check responds with a silent `200 OK` and an empty
/// body rather than an error, so a probing client learns nothing about
/// which check failed or whether the route exists at all.
#[derive(Clone)]
pub struct SigLayer {
    signer: Arc<Signer>,
    strict: bool,
}

impl SigLayer {
    pub fn new(signer: Arc<Signer>, strict: bool) -> Self {
        Self { signer, strict }
    }
}

impl<S> Layer<S> for SigLayer {
    type Service = SigMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SigMiddleware {
            inner,
            signer: self.signer.clone(),
            strict: self.strict,
        }
    }
}

#[derive(Clone)]
pub struct SigMiddleware<S> {
    inner: S,
    signer: Arc<Signer>,
    strict: bool,
}

impl<S> Service<Request> for SigMiddleware<S>
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
        let signer = self.signer.clone();
        let strict = self.strict;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let method = req.method().clone();
            let host = req
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("localhost");
            let path_and_query = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            let url = format!("https://{host}{path_and_query}");

            match signer.verify_url(&url, method.as_str()) {
                Ok(true) => inner.call(req).await,
                Ok(false) => {
                    warn!(%url, "maintenance route signature did not verify");
                    Ok(reject(strict, StatusCode::FORBIDDEN))
                }
                Err(SignerError::Missing) => {
                    warn!(%url, "maintenance route request missing signature");
                    Ok(reject(strict, StatusCode::UNAUTHORIZED))
                }
                Err(e) => {
                    warn!(%url, error = %e, "maintenance route signature malformed");
                    Ok(reject(strict, StatusCode::BAD_REQUEST))
                }
            }
        })
    }
}

fn reject(strict: bool, status: StatusCode) -> Response {
    if strict {
        Response::builder().status(status).body(Body::empty()).unwrap()
    } else {
        Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn rejects_unsigned_request_silently_by_default() {
        let signer = Arc::new(Signer::new("sekrit"));
        let layer = SigLayer::new(signer, false);

        let service = tower::service_fn(|_req: Request| async {
            Ok::<_, std::convert::Infallible>(Response::new(Body::empty()))
        });
        let mut middleware = layer.layer(service);

        let req = Request::builder()
            .method(Method::GET)
            .uri("/__s3p/shrink")
            .header("host", "cache.example")
            .body(Body::empty())
            .unwrap();

        let response = middleware.ready().await.unwrap().call(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn strict_mode_reports_missing_signature() {
        let signer = Arc::new(Signer::new("sekrit"));
        let layer = SigLayer::new(signer, true);

        let service = tower::service_fn(|_req: Request| async {
            Ok::<_, std::convert::Infallible>(Response::new(Body::empty()))
        });
        let mut middleware = layer.layer(service);

        let req = Request::builder()
            .method(Method::GET)
            .uri("/__s3p/shrink")
            .header("host", "cache.example")
            .body(Body::empty())
            .unwrap();

        let response = middleware.ready().await.unwrap().call(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_signature_passes_through() {
        let signer = Signer::new("sekrit");
        let signed_url = signer
            .sign_url("https://cache.example/__s3p/shrink", "GET", Duration::from_secs(60), &[])
            .unwrap();
        let layer = SigLayer::new(Arc::new(signer), true);

        let service = tower::service_fn(|_req: Request| async {
            Ok::<_, std::convert::Infallible>(Response::new(Body::empty()))
        });
        let mut middleware = layer.layer(service);

        let uri: axum::http::Uri = signed_url.parse().unwrap();
        let path_and_query = uri.path_and_query().unwrap().as_str().to_string();

        let req = Request::builder()
            .method(Method::GET)
            .uri(path_and_query)
            .header("host", "cache.example")
            .body(Body::empty())
            .unwrap();

        let response = middleware.ready().await.unwrap().call(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
