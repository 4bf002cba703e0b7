// HTTP middleware

use axum::{
    extract::Request,
    http::{StatusCode, Version},
    middleware::Next,
    response::Response,
};

use crate::error::AppError;

/// Reject every request that was not negotiated over HTTP/2.
///
/// Publish and subscribe keep both bodies open at once, which HTTP/1.x cannot
/// carry, so such requests never reach a handler.
pub async fn require_http2(request: Request, next: Next) -> Result<Response, AppError> {
    if request.version() != Version::HTTP_2 {
        tracing::debug!(
            version = ?request.version(),
            method = %request.method(),
            "Rejecting non-HTTP/2 request"
        );
        return Err(AppError::new(
            StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            "HTTP/2 required",
        ));
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware, routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(hits: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/",
                get(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "ok"
                    }
                }),
            )
            .route_layer(middleware::from_fn(require_http2))
    }

    fn request(version: Version) -> Request {
        Request::builder()
            .uri("/")
            .version(version)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_http2_passes_through() {
        let hits = Arc::new(AtomicUsize::new(0));

        let response = app(hits.clone()).oneshot(request(Version::HTTP_2)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http1_is_rejected_before_handler() {
        let hits = Arc::new(AtomicUsize::new(0));

        for version in [Version::HTTP_10, Version::HTTP_11] {
            let response = app(hits.clone()).oneshot(request(version)).await.unwrap();
            assert_eq!(response.status(), StatusCode::HTTP_VERSION_NOT_SUPPORTED);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
