//! Router-wide layers for request tracking and read-side headers.
//!
//! - **Request ids**: taken from `x-request-id` or generated, echoed back in
//!   the response and recorded on the request span
//! - **Tracing**: one `http_request` span per request via `tower-http`
//! - **Read consistency**: query routes announce `x-read-consistency: eventual`
//!
//! # Example
//!
//! ```ignore
//! let queries = eventually_consistent(Router::new().route("/reservations/:id", get(by_id)));
//! let app = observed(Router::new().merge(commands).merge(queries).with_state(state));
//! ```
//!
//! # Layer order
//!
//! `SetRequestId` runs first so that the trace span can read the id, and
//! `PropagateRequestId` copies it onto the response last.

use axum::{
    Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// Header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header marking responses served from the read model.
pub const READ_CONSISTENCY_HEADER: &str = "x-read-consistency";

/// Add request ids and HTTP tracing to every route of `router`.
#[must_use]
pub fn observed(router: Router) -> Router {
    let header = HeaderName::from_static(REQUEST_ID_HEADER);
    router
        .layer(PropagateRequestIdLayer::new(header.clone()))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            let request_id = request
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-");
            tracing::info_span!(
                "http_request",
                request_id = %request_id,
                method = %request.method(),
                uri = %request.uri(),
            )
        }))
        .layer(SetRequestIdLayer::new(header, MakeRequestUuid))
}

/// Mark every response of `router` as eventually consistent.
#[must_use]
pub fn eventually_consistent<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(SetResponseHeaderLayer::overriding(
        HeaderName::from_static(READ_CONSISTENCY_HEADER),
        HeaderValue::from_static("eventual"),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tower::ServiceExt;

    fn app() -> Router {
        let reads = eventually_consistent(Router::new().route("/read", get(|| async { "view" })));
        let writes = Router::new().route("/write", get(|| async { "ok" }));
        observed(reads.merge(writes))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_request_id_generated_if_missing() {
        let response = app().oneshot(get_request("/write")).await.unwrap();

        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .expect("request id header should be present");
        assert!(uuid::Uuid::parse_str(request_id.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_request_id_preserved_from_request() {
        let request = Request::builder()
            .uri("/write")
            .header(REQUEST_ID_HEADER, "req-42")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-42");
    }

    #[tokio::test]
    async fn test_consistency_header_only_on_read_routes() {
        let read = app().oneshot(get_request("/read")).await.unwrap();
        let write = app().oneshot(get_request("/write")).await.unwrap();

        assert_eq!(read.headers()[READ_CONSISTENCY_HEADER], "eventual");
        assert!(write.headers().get(READ_CONSISTENCY_HEADER).is_none());
    }
}
