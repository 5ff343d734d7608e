//! HTTP-level tower layers wrapped around the router.
//!
//! Listed outermost first; the first layer sees the request first and the
//! response last.

use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use axum::body::Body;
use tower_http::limit::{RequestBodyLimitLayer, ResponseBody};
use tower_http::map_response_body::MapResponseBodyLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

type HttpLayers = Stack<
    PropagateRequestIdLayer,
    Stack<
        TimeoutLayer,
        Stack<
            RequestBodyLimitLayer,
            Stack<
                MapResponseBodyLayer<fn(ResponseBody<Body>) -> Body>,
                Stack<
                    CorsLayer,
                    Stack<
                        TraceLayer<SharedClassifier<ServerErrorsAsFailures>>,
                        Stack<SetRequestIdLayer<MakeRequestUuid>, Identity>,
                    >,
                >,
            >,
        >,
    >,
>;

/// Builds the HTTP layer stack.
///
/// 1. `SetRequestId`: UUID `x-request-id` when the client sent none; the RPC
///    handler uses it as the call's trace id
/// 2. `Trace`
/// 3. `CORS`
/// 4. `RequestBodyLimit`: 413 above `max_body_bytes`
/// 5. `Timeout`: 408 when producing the response head takes too long
/// 6. `PropagateRequestId`
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let x_request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(&config.cors_origins))
        .layer(MapResponseBodyLayer::new(
            Body::new as fn(ResponseBody<Body>) -> Body,
        ))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

/// `"*"` allows any origin; anything else is an explicit allowlist.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layers_build_from_defaults() {
        let _layers = build_http_layers(&NetworkConfig::default());
    }

    #[test]
    fn cors_accepts_explicit_origins() {
        let _cors = build_cors_layer(&[
            "http://localhost:3000".to_string(),
            "not a header value\n".to_string(),
        ]);
    }
}
