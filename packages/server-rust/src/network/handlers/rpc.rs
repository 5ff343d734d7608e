//! `POST /forrst`: the protocol endpoint.
//!
//! The request body is decoded with the codec named by `Content-Type` and the
//! response is encoded with the same codec. Streamed calls answer
//! `application/x-ndjson`, one JSON chunk per line. A stream cut short by
//! shutdown ends with an `UNAVAILABLE` error chunk, so clients can tell it
//! from a truncated connection.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use forrst_core::{
    CallContext, Caller, Codec, ErrorCode, ErrorInfo, Principal, ResponseObject, StreamChunk,
};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::AppState;
use crate::network::middleware::REQUEST_ID_HEADER;
use crate::network::InFlightGuard;
use crate::service::{call_pipeline, DispatchError, DispatchOutcome, InboundCall, ResultStream};

/// Caller identity. Absent or blank means anonymous.
pub const CALLER_HEADER: &str = "x-forrst-caller";
/// Client-requested call timeout; only lowers the server default.
pub const TIMEOUT_HEADER: &str = "x-forrst-timeout-ms";
/// Acknowledgement `meta` of a streamed call, as JSON.
pub const META_HEADER: &str = "x-forrst-meta";
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

pub async fn rpc_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let codec = Codec::from_content_type(header_str(&headers, CONTENT_TYPE.as_str()));
    let context = CallContext::new(&*state.node_id, caller_from(&headers), trace_id(&headers));
    let timeout_ms = header_str(&headers, TIMEOUT_HEADER)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(state.call_timeout_ms, |ms| ms.min(state.call_timeout_ms));
    let call = InboundCall::new(body, codec, context, timeout_ms);

    let Some(guard) = state.shutdown.begin_call() else {
        let refused = DispatchError::Unavailable("server is not accepting calls".into())
            .into_response(call.request_id());
        return encode_response(codec, &refused);
    };

    match call_pipeline(&state.pipeline, call).await {
        DispatchOutcome::Response(response) => encode_response(codec, &response),
        DispatchOutcome::Stream {
            id,
            response,
            stream,
        } => {
            debug!(id = %id, "opening result stream");
            stream_response(&response, stream, guard, state.shutdown.drain_token())
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn caller_from(headers: &HeaderMap) -> Caller {
    match header_str(headers, CALLER_HEADER).map(str::trim) {
        Some(id) if !id.is_empty() => Caller::Principal(Principal::new(id)),
        _ => Caller::Anonymous,
    }
}

fn trace_id(headers: &HeaderMap) -> String {
    header_str(headers, REQUEST_ID_HEADER)
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_owned)
}

/// Encodes `response`; the HTTP status follows the primary error code.
fn encode_response(codec: Codec, response: &ResponseObject) -> Response {
    let status = response.primary_error().map_or(StatusCode::OK, |err| {
        StatusCode::from_u16(err.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    });
    match codec.encode_response(response) {
        Ok(body) => (
            status,
            [(CONTENT_TYPE, HeaderValue::from_static(codec.content_type()))],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, codec = codec.content_type(), "response encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// NDJSON body over `stream`. The in-flight guard lives as long as the body.
///
/// Draining cancels the producer and closes the body with an `UNAVAILABLE`
/// error chunk in place of the missing terminal chunk.
fn stream_response(
    ack: &ResponseObject,
    stream: ResultStream,
    guard: InFlightGuard,
    drain: CancellationToken,
) -> Response {
    let chunks = futures_util::stream::unfold(Some((stream, drain, guard)), |state| async move {
        let (mut stream, drain, guard) = state?;
        if stream.is_finished() {
            return None;
        }
        let next = tokio::select! {
            biased;
            () = drain.cancelled() => None,
            chunk = stream.next() => Some(chunk),
        };
        match next {
            Some(Some(chunk)) => Some((chunk, Some((stream, drain, guard)))),
            Some(None) => None,
            None => {
                stream.cancel();
                debug!("open stream cut short by shutdown");
                let info = ErrorInfo::new(ErrorCode::Unavailable, "Server is shutting down");
                Some((StreamChunk::error(info), None))
            }
        }
    });
    let lines = chunks.map(|chunk| encode_line(&chunk));

    let mut response = (
        StatusCode::OK,
        [(CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE))],
        Body::from_stream(lines),
    )
        .into_response();

    if let Some(meta) = ack.meta() {
        match serde_json::to_string(meta)
            .ok()
            .and_then(|json| HeaderValue::from_str(&json).ok())
        {
            Some(value) => {
                response.headers_mut().insert(META_HEADER, value);
            }
            None => debug!("stream meta is not a valid header value; omitted"),
        }
    }
    response
}

fn encode_line(chunk: &StreamChunk) -> Result<Bytes, serde_json::Error> {
    let mut line = serde_json::to_vec(chunk)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
