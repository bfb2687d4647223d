use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;
use ulid::Ulid;

pub const CORRELATION_HEADER: &str = "x-correlation-id";
const MAX_CORRELATION_ID_CHARS: usize = 64;

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// The correlation id of the request being served, if any.
pub fn current() -> Option<String> {
    CORRELATION_ID.try_with(Clone::clone).ok()
}

pub fn extract(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(sanitize)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':'))
        .take(MAX_CORRELATION_ID_CHARS)
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Scopes every request under its correlation id and echoes it back.
pub async fn propagate(request: Request, next: Next) -> Response {
    let correlation_id = extract(request.headers());
    let span = tracing::info_span!(
        "request",
        correlation_id = %correlation_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = CORRELATION_ID
        .scope(correlation_id.clone(), next.run(request))
        .instrument(span)
        .await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}
