//! Client for the vector-operations dependency.
//!
//! Every operation funnels through the same breaker check, transport call
//! and outcome recording. A rejected call never reaches the transport.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

mod breaker;

pub use breaker::{
    BreakerConfig, BreakerRejection, BreakerSnapshot, CircuitBreaker, CircuitState,
    DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD,
};

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("vector backend circuit is open; retry after {retry_after_ms} ms")]
    CircuitOpen { retry_after_ms: u64 },
    #[error("vector backend call timed out")]
    Timeout,
    #[error("vector backend transport failure: {0}")]
    Transport(String),
    #[error("vector backend returned status {status}")]
    Upstream { status: u16, body: String },
    #[error("vector backend response could not be decoded: {0}")]
    Decode(String),
}

impl BackendError {
    /// Whether the dependency itself misbehaved. Client-side 4xx answers
    /// mean the backend is up and do not count against the breaker.
    #[must_use]
    pub fn counts_as_failure(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } => false,
            Self::Upstream { status, .. } => *status >= 500,
            Self::Timeout | Self::Transport(_) | Self::Decode(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOperation {
    Insert,
    SimilarityQuery,
    FilteredQuery,
    Ping,
}

impl VectorOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::SimilarityQuery => "similarity_query",
            Self::FilteredQuery => "filtered_query",
            Self::Ping => "ping",
        }
    }

    #[must_use]
    pub fn method(self) -> &'static str {
        match self {
            Self::Ping => "GET",
            _ => "POST",
        }
    }

    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::Insert => "/vectors/insert",
            Self::SimilarityQuery => "/vectors/query",
            Self::FilteredQuery => "/vectors/query/filtered",
            Self::Ping => "/health",
        }
    }
}

pub trait VectorTransport: Send + Sync {
    fn transport_name(&self) -> &'static str;

    /// # Errors
    /// Returns any [`BackendError`] other than `CircuitOpen`.
    fn send(&self, operation: VectorOperation, body: Option<&Value>) -> Result<Value, BackendError>;
}

#[derive(Debug, Clone)]
pub struct HttpVectorTransport {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpVectorTransport {
    #[must_use]
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { base_url: base_url.into().trim_end_matches('/').to_string(), agent }
    }
}

impl VectorTransport for HttpVectorTransport {
    fn transport_name(&self) -> &'static str {
        "http_json"
    }

    fn send(
        &self,
        operation: VectorOperation,
        body: Option<&Value>,
    ) -> Result<Value, BackendError> {
        let url = format!("{}{}", self.base_url, operation.path());
        let request = self
            .agent
            .request(operation.method(), &url)
            .set("accept", "application/json");

        let result = match body {
            Some(payload) => request.send_json(payload),
            None => request.call(),
        };

        match result {
            Ok(response) => response
                .into_json::<Value>()
                .map_err(|err| BackendError::Decode(err.to_string())),
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(BackendError::Upstream {
                    status,
                    body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                })
            }
            Err(ureq::Error::Transport(err)) if is_timeout(&err) => Err(BackendError::Timeout),
            Err(ureq::Error::Transport(err)) => Err(BackendError::Transport(err.to_string())),
        }
    }
}

fn is_timeout(err: &ureq::Transport) -> bool {
    std::error::Error::source(err)
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .is_some_and(|io| {
            matches!(io.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock)
        })
}

/// Dependency probe result. `connected` reflects whether a call actually
/// reached the backend during this probe.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DependencyHealth {
    pub ready: bool,
    pub connected: bool,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
}

pub struct BackendClient {
    transport: Box<dyn VectorTransport>,
    breaker: CircuitBreaker,
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("transport", &self.transport.transport_name())
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl BackendClient {
    #[must_use]
    pub fn new(transport: Box<dyn VectorTransport>, config: BreakerConfig) -> Self {
        Self { transport, breaker: CircuitBreaker::new(config) }
    }

    #[must_use]
    pub fn http(base_url: impl Into<String>, timeout: Duration, config: BreakerConfig) -> Self {
        Self::new(Box::new(HttpVectorTransport::new(base_url, timeout)), config)
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// # Errors
    /// See [`BackendError`].
    pub fn insert(&self, payload: &Value) -> Result<Value, BackendError> {
        self.call(VectorOperation::Insert, Some(payload))
    }

    /// # Errors
    /// See [`BackendError`].
    pub fn similarity_query(&self, payload: &Value) -> Result<Value, BackendError> {
        self.call(VectorOperation::SimilarityQuery, Some(payload))
    }

    /// # Errors
    /// See [`BackendError`].
    pub fn filtered_query(&self, payload: &Value) -> Result<Value, BackendError> {
        self.call(VectorOperation::FilteredQuery, Some(payload))
    }

    /// # Errors
    /// See [`BackendError`].
    pub fn ping(&self) -> Result<(), BackendError> {
        self.call(VectorOperation::Ping, None).map(|_| ())
    }

    /// Readiness probe. An open breaker reads as not ready without a
    /// network attempt, and probe failures are reported rather than raised.
    #[must_use]
    pub fn health(&self) -> DependencyHealth {
        let connected = self.ping().is_ok();
        let snapshot = self.breaker.snapshot();
        DependencyHealth {
            ready: connected && snapshot.state == CircuitState::Closed,
            connected,
            circuit_state: snapshot.state,
            consecutive_failures: snapshot.consecutive_failures,
        }
    }

    fn call(
        &self,
        operation: VectorOperation,
        body: Option<&Value>,
    ) -> Result<Value, BackendError> {
        if let Err(rejection) = self.breaker.check_at(Instant::now()) {
            tracing::debug!(
                operation = operation.as_str(),
                state = rejection.state.as_str(),
                retry_after_ms = rejection.retry_after_ms,
                "vector call rejected by circuit breaker"
            );
            return Err(BackendError::CircuitOpen { retry_after_ms: rejection.retry_after_ms });
        }

        match self.transport.send(operation, body) {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(err) if err.counts_as_failure() => {
                self.breaker.record_failure_at(Instant::now());
                tracing::warn!(
                    operation = operation.as_str(),
                    error = %err,
                    consecutive_failures = self.breaker.consecutive_failures(),
                    "vector call failed"
                );
                Err(err)
            }
            Err(err) => {
                self.breaker.record_success();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<Value, BackendError>>>,
        attempts: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<Value, BackendError>>, attempts: Arc<AtomicUsize>) -> Self {
            Self { script: Mutex::new(script.into()), attempts }
        }
    }

    impl VectorTransport for ScriptedTransport {
        fn transport_name(&self) -> &'static str {
            "scripted"
        }

        fn send(
            &self,
            _operation: VectorOperation,
            _body: Option<&Value>,
        ) -> Result<Value, BackendError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let mut script = match self.script.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            script.pop_front().unwrap_or(Ok(json!({"status": "ok"})))
        }
    }

    fn scripted_client(
        script: Vec<Result<Value, BackendError>>,
        threshold: u32,
        cooldown_ms: u64,
    ) -> (BackendClient, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let transport = ScriptedTransport::new(script, Arc::clone(&attempts));
        let client = BackendClient::new(
            Box::new(transport),
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_millis(cooldown_ms),
            },
        );
        (client, attempts)
    }

    #[test]
    fn five_failures_open_then_half_open_trial_closes() {
        let script = vec![
            Err(BackendError::Timeout),
            Err(BackendError::Transport("connection refused".to_string())),
            Err(BackendError::Upstream { status: 503, body: String::new() }),
            Err(BackendError::Timeout),
            Err(BackendError::Timeout),
            Ok(json!({"ids": ["v-1"]})),
        ];
        let (client, attempts) = scripted_client(script, 5, 60);

        for _ in 0..5 {
            assert!(client.insert(&json!({"vectors": []})).is_err());
        }
        assert_eq!(client.breaker().state(), CircuitState::Open);
        assert_eq!(attempts.load(Ordering::SeqCst), 5);

        let sixth = client.similarity_query(&json!({"vector": [0.1]}));
        assert!(matches!(sixth, Err(BackendError::CircuitOpen { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 5, "rejected call must not reach transport");

        std::thread::sleep(Duration::from_millis(80));
        let seventh = client.insert(&json!({"vectors": []}));
        assert_eq!(seventh, Ok(json!({"ids": ["v-1"]})));
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert_eq!(client.breaker().state(), CircuitState::Closed);
        assert_eq!(client.breaker().consecutive_failures(), 0);
    }

    #[test]
    fn client_errors_do_not_trip_the_breaker() {
        let script = vec![
            Err(BackendError::Upstream { status: 400, body: "bad vector".to_string() }),
            Err(BackendError::Upstream { status: 422, body: String::new() }),
        ];
        let (client, _) = scripted_client(script, 1, 60_000);
        assert!(client.filtered_query(&json!({})).is_err());
        assert!(client.filtered_query(&json!({})).is_err());
        assert_eq!(client.breaker().state(), CircuitState::Closed);
    }

    #[test]
    fn health_is_soft_negative_while_open() {
        let (client, attempts) = scripted_client(vec![Err(BackendError::Timeout)], 1, 60_000);
        let first = client.health();
        assert!(!first.ready);
        assert!(!first.connected);
        assert_eq!(first.circuit_state, CircuitState::Open);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let second = client.health();
        assert!(!second.ready);
        assert_eq!(second.consecutive_failures, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "open breaker must not probe");
    }

    #[test]
    fn health_reports_ready_when_ping_succeeds() {
        let (client, _) = scripted_client(Vec::new(), 5, 1_000);
        assert_eq!(
            client.health(),
            DependencyHealth {
                ready: true,
                connected: true,
                circuit_state: CircuitState::Closed,
                consecutive_failures: 0,
            }
        );
    }

    #[test]
    fn operations_map_to_routes() {
        assert_eq!(VectorOperation::Insert.path(), "/vectors/insert");
        assert_eq!(VectorOperation::FilteredQuery.path(), "/vectors/query/filtered");
        assert_eq!(VectorOperation::Ping.method(), "GET");
        assert_eq!(VectorOperation::SimilarityQuery.method(), "POST");
    }

    fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = match TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) => panic!("failed to bind test listener: {err}"),
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => panic!("failed to read listener address: {err}"),
        };
        std::thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream);
            let mut content_length = 0_usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                    break;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
            let mut request_body = vec![0_u8; content_length];
            let _ = reader.read_exact(&mut request_body);
            let response = format!(
                "{status_line}\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let mut stream = reader.into_inner();
            let _ = stream.write_all(response.as_bytes());
        });
        format!("http://{addr}")
    }

    #[test]
    fn http_transport_decodes_json_responses() {
        let url = serve_once("HTTP/1.1 200 OK", r#"{"matches":[{"id":"v-1","score":0.9}]}"#);
        let transport = HttpVectorTransport::new(format!("{url}/"), Duration::from_secs(5));
        let result =
            transport.send(VectorOperation::SimilarityQuery, Some(&json!({"vector": [1.0]})));
        assert_eq!(result, Ok(json!({"matches": [{"id": "v-1", "score": 0.9}]})));
    }

    #[test]
    fn http_transport_reports_upstream_status() {
        let url = serve_once("HTTP/1.1 503 Service Unavailable", r#"{"error":"overloaded"}"#);
        let transport = HttpVectorTransport::new(url, Duration::from_secs(5));
        match transport.send(VectorOperation::Ping, None) {
            Err(BackendError::Upstream { status, body }) => {
                assert_eq!(status, 503);
                assert!(body.contains("overloaded"));
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[test]
    fn http_transport_silence_counts_as_failure() {
        let listener = match TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) => panic!("failed to bind test listener: {err}"),
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => panic!("failed to read listener address: {err}"),
        };
        let transport =
            HttpVectorTransport::new(format!("http://{addr}"), Duration::from_millis(100));
        let result = transport.send(VectorOperation::Ping, None);
        match result {
            Err(err) => assert!(err.counts_as_failure(), "unexpected error kind: {err:?}"),
            Ok(value) => panic!("expected failure from silent backend, got {value}"),
        }
        drop(listener);
    }
}
