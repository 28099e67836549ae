use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::time::sleep;

use super::error::EngineError;
use super::types::{RunTaskRequest, RunTaskResponse, TaskResultsResponse, TaskStatusResponse};
use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::metrics::Metrics;

/// Tuning for retry, pacing and breaker behavior of one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Retries per request on transient failures (429, 5xx, transport).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub base_delay_ms: u64,
    /// Upper bound of the random jitter added to each backoff delay.
    pub max_jitter_ms: u64,
    /// Minimum spacing between requests to the engine.
    pub rate_limit_delay: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub breaker: BreakerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_jitter_ms: 250,
            rate_limit_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            breaker: BreakerConfig::default(),
        }
    }
}

/// HTTP client for the automation engine with bounded retry, proactive
/// rate limiting and circuit-breaker gating.
///
/// The breaker sees one failure per exhausted retry loop, not one per
/// attempt, so a single flaky request cannot open the circuit on its own.
/// There is no fabricated fallback: every failure propagates as an
/// [`EngineError`] the caller can classify.
pub struct ResilientClient {
    http: Client,
    base_url: String,
    api_key: String,
    config: ClientConfig,
    breaker: CircuitBreaker,
    /// Earliest Instant the next request may start; slot-reserved under the
    /// lock so concurrent callers space themselves out.
    next_slot: Mutex<Option<Instant>>,
    metrics: Arc<Metrics>,
}

impl ResilientClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        config: ClientConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .expect("failed to build HTTP client");
        let breaker = CircuitBreaker::new("engine", config.breaker.clone(), metrics.clone());
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            config,
            breaker,
            next_slot: Mutex::new(None),
            metrics,
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// `POST /run-task` — create a task on the engine.
    ///
    /// Critical write path: no fallback, failure propagates.
    pub async fn run_task(&self, req: &RunTaskRequest) -> Result<RunTaskResponse, EngineError> {
        let body = serde_json::to_value(req).map_err(|e| EngineError::Client {
            status: 0,
            message: format!("failed to serialize run-task request: {e}"),
        })?;
        self.execute(Method::POST, "/run-task", Some(body)).await
    }

    /// `GET /task-status/{taskId}`.
    pub async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse, EngineError> {
        self.execute(Method::GET, &format!("/task-status/{task_id}"), None)
            .await
    }

    /// `GET /task-results/{taskId}`.
    pub async fn task_results(&self, task_id: &str) -> Result<TaskResultsResponse, EngineError> {
        self.execute(Method::GET, &format!("/task-results/{task_id}"), None)
            .await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, EngineError> {
        self.breaker
            .try_acquire()
            .map_err(|open| EngineError::CircuitOpen {
                retry_in_ms: open.retry_in_ms,
            })?;

        let result = self.send_with_retry(method, path, body).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(err) if err.is_transient() => self.breaker.record_failure(),
            // 4xx is a caller problem, not a service-health signal.
            Err(_) => {}
        }
        result
    }

    async fn send_with_retry<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, EngineError> {
        let url = format!("{}{path}", self.base_url.trim_end_matches('/'));
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            Metrics::incr(&self.metrics.engine_calls);
            match self.send_once(&method, &url, body.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt <= self.config.max_retries => {
                    let mut delay = Duration::from_millis(self.backoff_delay_ms(attempt));
                    if let EngineError::RateLimited { retry_after_ms } = &err {
                        delay = delay.max(Duration::from_millis(*retry_after_ms));
                    }
                    Metrics::incr(&self.metrics.engine_retries);
                    tracing::warn!(
                        %url,
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transient engine failure, retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: &Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, EngineError> {
        self.pace().await;

        let mut request = self
            .http
            .request(method.clone(), url)
            .header("x-api-key", &self.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(EngineError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            if status.is_server_error() {
                return Err(EngineError::Server {
                    status: status.as_u16(),
                    message,
                });
            }
            return Err(EngineError::Client {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<T>().await?)
    }

    /// delay = base * 2^(attempt - 1) + jitter
    fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        let base = self
            .config
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let jitter = if self.config.max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.config.max_jitter_ms)
        };
        base + jitter
    }

    /// Reserve the next send slot and wait for it, enforcing the minimum
    /// inter-request delay across concurrent callers.
    async fn pace(&self) {
        if self.config.rate_limit_delay.is_zero() {
            return;
        }
        let wait = {
            let mut slot = self.next_slot.lock().expect("pacing lock poisoned");
            let now = Instant::now();
            let start = match *slot {
                Some(at) if at > now => at,
                _ => now,
            };
            *slot = Some(start + self.config.rate_limit_delay);
            start - now
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config() -> ClientConfig {
        ClientConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_jitter_ms: 0,
            rate_limit_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            breaker: BreakerConfig {
                failure_threshold: 100,
                ..BreakerConfig::default()
            },
        }
    }

    fn client(server: &MockServer, config: ClientConfig) -> ResilientClient {
        ResilientClient::new(server.uri(), "test-key", config, Metrics::new())
    }

    fn run_request() -> RunTaskRequest {
        RunTaskRequest {
            prompt: "Apply to Backend Engineer at Example Corp".into(),
            inputs: serde_json::json!({"email": "ana@example.com"}),
            webhook_url: None,
            max_duration_seconds: 900,
        }
    }

    #[tokio::test]
    async fn run_task_returns_external_task_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run-task"))
            .and(header("x-api-key", "test-key"))
            .and(body_partial_json(serde_json::json!({"maxDurationSeconds": 900})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"taskId": "T1"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, fast_config());
        let resp = client.run_task(&run_request()).await.unwrap();
        assert_eq!(resp.task_id, "T1");
    }

    #[tokio::test]
    async fn transient_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/task-status/T1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/task-status/T1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "running"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, fast_config());
        let resp = client.task_status("T1").await.unwrap();
        assert_eq!(resp.status, crate::state_machine::ReportedStatus::Running);
    }

    #[tokio::test]
    async fn rate_limit_is_retried_with_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/task-status/T1"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/task-status/T1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "completed"})),
            )
            .mount(&server)
            .await;

        let metrics = Metrics::new();
        let client = ResilientClient::new(server.uri(), "k", fast_config(), metrics.clone());
        let resp = client.task_status("T1").await.unwrap();
        assert_eq!(resp.status, crate::state_machine::ReportedStatus::Completed);
        assert_eq!(metrics.snapshot().engine_retries, 2);
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/task-status/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such task"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, fast_config());
        let err = client.task_status("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::Client { status: 404, .. }));
        // A 4xx is not a service-health signal.
        assert_eq!(client.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn exhausted_retry_loops_open_the_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/task-status/T1"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let config = ClientConfig {
            max_retries: 0,
            breaker: BreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(60),
                ..BreakerConfig::default()
            },
            ..fast_config()
        };
        let metrics = Metrics::new();
        let client = ResilientClient::new(server.uri(), "k", config, metrics.clone());

        for _ in 0..2 {
            let err = client.task_status("T1").await.unwrap_err();
            assert!(matches!(err, EngineError::Server { status: 500, .. }));
        }
        assert_eq!(client.breaker_state(), BreakerState::Open);

        // Third call is rejected without touching the network (expect(2)
        // above verifies on drop).
        let err = client.task_status("T1").await.unwrap_err();
        assert!(matches!(err, EngineError::CircuitOpen { .. }));
        assert_eq!(metrics.snapshot().breaker_rejections, 1);
    }

    #[tokio::test]
    async fn client_errors_do_not_trip_the_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run-task"))
            .respond_with(ResponseTemplate::new(422).set_body_string("missing prompt"))
            .expect(2)
            .mount(&server)
            .await;

        let config = ClientConfig {
            breaker: BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
            ..fast_config()
        };
        let client = client(&server, config);

        for _ in 0..2 {
            let err = client.run_task(&run_request()).await.unwrap_err();
            assert!(matches!(err, EngineError::Client { status: 422, .. }));
        }
        assert_eq!(client.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn timeout_is_a_transient_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/task-status/T1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "running"}))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let config = ClientConfig {
            max_retries: 0,
            request_timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let client = client(&server, config);
        let err = client.task_status("T1").await.unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn pacing_spaces_out_consecutive_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/task-status/T1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "running"})),
            )
            .mount(&server)
            .await;

        let config = ClientConfig {
            rate_limit_delay: Duration::from_millis(40),
            ..fast_config()
        };
        let client = client(&server, config);

        let started = Instant::now();
        client.task_status("T1").await.unwrap();
        client.task_status("T1").await.unwrap();
        client.task_status("T1").await.unwrap();
        // Slots at 0ms, 40ms and 80ms.
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}
