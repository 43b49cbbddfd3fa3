//! Gateway Backend Implementation
//!
//! Streaming transport for an HTTP chat-completions gateway.
//!
//! # Gateway API
//!
//! - `POST {base_url}{completions_path}`: streaming completion; the response
//!   is an event stream of `data: {json}` lines ending with `data: [DONE]`
//! - `GET {base_url}{health_path}`: liveness probe
//!
//! Each request runs on its own spawned task. The task races the request
//! against the stream's cancellation token, so cancelling drops the response
//! (aborting the connection) and nothing further is emitted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::traits::{
    stream_channel, ChatBackend, CompletionRequest, StreamEmitter, StreamHandle, StreamSummary,
    StreamingToken, TokenProvider,
};
use crate::config::GatewayConfig;
use crate::error::ChatError;
use crate::streaming::{extract_usage, ContentExtractor, EventStream, EventStreamReader, SseEvent};

const EVENT_STREAM: &str = "text/event-stream";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP gateway backend
#[derive(Clone)]
pub struct GatewayBackend {
    config: GatewayConfig,
    http_client: reqwest::Client,
    token_provider: Option<Arc<dyn TokenProvider>>,
    extractor: ContentExtractor,
}

impl std::fmt::Debug for GatewayBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayBackend")
            .field("config", &self.config)
            .field("authenticated", &self.token_provider.is_some())
            .finish_non_exhaustive()
    }
}

impl GatewayBackend {
    /// Create a new gateway backend
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Network`] if the HTTP client cannot be built.
    pub fn new(config: GatewayConfig) -> Result<Self, ChatError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ChatError::network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            config,
            http_client,
            token_provider: None,
            extractor: ContentExtractor::default(),
        })
    }

    /// Attach a bearer-token source consulted on every request
    #[must_use]
    pub fn with_token_provider(mut self, provider: impl TokenProvider + 'static) -> Self {
        self.token_provider = Some(Arc::new(provider));
        self
    }

    /// Replace the content extraction cascade
    #[must_use]
    pub fn with_extractor(mut self, extractor: ContentExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Resolved configuration
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if path.is_empty() || path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    /// Completions endpoint URL
    #[must_use]
    pub fn completions_url(&self) -> String {
        self.url(&self.config.completions_path)
    }

    /// Health endpoint URL
    #[must_use]
    pub fn health_url(&self) -> String {
        self.url(&self.config.health_path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token_provider.as_ref().and_then(|p| p.token()) {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl ChatBackend for GatewayBackend {
    fn name(&self) -> &'static str {
        "Gateway"
    }

    async fn health_check(&self) -> bool {
        let request = self
            .authorize(self.http_client.get(self.health_url()))
            .timeout(HEALTH_TIMEOUT);

        match request.send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                let err = ChatError::from_status(response.status().as_u16());
                debug!(code = err.code(), "Health check rejected: {}", err);
                false
            }
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }

    fn open_stream(&self, request: &CompletionRequest) -> StreamHandle {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return StreamHandle::failed(ChatError::network("no async runtime available"));
        };

        let (emitter, handle) = stream_channel(self.config.channel_capacity);
        let builder = self
            .authorize(self.http_client.post(self.completions_url()))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, EVENT_STREAM)
            .json(request);

        let worker = StreamWorker {
            emitter,
            extractor: self.extractor.clone(),
            max_line_bytes: self.config.max_line_bytes,
        };
        runtime.spawn(worker.run(builder));

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Opened completion stream"
        );
        handle
    }
}

enum PumpOutcome {
    Finished(StreamSummary),
    Failed(ChatError),
    Abandoned,
}

/// Drives one response body into the stream channel
struct StreamWorker {
    emitter: StreamEmitter,
    extractor: ContentExtractor,
    max_line_bytes: usize,
}

impl StreamWorker {
    async fn run(self, request: reqwest::RequestBuilder) {
        let mut signal = self.emitter.signal();

        tokio::select! {
            biased;

            () = signal.cancelled() => {
                info!("Stream cancelled");
            }
            outcome = self.pump(request) => match outcome {
                PumpOutcome::Finished(summary) => {
                    info!(
                        fragments = summary.fragments,
                        data_events = summary.data_events,
                        malformed = summary.malformed_payloads,
                        unrecognized = summary.unrecognized_payloads,
                        ignored_lines = summary.ignored_lines,
                        "Stream completed"
                    );
                    self.emitter.emit(StreamingToken::Complete(summary)).await;
                }
                PumpOutcome::Failed(err) => {
                    warn!(code = err.code(), status = ?err.status(), "Stream failed: {}", err);
                    self.emitter.emit(StreamingToken::Error(err)).await;
                }
                PumpOutcome::Abandoned => {
                    debug!("Stream consumer went away");
                }
            },
        }
    }

    async fn pump(&self, request: reqwest::RequestBuilder) -> PumpOutcome {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return PumpOutcome::Failed(e.into()),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return PumpOutcome::Failed(ChatError::from_response_body(status.as_u16(), &body));
        }

        let reader = EventStreamReader::with_max_line_bytes(self.max_line_bytes);
        // A body that breaks off mid-stream is a dropped connection, not bad data
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ChatError::network(e.to_string())));
        let mut events = EventStream::new(Box::pin(body), reader);
        let mut summary = StreamSummary::default();

        while let Some(event) = events.next().await {
            match event {
                Ok(SseEvent::Data(payload)) => {
                    let Some(fragment) = self.interpret(&payload, &mut summary) else {
                        continue;
                    };
                    if !self.emitter.emit(StreamingToken::Token(fragment)).await {
                        return PumpOutcome::Abandoned;
                    }
                    summary.fragments += 1;
                }
                Ok(SseEvent::Done) => break,
                Err(err) => return PumpOutcome::Failed(err),
            }
        }

        let stats = events.stats();
        summary.data_events = stats.data_events;
        summary.ignored_lines = stats.ignored_lines;
        PumpOutcome::Finished(summary)
    }

    /// Parse one payload, record usage, and extract its fragment
    fn interpret(&self, payload: &str, summary: &mut StreamSummary) -> Option<String> {
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                summary.malformed_payloads += 1;
                debug!(error = %e, "Skipping malformed payload");
                return None;
            }
        };

        let usage = extract_usage(&value);
        if let Some(usage) = usage {
            summary.usage.get_or_insert_with(Default::default).merge(usage);
        }

        match self.extractor.extract(&value) {
            Some(fragment) => Some(fragment.to_string()),
            None => {
                if usage.is_none() {
                    summary.unrecognized_payloads += 1;
                    debug!("Skipping payload with no content fragment");
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::TokenUsage;

    fn backend(base_url: &str) -> GatewayBackend {
        GatewayBackend::new(GatewayConfig::with_base_url(base_url)).unwrap()
    }

    fn worker() -> StreamWorker {
        let (emitter, _handle) = stream_channel(1);
        StreamWorker {
            emitter,
            extractor: ContentExtractor::default(),
            max_line_bytes: 1024,
        }
    }

    #[test]
    fn test_url_building() {
        let gateway = backend("http://localhost:8080/api/");
        assert_eq!(
            gateway.completions_url(),
            "http://localhost:8080/api/chat/completions"
        );
        assert_eq!(gateway.health_url(), "http://localhost:8080/api/health");

        let mut config = GatewayConfig::with_base_url("https://gw.example.com");
        config.completions_path = "v1/stream".to_string();
        let gateway = GatewayBackend::new(config).unwrap();
        assert_eq!(gateway.completions_url(), "https://gw.example.com/v1/stream");
    }

    #[test]
    fn test_interpret_counts_drops() {
        let worker = worker();
        let mut summary = StreamSummary::default();

        assert_eq!(
            worker.interpret(r#"{"content":"Hel"}"#, &mut summary),
            Some("Hel".to_string())
        );
        assert_eq!(worker.interpret("not json", &mut summary), None);
        assert_eq!(worker.interpret(r#"{"id":"x"}"#, &mut summary), None);
        assert_eq!(
            worker.interpret(
                r#"{"done":true,"prompt_tokens":3,"completion_tokens":9}"#,
                &mut summary
            ),
            None
        );

        assert_eq!(summary.malformed_payloads, 1);
        assert_eq!(summary.unrecognized_payloads, 1);
        assert_eq!(
            summary.usage,
            Some(TokenUsage {
                prompt_tokens: Some(3),
                completion_tokens: Some(9),
            })
        );
    }

    #[test]
    fn test_open_stream_without_runtime_fails_cleanly() {
        let gateway = backend("http://localhost:1");
        let handle = gateway.open_stream(&CompletionRequest::new("m"));
        let (mut rx, _cancel) = handle.into_parts();
        assert!(matches!(
            rx.try_recv(),
            Ok(StreamingToken::Error(ChatError::Network { .. }))
        ));
    }

    #[test]
    fn test_debug_hides_token() {
        let gateway =
            backend("http://localhost:8080").with_token_provider(|| Some("s3cret".to_string()));
        let rendered = format!("{gateway:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("authenticated: true"));
    }
}
