//! Chat Backend Traits
//!
//! The transport seam between the chat client and whatever actually produces
//! assistant text. The client only ever sees a [`StreamHandle`]: a channel of
//! [`StreamingToken`]s plus a [`CancelHandle`].
//!
//! # Design Philosophy
//!
//! A stream has exactly three ways to talk back (a content fragment, an error,
//! or completion) and they travel in order over one bounded channel, so the
//! consumer applies deltas FIFO without any locking. Cancellation flows the
//! other way over a watch channel that the backend checks before every
//! emission; once `cancel()` returns, no further token is produced.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::ChatError;
use crate::messages::MessageRole;
use crate::streaming::TokenUsage;

/// Token stream events from chat backends
#[derive(Clone, Debug, PartialEq)]
pub enum StreamingToken {
    /// A non-empty content fragment
    Token(String),
    /// The response ended normally
    Complete(StreamSummary),
    /// The request failed; nothing follows
    Error(ChatError),
}

impl StreamingToken {
    /// Whether this token ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }
}

/// What a finished stream looked like on the wire
///
/// Payloads the transport drops for leniency are counted here rather than
/// surfaced as errors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// `data: ` events decoded (excluding the end sentinel)
    pub data_events: u64,
    /// Fragments delivered to the consumer
    pub fragments: u64,
    /// Payloads that were not valid JSON
    pub malformed_payloads: u64,
    /// JSON payloads with no extractable fragment
    pub unrecognized_payloads: u64,
    /// Non-blank lines without the `data: ` prefix
    pub ignored_lines: u64,
    /// Token accounting, when the gateway reported it
    pub usage: Option<TokenUsage>,
}

/// One entry of the request's `messages` array
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Author role
    pub role: MessageRole,
    /// Message text
    pub content: String,
}

impl RequestMessage {
    /// Create a request message
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Body of a streaming completion request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier understood by the gateway
    pub model: String,
    /// Conversation context, oldest first, ending with the new user message
    pub messages: Vec<RequestMessage>,
    /// Always `true`: only event-stream responses are consumed
    pub stream: bool,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Nucleus sampling cutoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl CompletionRequest {
    /// Create an empty streaming request for a model
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            stream: true,
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    /// Append a message
    #[must_use]
    pub fn with_message(mut self, role: MessageRole, content: impl Into<String>) -> Self {
        self.messages.push(RequestMessage::new(role, content));
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set top-p
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }
}

/// Consumer side of a cancellation token
///
/// Cloning shares the token. `cancel()` is idempotent and safe after the
/// stream has finished; dropping every clone also counts as cancellation.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Signal the stream to stop
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether `cancel()` has been called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Producer side of a cancellation token
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Whether the consumer has cancelled or gone away
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once the consumer cancels or drops its handle
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Backend-side sender for one stream
///
/// Checks the cancellation token before every emission.
#[derive(Debug)]
pub struct StreamEmitter {
    tx: mpsc::Sender<StreamingToken>,
    signal: CancelSignal,
}

impl StreamEmitter {
    /// Deliver a token; `false` means the consumer is gone and the producer
    /// should stop
    pub async fn emit(&self, token: StreamingToken) -> bool {
        if self.signal.is_cancelled() {
            return false;
        }
        self.tx.send(token).await.is_ok()
    }

    /// Deliver a token without waiting for channel capacity
    pub fn try_emit(&self, token: StreamingToken) -> bool {
        !self.signal.is_cancelled() && self.tx.try_send(token).is_ok()
    }

    /// A separate view of the cancellation token, for use in `select!`
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        self.signal.clone()
    }

    /// Whether the consumer has cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }
}

/// Consumer side of one open stream
#[derive(Debug)]
pub struct StreamHandle {
    /// Tokens in arrival order
    pub receiver: mpsc::Receiver<StreamingToken>,
    /// Cancellation token for the stream
    pub cancel: CancelHandle,
}

impl StreamHandle {
    /// Split into receiver and cancel handle
    #[must_use]
    pub fn into_parts(self) -> (mpsc::Receiver<StreamingToken>, CancelHandle) {
        (self.receiver, self.cancel)
    }

    /// A handle that yields one error and ends
    #[must_use]
    pub fn failed(error: ChatError) -> Self {
        let (emitter, handle) = stream_channel(1);
        emitter.try_emit(StreamingToken::Error(error));
        handle
    }
}

/// Create a connected emitter/handle pair
///
/// A zero capacity is bumped to one.
#[must_use]
pub fn stream_channel(capacity: usize) -> (StreamEmitter, StreamHandle) {
    let (tx, receiver) = mpsc::channel(capacity.max(1));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    (
        StreamEmitter {
            tx,
            signal: CancelSignal { rx: cancel_rx },
        },
        StreamHandle {
            receiver,
            cancel: CancelHandle {
                tx: Arc::new(cancel_tx),
            },
        },
    )
}

/// Supplies a bearer token for each request
///
/// Authentication lives outside the core; any closure returning an optional
/// token qualifies.
pub trait TokenProvider: Send + Sync {
    /// Current token, if any
    fn token(&self) -> Option<String>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// Chat backend trait
///
/// Implement this trait to add support for different completion gateways.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Get the backend name (e.g., "Gateway")
    fn name(&self) -> &str;

    /// Check if the backend is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Issue a streaming request
    ///
    /// Returns immediately; the request runs on a spawned task and reports
    /// through the handle's receiver. Must be called from within a tokio
    /// runtime, otherwise the handle yields a single network error.
    fn open_stream(&self, request: &CompletionRequest) -> StreamHandle;
}
