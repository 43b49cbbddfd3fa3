//! Stream Sessions
//!
//! One session per "send message" interaction: from the moment the user
//! message is stored until the response completes, fails, or is stopped.
//!
//! # State Machine
//!
//! ```text
//!            send()         stream opened
//!   Idle ───────────► Sending ───────────► Streaming ◄─┐ delta
//!                       │                    │   └─────┘
//!                       │ error / stop       │ complete / error / stop
//!                       ▼                    ▼
//!                 Failed | Cancelled   Completed | Failed | Cancelled
//! ```
//!
//! The session only tracks state. Writing deltas into the conversation store
//! is the client's job; the session's `accumulated_content` is the value the
//! client mirrors into the assistant message after every delta.

use serde::{Deserialize, Serialize};

use crate::backend::{CancelHandle, StreamSummary};
use crate::error::ChatError;
use crate::messages::{ConversationId, MessageId};

/// Lifecycle state of a stream session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No interaction in progress
    #[default]
    Idle,
    /// Messages stored, request being issued
    Sending,
    /// Request open, deltas may arrive
    Streaming,
    /// Response finished normally
    Completed,
    /// Response failed
    Failed,
    /// Stopped by the user
    Cancelled,
}

impl SessionStatus {
    /// Sending or streaming
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Sending | Self::Streaming)
    }

    /// Completed, failed or cancelled
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sending => "sending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one send interaction
#[derive(Debug)]
pub struct StreamSession {
    conversation_id: ConversationId,
    user_message_id: MessageId,
    assistant_message_id: MessageId,
    accumulated_content: String,
    cancel: Option<CancelHandle>,
    status: SessionStatus,
    error: Option<ChatError>,
    summary: Option<StreamSummary>,
}

impl StreamSession {
    /// Start a session for freshly stored user/assistant messages
    ///
    /// The session begins in `Sending`.
    #[must_use]
    pub fn new(
        conversation_id: ConversationId,
        user_message_id: MessageId,
        assistant_message_id: MessageId,
    ) -> Self {
        Self {
            conversation_id,
            user_message_id,
            assistant_message_id,
            accumulated_content: String::new(),
            cancel: None,
            status: SessionStatus::Sending,
            error: None,
            summary: None,
        }
    }

    /// Record the open stream's cancel handle (`Sending -> Streaming`)
    pub fn attach(&mut self, cancel: CancelHandle) -> bool {
        if self.status != SessionStatus::Sending {
            return false;
        }
        self.cancel = Some(cancel);
        self.status = SessionStatus::Streaming;
        true
    }

    /// Append a content fragment
    ///
    /// Returns the updated content, or `None` if the session is not streaming.
    pub fn apply_delta(&mut self, fragment: &str) -> Option<&str> {
        if self.status != SessionStatus::Streaming {
            return None;
        }
        self.accumulated_content.push_str(fragment);
        Some(&self.accumulated_content)
    }

    /// `Streaming -> Completed`
    pub fn complete(&mut self, summary: StreamSummary) -> bool {
        if self.status != SessionStatus::Streaming {
            return false;
        }
        self.summary = Some(summary);
        self.finish(SessionStatus::Completed);
        true
    }

    /// `Sending | Streaming -> Failed`
    pub fn fail(&mut self, error: ChatError) -> bool {
        if !self.status.is_active() {
            return false;
        }
        self.error = Some(error);
        self.finish(SessionStatus::Failed);
        true
    }

    /// `Sending | Streaming -> Cancelled`
    ///
    /// Signals the transport to stop. A no-op on a finished session.
    pub fn cancel(&mut self) -> bool {
        if !self.status.is_active() {
            return false;
        }
        if let Some(ref cancel) = self.cancel {
            cancel.cancel();
        }
        self.finish(SessionStatus::Cancelled);
        true
    }

    fn finish(&mut self, status: SessionStatus) {
        self.status = status;
        self.cancel = None;
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Whether the session is sending or streaming
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Conversation the session writes into
    #[must_use]
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// The user message that started the session
    #[must_use]
    pub fn user_message_id(&self) -> &MessageId {
        &self.user_message_id
    }

    /// The assistant placeholder receiving deltas
    #[must_use]
    pub fn assistant_message_id(&self) -> &MessageId {
        &self.assistant_message_id
    }

    /// Concatenation of every delta applied so far
    #[must_use]
    pub fn accumulated_content(&self) -> &str {
        &self.accumulated_content
    }

    /// Failure, when the session failed
    #[must_use]
    pub fn error(&self) -> Option<&ChatError> {
        self.error.as_ref()
    }

    /// Stream summary, when the session completed
    #[must_use]
    pub fn summary(&self) -> Option<&StreamSummary> {
        self.summary.as_ref()
    }
}
