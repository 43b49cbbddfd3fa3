//! Message Records
//!
//! The message half of the data model: identifiers, roles, the [`Message`]
//! record the UI renders, and the [`MessagePatch`] used to mutate one through
//! the [`ConversationStore`](crate::conversation::ConversationStore).
//!
//! # Design Philosophy
//!
//! Messages are plain data. They carry no behaviour beyond applying a patch;
//! whether a patch is *allowed* (content is only mutable while a message is
//! the active streaming target) is decided by the store, which is the single
//! place the data-model invariants are enforced.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    /// Create a new unique conversation ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique message identifier
///
/// Backed by a random UUID so ids stay unique across restarts once the
/// store has been rehydrated from persistence.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique message ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("msg-{}", Uuid::new_v4().simple()))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who authored a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The human user
    User,
    /// The model
    Assistant,
    /// System instructions (only ever sent on the wire, never stored)
    System,
}

impl MessageRole {
    /// Wire name of the role
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// A message in a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message ID, never reused
    pub id: MessageId,
    /// Conversation this message belongs to
    pub conversation_id: ConversationId,
    /// Who sent this message
    pub role: MessageRole,
    /// Message body
    pub content: String,
    /// When the message was created
    pub timestamp: DateTime<Utc>,
    /// Failure description when the response could not be produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// Create a user message
    #[must_use]
    pub fn user(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self::new(conversation_id, MessageRole::User, content.into())
    }

    /// Create an empty assistant placeholder that a stream will fill in
    #[must_use]
    pub fn assistant_placeholder(conversation_id: ConversationId) -> Self {
        Self::new(conversation_id, MessageRole::Assistant, String::new())
    }

    fn new(conversation_id: ConversationId, role: MessageRole, content: String) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            role,
            content,
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Whether this message carries an error decoration
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn apply(&mut self, patch: MessagePatch) {
        if let Some(content) = patch.content {
            self.content = content;
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
    }
}

/// Partial update for a [`Message`]
///
/// `None` fields are left untouched. `error` is doubly optional so a patch
/// can clear an error as well as set one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessagePatch {
    /// Replacement content
    pub content: Option<String>,
    /// Replacement error decoration
    pub error: Option<Option<String>>,
}

impl MessagePatch {
    /// Patch that replaces the content
    #[must_use]
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            error: None,
        }
    }

    /// Also set the error decoration
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    /// Also clear the error decoration
    #[must_use]
    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    /// Whether this patch touches the content
    #[must_use]
    pub fn changes_content(&self) -> bool {
        self.content.is_some()
    }
}
