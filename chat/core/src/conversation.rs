//! Conversation Store
//!
//! The authoritative in-memory data model for conversations and their
//! messages. Streaming sessions and UI surfaces both go through the mutation
//! primitives here; nothing else touches the underlying maps.
//!
//! # Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    ConversationStore                        │
//! │  conversations: [newest, ..., oldest]                      │
//! │  messages:      ConversationId -> [Message; insertion order]│
//! │  active:        Option<ConversationId>                     │
//! │  streaming:     ConversationId -> MessageId (one target)   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every message operation takes the conversation id explicitly. Nothing is
//! resolved through the active pointer, so switching conversations while a
//! response streams cannot redirect its deltas.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::{ConversationId, Message, MessageId, MessagePatch, MessageRole};

/// A conversation record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Unique conversation identifier
    pub id: ConversationId,
    /// Display title
    pub title: String,
    /// When the conversation was created
    pub created_at: DateTime<Utc>,
    /// Last time the conversation or one of its messages changed
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new conversation with the given title
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the `updated_at` timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Partial update for a [`Conversation`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationPatch {
    /// Replacement title
    pub title: Option<String>,
}

impl ConversationPatch {
    /// Patch that renames the conversation
    #[must_use]
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
        }
    }
}

/// Derive a conversation title from the first message of a conversation
///
/// Takes the first `max_chars` characters and appends `...` when the text
/// was cut.
#[must_use]
pub fn derive_title(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let mut chars = text.chars();
    let prefix: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{prefix}...")
    } else {
        prefix
    }
}

/// Serializable copy of the persistent part of the store
///
/// The streaming-target map is deliberately absent: an in-flight stream does
/// not survive a reload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Conversations, most recent first
    pub conversations: Vec<Conversation>,
    /// Messages by conversation
    pub messages: HashMap<ConversationId, Vec<Message>>,
}

/// In-memory conversation/message store
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    active: Option<ConversationId>,
    streaming: HashMap<ConversationId, MessageId>,
}

impl ConversationStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// Add a conversation at the head of the listing
    ///
    /// Returns `false` if a conversation with the same id already exists.
    pub fn add_conversation(&mut self, conversation: Conversation) -> bool {
        if self.get_conversation(conversation.id).is_some() {
            return false;
        }
        self.messages.entry(conversation.id).or_default();
        self.conversations.insert(0, conversation);
        true
    }

    /// Apply a patch to a conversation
    pub fn update_conversation(&mut self, id: ConversationId, patch: ConversationPatch) -> bool {
        let Some(conversation) = self.conversation_mut(id) else {
            return false;
        };
        if let Some(title) = patch.title {
            conversation.title = title;
        }
        conversation.touch();
        true
    }

    /// Remove a conversation and its message list
    ///
    /// Refused while a stream still targets the conversation: the owning
    /// session must be cancelled first.
    pub fn delete_conversation(&mut self, id: ConversationId) -> Option<Conversation> {
        if let Some(message_id) = self.streaming.get(&id) {
            tracing::warn!(
                conversation_id = %id,
                message_id = %message_id,
                "Refusing to delete conversation with an active stream"
            );
            return None;
        }

        let idx = self.conversations.iter().position(|c| c.id == id)?;
        let removed = self.conversations.remove(idx);
        self.messages.remove(&id);
        if self.active == Some(id) {
            self.active = None;
        }
        Some(removed)
    }

    /// Set (or clear) the active conversation
    ///
    /// Returns `false` if the id does not name a known conversation.
    pub fn set_active_conversation(&mut self, id: Option<ConversationId>) -> bool {
        match id {
            Some(id) if self.get_conversation(id).is_none() => false,
            _ => {
                self.active = id;
                true
            }
        }
    }

    /// The active conversation id
    #[must_use]
    pub fn active_conversation_id(&self) -> Option<ConversationId> {
        self.active
    }

    /// The active conversation
    #[must_use]
    pub fn active_conversation(&self) -> Option<&Conversation> {
        self.active.and_then(|id| self.get_conversation(id))
    }

    /// All conversations, most recent first
    #[must_use]
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Look up a conversation
    #[must_use]
    pub fn get_conversation(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    fn conversation_mut(&mut self, id: ConversationId) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Append a message to a conversation
    ///
    /// Returns `false` if the conversation does not exist.
    pub fn add_message(&mut self, conversation_id: ConversationId, message: Message) -> bool {
        let Some(conversation) = self.conversation_mut(conversation_id) else {
            return false;
        };
        conversation.touch();
        self.messages
            .entry(conversation_id)
            .or_default()
            .push(message);
        true
    }

    /// Apply a patch to a message
    ///
    /// A patch that changes content is only applied while the message is the
    /// conversation's streaming target; otherwise the whole patch is refused
    /// and `None` is returned.
    pub fn update_message(
        &mut self,
        conversation_id: ConversationId,
        message_id: &MessageId,
        patch: MessagePatch,
    ) -> Option<&Message> {
        if patch.changes_content() && !self.is_streaming_target(conversation_id, message_id) {
            tracing::debug!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                "Ignoring content change to a message that is not streaming"
            );
            return None;
        }

        let message = self
            .messages
            .get_mut(&conversation_id)?
            .iter_mut()
            .find(|m| &m.id == message_id)?;
        message.apply(patch);
        Some(message)
    }

    /// Remove a message
    ///
    /// The active streaming target cannot be removed.
    pub fn delete_message(
        &mut self,
        conversation_id: ConversationId,
        message_id: &MessageId,
    ) -> Option<Message> {
        if self.is_streaming_target(conversation_id, message_id) {
            return None;
        }
        let messages = self.messages.get_mut(&conversation_id)?;
        let idx = messages.iter().position(|m| &m.id == message_id)?;
        Some(messages.remove(idx))
    }

    /// Messages of a conversation in insertion order
    #[must_use]
    pub fn list_messages(&self, conversation_id: ConversationId) -> &[Message] {
        self.messages
            .get(&conversation_id)
            .map_or(&[], Vec::as_slice)
    }

    /// Look up a message
    #[must_use]
    pub fn get_message(
        &self,
        conversation_id: ConversationId,
        message_id: &MessageId,
    ) -> Option<&Message> {
        self.list_messages(conversation_id)
            .iter()
            .find(|m| &m.id == message_id)
    }

    /// The most recent user message of a conversation
    #[must_use]
    pub fn last_user_message(&self, conversation_id: ConversationId) -> Option<&Message> {
        self.list_messages(conversation_id)
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
    }

    // ========================================================================
    // Streaming targets
    // ========================================================================

    /// Mark a message as the conversation's streaming target
    ///
    /// Returns `false` if the conversation already has a target or the
    /// message does not exist.
    pub fn begin_streaming(&mut self, conversation_id: ConversationId, message_id: MessageId) -> bool {
        if self.streaming.contains_key(&conversation_id)
            || self.get_message(conversation_id, &message_id).is_none()
        {
            return false;
        }
        self.streaming.insert(conversation_id, message_id);
        true
    }

    /// Clear the conversation's streaming target, freezing its content
    pub fn end_streaming(&mut self, conversation_id: ConversationId) -> Option<MessageId> {
        self.streaming.remove(&conversation_id)
    }

    /// The message currently receiving deltas in a conversation
    #[must_use]
    pub fn streaming_message_id(&self, conversation_id: ConversationId) -> Option<&MessageId> {
        self.streaming.get(&conversation_id)
    }

    fn is_streaming_target(&self, conversation_id: ConversationId, message_id: &MessageId) -> bool {
        self.streaming.get(&conversation_id) == Some(message_id)
    }

    // ========================================================================
    // Bulk
    // ========================================================================

    /// Copy the persistent state
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            conversations: self.conversations.clone(),
            messages: self.messages.clone(),
        }
    }

    /// Replace conversations and messages with a snapshot
    ///
    /// Streaming targets are dropped; the active pointer survives only if it
    /// still names a conversation.
    pub fn restore(&mut self, snapshot: StoreSnapshot) {
        self.conversations = snapshot.conversations;
        self.messages = snapshot.messages;
        for conversation in &self.conversations {
            self.messages.entry(conversation.id).or_default();
        }
        self.streaming.clear();
        if let Some(active) = self.active {
            if self.get_conversation(active).is_none() {
                self.active = None;
            }
        }
    }

    /// Remove everything
    pub fn clear(&mut self) {
        self.conversations.clear();
        self.messages.clear();
        self.streaming.clear();
        self.active = None;
    }
}
