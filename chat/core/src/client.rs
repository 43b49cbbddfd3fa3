//! Chat Client - Orchestration Layer
//!
//! The `ChatClient` is the single owner of the conversation store and of every
//! in-flight stream session. UI surfaces call its methods and read its state;
//! the backend's spawned transport tasks only ever talk to it through the
//! stream channels it holds.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  send / stop / retry   ┌───────────────────────────────┐
//!  │  UI surface  │ ─────────────────────► │          ChatClient           │
//!  │ (CLI, GUI…)  │ ◄───────────────────── │  ConversationStore            │
//!  └──────────────┘   SessionUpdate, reads │  sessions: conv -> session    │
//!                                          │  streams:  conv -> receiver   │
//!                                          └──────────────┬────────────────┘
//!                                            open_stream  │  ▲ StreamingToken
//!                                                         ▼  │
//!                                          ┌───────────────────────────────┐
//!                                          │ ChatBackend (spawned task)    │
//!                                          └───────────────────────────────┘
//! ```
//!
//! Every mutation runs to completion inside a `&mut self` call, so the store
//! needs no locking. Tokens are applied in arrival order, and a stream's
//! receiver is dropped the moment its session reaches a terminal state, so
//! nothing queued behind a stop, failure or completion is ever applied.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::backend::{
    ChatBackend, CompletionRequest, RequestMessage, StreamSummary, StreamingToken,
};
use crate::config::ClientConfig;
use crate::conversation::{derive_title, Conversation, ConversationPatch, ConversationStore};
use crate::error::ChatError;
use crate::messages::{ConversationId, Message, MessageId, MessagePatch, MessageRole};
use crate::persistence::{PersistenceStore, StorePersister};
use crate::session::{SessionStatus, StreamSession};

/// Ids created by a successful send
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReceipt {
    /// Conversation the messages were added to
    pub conversation_id: ConversationId,
    /// The stored user message
    pub user_message_id: MessageId,
    /// The assistant placeholder receiving deltas
    pub assistant_message_id: MessageId,
}

/// A change applied to the store from a stream
#[derive(Clone, Debug, PartialEq)]
pub enum SessionUpdate {
    /// A fragment was appended to the assistant message
    Delta {
        /// Conversation being written
        conversation_id: ConversationId,
        /// Assistant message being written
        message_id: MessageId,
        /// The appended fragment
        fragment: String,
    },
    /// The response finished normally
    Completed {
        /// Conversation that was written
        conversation_id: ConversationId,
        /// The finished assistant message
        message_id: MessageId,
        /// What the stream looked like on the wire
        summary: StreamSummary,
    },
    /// The response failed and the fallback text was written
    Failed {
        /// Conversation that was written
        conversation_id: ConversationId,
        /// The failed assistant message
        message_id: MessageId,
        /// Why it failed
        error: ChatError,
    },
}

impl SessionUpdate {
    /// Conversation this update belongs to
    #[must_use]
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::Delta {
                conversation_id, ..
            }
            | Self::Completed {
                conversation_id, ..
            }
            | Self::Failed {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

/// The chat client
pub struct ChatClient<B: ChatBackend> {
    /// Configuration
    config: ClientConfig,
    /// Completion backend
    backend: Arc<B>,
    /// Conversations and messages
    store: ConversationStore,
    /// Latest session per conversation (terminal ones stay until the next send)
    sessions: HashMap<ConversationId, StreamSession>,
    /// Receivers of streams whose session is still active
    streams: HashMap<ConversationId, mpsc::Receiver<StreamingToken>>,
    /// Most recent transport failure
    last_error: Option<ChatError>,
    /// Snapshot writer, when persistence is enabled
    persister: Option<StorePersister>,
}

impl<B: ChatBackend> std::fmt::Debug for ChatClient<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("backend", &self.backend.name())
            .field("conversations", &self.store.conversations().len())
            .field("active_streams", &self.streams.len())
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl<B: ChatBackend> ChatClient<B> {
    /// Create a new client with the given backend
    pub fn new(backend: B, config: ClientConfig) -> Self {
        Self {
            config,
            backend: Arc::new(backend),
            store: ConversationStore::new(),
            sessions: HashMap::new(),
            streams: HashMap::new(),
            last_error: None,
            persister: None,
        }
    }

    /// Mirror the store into a persistence collaborator
    #[must_use]
    pub fn with_persistence(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.persister = Some(StorePersister::new(store, &self.config.persistence));
        self
    }

    /// Replace the store with the last persisted snapshot
    ///
    /// Any live stream is stopped first. Returns `false` when persistence is
    /// disabled or nothing was persisted.
    pub async fn rehydrate(&mut self) -> bool {
        let Some(persister) = self.persister.clone() else {
            return false;
        };
        let Some(snapshot) = persister.rehydrate().await else {
            return false;
        };
        self.cancel_all();
        self.sessions.clear();
        self.store.restore(snapshot);
        // The active pointer is not persisted
        self.store.set_active_conversation(None);
        true
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The backend
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Read access to conversations and messages
    #[must_use]
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send a user message to the active conversation
    ///
    /// With no active conversation, one is created and titled from the text
    /// (unless `create_on_send` is off).
    ///
    /// # Errors
    ///
    /// `EmptyMessage` for blank text, `NoActiveConversation` when nothing can
    /// be targeted, `StreamAlreadyActive` while the conversation is streaming.
    pub fn send(&mut self, text: &str) -> Result<SendReceipt, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let conversation_id = match self.store.active_conversation_id() {
            Some(id) => id,
            None if self.config.chat.create_on_send => {
                let title = derive_title(text, self.config.chat.title_max_chars);
                self.open_conversation(title)
            }
            None => return Err(ChatError::NoActiveConversation),
        };

        self.start_session(conversation_id, text)
    }

    /// Send a user message to a specific conversation
    ///
    /// # Errors
    ///
    /// `EmptyMessage`, `ConversationNotFound`, or `StreamAlreadyActive`.
    pub fn send_to(
        &mut self,
        conversation_id: ConversationId,
        text: &str,
    ) -> Result<SendReceipt, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if self.store.get_conversation(conversation_id).is_none() {
            return Err(ChatError::ConversationNotFound(conversation_id));
        }
        self.start_session(conversation_id, text)
    }

    /// Clear the stored error and send `text` as a fresh session
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn retry(&mut self, text: &str) -> Result<SendReceipt, ChatError> {
        self.last_error = None;
        self.send(text)
    }

    /// Resend the last user message of the active conversation
    ///
    /// # Errors
    ///
    /// `NoActiveConversation` when there is no active conversation or it has
    /// no user message; otherwise as [`send_to`](Self::send_to).
    pub fn retry_last(&mut self) -> Result<SendReceipt, ChatError> {
        let conversation_id = self
            .store
            .active_conversation_id()
            .ok_or(ChatError::NoActiveConversation)?;
        let text = self
            .store
            .last_user_message(conversation_id)
            .map(|m| m.content.clone())
            .ok_or(ChatError::NoActiveConversation)?;
        self.last_error = None;
        self.send_to(conversation_id, &text)
    }

    fn start_session(
        &mut self,
        conversation_id: ConversationId,
        text: &str,
    ) -> Result<SendReceipt, ChatError> {
        if self
            .sessions
            .get(&conversation_id)
            .is_some_and(StreamSession::is_active)
        {
            tracing::warn!(
                conversation_id = %conversation_id,
                "Rejected send while a response is streaming"
            );
            return Err(ChatError::StreamAlreadyActive(conversation_id));
        }

        let request = self.build_request(conversation_id, text);

        let user = Message::user(conversation_id, text);
        let assistant = Message::assistant_placeholder(conversation_id);
        let user_message_id = user.id.clone();
        let assistant_message_id = assistant.id.clone();

        if !self.store.add_message(conversation_id, user) {
            return Err(ChatError::ConversationNotFound(conversation_id));
        }
        self.store.add_message(conversation_id, assistant);
        self.store
            .begin_streaming(conversation_id, assistant_message_id.clone());

        let mut session = StreamSession::new(
            conversation_id,
            user_message_id.clone(),
            assistant_message_id.clone(),
        );
        let (receiver, cancel) = self.backend.open_stream(&request).into_parts();
        session.attach(cancel);

        self.sessions.insert(conversation_id, session);
        self.streams.insert(conversation_id, receiver);
        self.last_error = None;

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %assistant_message_id,
            backend = self.backend.name(),
            context_messages = request.messages.len(),
            "Stream opened"
        );
        self.persist();

        Ok(SendReceipt {
            conversation_id,
            user_message_id,
            assistant_message_id,
        })
    }

    /// Build the request for a new user message
    ///
    /// The history excludes failed responses and empty placeholders, keeps the
    /// last `context_messages` entries, and is preceded by the system prompt.
    fn build_request(&self, conversation_id: ConversationId, text: &str) -> CompletionRequest {
        let chat = &self.config.chat;
        let mut request = CompletionRequest::new(chat.model.clone());
        request.temperature = chat.temperature;
        request.max_tokens = chat.max_tokens;
        request.top_p = chat.top_p;

        if let Some(ref system) = chat.system_prompt {
            request = request.with_message(MessageRole::System, system.clone());
        }

        // A user turn whose reply failed is dropped along with the reply
        let messages = self.store.list_messages(conversation_id);
        let history: Vec<&Message> = messages
            .iter()
            .enumerate()
            .filter(|&(i, m)| {
                let failed_turn = m.role == MessageRole::User
                    && messages.get(i + 1).is_some_and(Message::is_error);
                !failed_turn && !m.is_error() && !m.content.is_empty()
            })
            .map(|(_, m)| m)
            .collect();
        let skip = history.len().saturating_sub(chat.context_messages);
        request.messages.extend(
            history[skip..]
                .iter()
                .map(|m| RequestMessage::new(m.role, m.content.clone())),
        );

        request.with_message(MessageRole::User, text)
    }

    // ========================================================================
    // Stopping
    // ========================================================================

    /// Stop every active stream
    ///
    /// Partial content stays in place without an error decoration. Returns
    /// whether anything was stopped.
    pub fn stop(&mut self) -> bool {
        let active: Vec<ConversationId> = self.streams.keys().copied().collect();
        let mut stopped = false;
        for conversation_id in active {
            stopped |= self.stop_conversation(conversation_id);
        }
        stopped
    }

    /// Stop one conversation's stream; a no-op when it is not streaming
    pub fn stop_conversation(&mut self, conversation_id: ConversationId) -> bool {
        let Some(session) = self.sessions.get_mut(&conversation_id) else {
            return false;
        };
        if !session.cancel() {
            return false;
        }
        let partial_len = session.accumulated_content().len();

        self.streams.remove(&conversation_id);
        self.store.end_streaming(conversation_id);

        tracing::info!(
            conversation_id = %conversation_id,
            partial_len,
            "Stream cancelled"
        );
        self.persist();
        true
    }

    fn cancel_all(&mut self) {
        for session in self.sessions.values_mut() {
            session.cancel();
        }
        for conversation_id in self.streams.keys() {
            self.store.end_streaming(*conversation_id);
        }
        self.streams.clear();
    }

    // ========================================================================
    // Stream processing
    // ========================================================================

    /// Apply every token already waiting, without blocking
    ///
    /// Call this regularly from a UI loop. Returns the updates in the order
    /// they were applied.
    pub fn poll_streaming(&mut self) -> Vec<SessionUpdate> {
        let active: Vec<ConversationId> = self.streams.keys().copied().collect();
        let mut updates = Vec::new();

        for conversation_id in active {
            loop {
                let Some(rx) = self.streams.get_mut(&conversation_id) else {
                    break;
                };
                match rx.try_recv() {
                    Ok(token) => {
                        if let Some(update) = self.apply_token(conversation_id, token) {
                            updates.push(update);
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if let Some(update) = self.stream_closed(conversation_id) {
                            updates.push(update);
                        }
                        break;
                    }
                }
            }
        }

        updates
    }

    /// Wait for the next update from any active stream
    ///
    /// Returns `None` once no stream is active. Cancel-safe: dropping the
    /// future loses no tokens.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            if self.streams.is_empty() {
                return None;
            }

            let (conversation_id, token) = {
                let waits = self.streams.iter_mut().map(|(id, rx)| {
                    let id = *id;
                    Box::pin(async move { (id, rx.recv().await) })
                });
                let ((conversation_id, token), _, _) = futures::future::select_all(waits).await;
                (conversation_id, token)
            };

            let update = match token {
                Some(token) => self.apply_token(conversation_id, token),
                None => self.stream_closed(conversation_id),
            };
            if update.is_some() {
                return update;
            }
        }
    }

    /// Apply updates until no stream is active
    pub async fn run_until_idle(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = self.next_update().await {
            updates.push(update);
        }
        updates
    }

    fn apply_token(
        &mut self,
        conversation_id: ConversationId,
        token: StreamingToken,
    ) -> Option<SessionUpdate> {
        let Some(session) = self
            .sessions
            .get_mut(&conversation_id)
            .filter(|s| s.is_active())
        else {
            self.streams.remove(&conversation_id);
            return None;
        };
        let message_id = session.assistant_message_id().clone();

        match token {
            StreamingToken::Token(fragment) => {
                let content = session.apply_delta(&fragment)?.to_string();
                self.store
                    .update_message(conversation_id, &message_id, MessagePatch::content(content));
                Some(SessionUpdate::Delta {
                    conversation_id,
                    message_id,
                    fragment,
                })
            }
            StreamingToken::Complete(summary) => {
                if !session.complete(summary) {
                    return None;
                }
                let content_len = session.accumulated_content().len();
                self.streams.remove(&conversation_id);
                self.store.end_streaming(conversation_id);

                tracing::info!(
                    conversation_id = %conversation_id,
                    message_id = %message_id,
                    content_len,
                    fragments = summary.fragments,
                    "Stream completed"
                );
                self.persist();
                Some(SessionUpdate::Completed {
                    conversation_id,
                    message_id,
                    summary,
                })
            }
            StreamingToken::Error(error) => self.fail_session(conversation_id, error),
        }
    }

    fn stream_closed(&mut self, conversation_id: ConversationId) -> Option<SessionUpdate> {
        self.fail_session(
            conversation_id,
            ChatError::Protocol("stream closed without a terminal event".to_string()),
        )
    }

    fn fail_session(
        &mut self,
        conversation_id: ConversationId,
        error: ChatError,
    ) -> Option<SessionUpdate> {
        self.streams.remove(&conversation_id);
        let session = self.sessions.get_mut(&conversation_id)?;
        let message_id = session.assistant_message_id().clone();
        if !session.fail(error.clone()) {
            return None;
        }

        // The content patch must land while the placeholder is still the target
        self.store.update_message(
            conversation_id,
            &message_id,
            MessagePatch::content(self.config.chat.fallback_message.clone())
                .with_error(error.to_string()),
        );
        self.store.end_streaming(conversation_id);
        self.last_error = Some(error.clone());

        tracing::warn!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            code = error.code(),
            "Stream failed: {}",
            error
        );
        self.persist();
        Some(SessionUpdate::Failed {
            conversation_id,
            message_id,
            error,
        })
    }

    // ========================================================================
    // Session state
    // ========================================================================

    /// Status of the active conversation's latest session
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.store
            .active_conversation_id()
            .map_or(SessionStatus::Idle, |id| self.status_of(id))
    }

    /// Status of a conversation's latest session
    #[must_use]
    pub fn status_of(&self, conversation_id: ConversationId) -> SessionStatus {
        self.sessions
            .get(&conversation_id)
            .map_or(SessionStatus::Idle, StreamSession::status)
    }

    /// A conversation's latest session
    #[must_use]
    pub fn session(&self, conversation_id: ConversationId) -> Option<&StreamSession> {
        self.sessions.get(&conversation_id)
    }

    /// The message receiving deltas in the active conversation
    #[must_use]
    pub fn streaming_message_id(&self) -> Option<&MessageId> {
        let id = self.store.active_conversation_id()?;
        self.store.streaming_message_id(id)
    }

    /// Whether the active conversation is sending or streaming
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.status().is_active()
    }

    /// Whether any conversation has a live stream
    #[must_use]
    pub fn has_active_streams(&self) -> bool {
        !self.streams.is_empty()
    }

    /// Most recent transport failure
    #[must_use]
    pub fn last_error(&self) -> Option<&ChatError> {
        self.last_error.as_ref()
    }

    /// Dismiss the stored error
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// Create a conversation and make it active
    pub fn create_conversation(&mut self, title: impl Into<String>) -> ConversationId {
        let id = self.open_conversation(title.into());
        self.persist();
        id
    }

    fn open_conversation(&mut self, title: String) -> ConversationId {
        let conversation = Conversation::new(title);
        let id = conversation.id;
        self.store.add_conversation(conversation);
        self.store.set_active_conversation(Some(id));
        tracing::debug!(conversation_id = %id, "Created conversation");
        id
    }

    /// Make a conversation active
    ///
    /// # Errors
    ///
    /// `ConversationNotFound` for an unknown id.
    pub fn select_conversation(&mut self, conversation_id: ConversationId) -> Result<(), ChatError> {
        if !self.store.set_active_conversation(Some(conversation_id)) {
            return Err(ChatError::ConversationNotFound(conversation_id));
        }
        self.persist();
        Ok(())
    }

    /// Rename a conversation
    ///
    /// # Errors
    ///
    /// `ConversationNotFound` for an unknown id.
    pub fn rename_conversation(
        &mut self,
        conversation_id: ConversationId,
        title: impl Into<String>,
    ) -> Result<(), ChatError> {
        if !self
            .store
            .update_conversation(conversation_id, ConversationPatch::title(title))
        {
            return Err(ChatError::ConversationNotFound(conversation_id));
        }
        self.persist();
        Ok(())
    }

    /// Delete a conversation, stopping its stream first
    ///
    /// # Errors
    ///
    /// `ConversationNotFound` for an unknown id.
    pub fn delete_conversation(
        &mut self,
        conversation_id: ConversationId,
    ) -> Result<Conversation, ChatError> {
        self.stop_conversation(conversation_id);
        let removed = self
            .store
            .delete_conversation(conversation_id)
            .ok_or(ChatError::ConversationNotFound(conversation_id))?;
        self.sessions.remove(&conversation_id);
        self.persist();
        Ok(removed)
    }

    /// Delete a message; the message receiving deltas cannot be deleted
    pub fn delete_message(
        &mut self,
        conversation_id: ConversationId,
        message_id: &MessageId,
    ) -> Option<Message> {
        let removed = self.store.delete_message(conversation_id, message_id)?;
        self.persist();
        Some(removed)
    }

    /// Stop every stream, empty the store, and drop persisted state
    pub fn clear_all(&mut self) {
        self.cancel_all();
        self.sessions.clear();
        self.store.clear();
        self.last_error = None;
        if let Some(ref persister) = self.persister {
            persister.clear_storage();
        }
        tracing::info!("Cleared all conversations");
    }

    fn persist(&self) {
        if let Some(ref persister) = self.persister {
            persister.save(&self.store.snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{stream_channel, StreamEmitter, StreamHandle};
    use crate::persistence::MemoryStore;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio_test::{assert_err, assert_ok};

    /// Backend whose streams are driven by the test
    #[derive(Default)]
    struct ScriptedBackend {
        requests: Mutex<Vec<CompletionRequest>>,
        emitters: Mutex<Vec<StreamEmitter>>,
    }

    impl ScriptedBackend {
        fn emit(&self, index: usize, token: StreamingToken) -> bool {
            self.emitters.lock()[index].try_emit(token)
        }

        fn close(&self, index: usize) {
            let (dead, _) = stream_channel(1);
            self.emitters.lock()[index] = dead;
        }

        fn request(&self, index: usize) -> CompletionRequest {
            self.requests.lock()[index].clone()
        }
    }

    #[async_trait::async_trait]
    impl ChatBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "Scripted"
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn open_stream(&self, request: &CompletionRequest) -> StreamHandle {
            let (emitter, handle) = stream_channel(32);
            self.requests.lock().push(request.clone());
            self.emitters.lock().push(emitter);
            handle
        }
    }

    fn client() -> ChatClient<ScriptedBackend> {
        ChatClient::new(ScriptedBackend::default(), ClientConfig::default())
    }

    fn token(text: &str) -> StreamingToken {
        StreamingToken::Token(text.to_string())
    }

    fn complete() -> StreamingToken {
        StreamingToken::Complete(StreamSummary::default())
    }

    fn content(client: &ChatClient<ScriptedBackend>, receipt: &SendReceipt) -> String {
        client
            .store()
            .get_message(receipt.conversation_id, &receipt.assistant_message_id)
            .map(|m| m.content.clone())
            .unwrap()
    }

    #[test]
    fn test_send_creates_conversation_and_placeholder() {
        let mut client = client();
        let receipt = client
            .send("  What is the airspeed velocity of an unladen swallow?  ")
            .unwrap();

        let conversation = client.store().active_conversation().unwrap();
        assert_eq!(conversation.id, receipt.conversation_id);
        assert_eq!(conversation.title, "What is the airspeed velocity ...");

        let messages = client.store().list_messages(receipt.conversation_id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(
            messages[0].content,
            "What is the airspeed velocity of an unladen swallow?"
        );
        assert_eq!(messages[1].id, receipt.assistant_message_id);
        assert!(messages[1].content.is_empty());

        assert_eq!(client.status(), SessionStatus::Streaming);
        assert!(client.is_streaming());
        assert_eq!(
            client.streaming_message_id(),
            Some(&receipt.assistant_message_id)
        );
    }

    #[test]
    fn test_deltas_then_completion() {
        let mut client = client();
        let receipt = client.send("Hi").unwrap();

        client.backend().emit(0, token("Hel"));
        client.backend().emit(0, token("lo"));
        let updates = client.poll_streaming();
        assert_eq!(updates.len(), 2);
        assert_eq!(content(&client, &receipt), "Hello");
        assert_eq!(
            client
                .session(receipt.conversation_id)
                .map(StreamSession::accumulated_content),
            Some("Hello")
        );

        client.backend().emit(0, complete());
        let updates = client.poll_streaming();
        assert!(matches!(updates[..], [SessionUpdate::Completed { .. }]));
        assert_eq!(client.status(), SessionStatus::Completed);
        assert!(client.streaming_message_id().is_none());
        assert!(!client.has_active_streams());

        // Content is frozen once the stream ends
        assert!(!client.backend().emit(0, token("late")));
        assert!(client.poll_streaming().is_empty());
        assert_eq!(content(&client, &receipt), "Hello");
    }

    #[test]
    fn test_send_while_streaming_is_rejected() {
        let mut client = client();
        let receipt = client.send("first").unwrap();

        let err = assert_err!(client.send("second"));
        assert_eq!(err, ChatError::StreamAlreadyActive(receipt.conversation_id));
        assert_eq!(
            client.store().list_messages(receipt.conversation_id).len(),
            2
        );
        assert_eq!(client.backend().requests.lock().len(), 1);
    }

    #[test]
    fn test_stop_before_data() {
        let mut client = client();
        let receipt = client.send("Hi").unwrap();

        assert!(client.stop());
        assert_eq!(client.status(), SessionStatus::Cancelled);
        assert!(client.backend().emitters.lock()[0].is_cancelled());

        let message = client
            .store()
            .get_message(receipt.conversation_id, &receipt.assistant_message_id)
            .unwrap();
        assert!(message.content.is_empty());
        assert!(!message.is_error());
        assert!(client.last_error().is_none());

        // Idempotent
        assert!(!client.stop());
        assert!(!client.stop_conversation(receipt.conversation_id));
    }

    #[test]
    fn test_stop_keeps_partial_content_and_drops_queued_tokens() {
        let mut client = client();
        let receipt = client.send("Hi").unwrap();

        client.backend().emit(0, token("par"));
        client.poll_streaming();
        client.backend().emit(0, token("tial"));

        client.stop();
        assert!(client.poll_streaming().is_empty());
        assert_eq!(content(&client, &receipt), "par");

        // A new send is allowed once stopped
        assert!(client.send("again").is_ok());
    }

    #[test]
    fn test_failure_writes_fallback_and_retry_recovers() {
        let mut client = client();
        let receipt = client.send("Hi").unwrap();

        client.backend().emit(0, token("par"));
        client.backend().emit(
            0,
            StreamingToken::Error(ChatError::from_response_body(500, b"")),
        );
        let updates = client.poll_streaming();
        assert!(matches!(updates.last(), Some(SessionUpdate::Failed { .. })));

        let message = client
            .store()
            .get_message(receipt.conversation_id, &receipt.assistant_message_id)
            .unwrap();
        assert_eq!(message.content, "Sorry, an error occurred. Please try again.");
        assert_eq!(message.error.as_deref(), Some("HTTP error 500"));
        assert_eq!(client.status(), SessionStatus::Failed);
        assert_eq!(client.last_error().and_then(ChatError::status), Some(500));

        let retry = client.retry("Hi").unwrap();
        assert!(client.last_error().is_none());
        assert_eq!(client.status(), SessionStatus::Streaming);
        let user = client
            .store()
            .get_message(retry.conversation_id, &retry.user_message_id)
            .unwrap();
        assert_eq!(user.content, "Hi");

        // The failed exchange is left out of the retried request's history
        let request = client.backend().request(1);
        let contents: Vec<&str> = request.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Hi"]);
    }

    #[test]
    fn test_retry_last_resends_last_user_message() {
        let mut client = client();
        client.send("original question").unwrap();
        client.backend().emit(0, StreamingToken::Error(ChatError::network("down")));
        client.poll_streaming();

        let receipt = client.retry_last().unwrap();
        let user = client
            .store()
            .get_message(receipt.conversation_id, &receipt.user_message_id)
            .unwrap();
        assert_eq!(user.content, "original question");
    }

    #[test]
    fn test_closed_stream_without_terminal_fails() {
        let mut client = client();
        let receipt = client.send("Hi").unwrap();
        client.backend().close(0);

        let updates = client.poll_streaming();
        match &updates[..] {
            [SessionUpdate::Failed { error, .. }] => {
                assert!(matches!(error, ChatError::Protocol(_)));
            }
            other => panic!("expected a failure, got {other:?}"),
        }
        assert_eq!(client.status_of(receipt.conversation_id), SessionStatus::Failed);
    }

    #[test]
    fn test_input_guards() {
        let mut client = client();
        assert_eq!(client.send("   ").unwrap_err(), ChatError::EmptyMessage);
        assert!(client.store().conversations().is_empty());

        let unknown = ConversationId::new();
        assert_eq!(
            client.send_to(unknown, "hi").unwrap_err(),
            ChatError::ConversationNotFound(unknown)
        );
        assert_eq!(
            client.retry_last().unwrap_err(),
            ChatError::NoActiveConversation
        );

        let mut config = ClientConfig::default();
        config.chat.create_on_send = false;
        let mut client = ChatClient::new(ScriptedBackend::default(), config);
        assert_eq!(
            client.send("hi").unwrap_err(),
            ChatError::NoActiveConversation
        );
    }

    #[test]
    fn test_request_includes_system_prompt_and_bounded_history() {
        let mut config = ClientConfig::default();
        config.chat.system_prompt = Some("Be brief.".to_string());
        config.chat.context_messages = 2;
        config.chat.temperature = Some(0.3);
        let mut client = ChatClient::new(ScriptedBackend::default(), config);

        client.send("one").unwrap();
        client.backend().emit(0, token("reply one"));
        client.backend().emit(0, complete());
        client.poll_streaming();

        client.send("two").unwrap();
        let request = client.backend().request(1);
        assert_eq!(request.model, "gpt-4");
        assert_eq!(request.temperature, Some(0.3));
        assert!(request.stream);

        let wire: Vec<(MessageRole, &str)> = request
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            wire,
            vec![
                (MessageRole::System, "Be brief."),
                (MessageRole::User, "one"),
                (MessageRole::Assistant, "reply one"),
                (MessageRole::User, "two"),
            ]
        );
    }

    #[test]
    fn test_switching_conversation_does_not_redirect_deltas() {
        let mut client = client();
        let receipt = client.send("first").unwrap();
        let other = client.create_conversation("Other");
        assert_eq!(client.status(), SessionStatus::Idle);

        client.backend().emit(0, token("still here"));
        client.poll_streaming();

        assert_eq!(content(&client, &receipt), "still here");
        assert!(client.store().list_messages(other).is_empty());

        // Both conversations may stream at once
        assert!(client.send("second").is_ok());
        assert_eq!(client.streams.len(), 2);
    }

    #[test]
    fn test_delete_streaming_conversation_cancels_first() {
        let mut client = client();
        let receipt = client.send("Hi").unwrap();

        let removed = client.delete_conversation(receipt.conversation_id).unwrap();
        assert_eq!(removed.id, receipt.conversation_id);
        assert!(client.backend().emitters.lock()[0].is_cancelled());
        assert!(client.store().active_conversation_id().is_none());
        assert!(client.session(receipt.conversation_id).is_none());
        assert!(!client.has_active_streams());

        assert_err!(client.delete_conversation(receipt.conversation_id));
    }

    #[test]
    fn test_conversation_management() {
        let mut client = client();
        let first = client.create_conversation("First");
        let second = client.create_conversation("Second");
        assert_eq!(client.store().active_conversation_id(), Some(second));

        assert_ok!(client.select_conversation(first));
        assert_eq!(client.store().active_conversation_id(), Some(first));
        assert_err!(client.select_conversation(ConversationId::new()));

        assert_ok!(client.rename_conversation(first, "Renamed"));
        assert_eq!(
            client.store().get_conversation(first).map(|c| c.title.as_str()),
            Some("Renamed")
        );

        let receipt = assert_ok!(client.send("hello"));
        assert_eq!(receipt.conversation_id, first);
        assert!(client
            .delete_message(first, &receipt.assistant_message_id)
            .is_none());
        assert!(client
            .delete_message(first, &receipt.user_message_id)
            .is_some());

        client.clear_all();
        assert!(client.store().conversations().is_empty());
        assert!(!client.has_active_streams());
        assert_eq!(client.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_next_update_and_run_until_idle() {
        let mut client = client();
        let receipt = client.send("Hi").unwrap();

        client.backend().emit(0, token("a"));
        assert_eq!(
            client.next_update().await,
            Some(SessionUpdate::Delta {
                conversation_id: receipt.conversation_id,
                message_id: receipt.assistant_message_id.clone(),
                fragment: "a".to_string(),
            })
        );

        client.backend().emit(0, token("b"));
        client.backend().emit(0, complete());
        let updates = client.run_until_idle().await;
        assert_eq!(updates.len(), 2);
        assert_eq!(content(&client, &receipt), "ab");
        assert_eq!(client.next_update().await, None);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let backing = Arc::new(MemoryStore::new());
        let mut client = client().with_persistence(backing.clone());
        let receipt = client.send("remember me").unwrap();
        client.backend().emit(0, token("ok"));
        client.backend().emit(0, complete());
        client.run_until_idle().await;

        let mut restored = ChatClient::new(ScriptedBackend::default(), ClientConfig::default())
            .with_persistence(backing);
        for _ in 0..100 {
            if restored.rehydrate().await
                && restored.store().list_messages(receipt.conversation_id).len() == 2
                && restored
                    .store()
                    .get_message(receipt.conversation_id, &receipt.assistant_message_id)
                    .is_some_and(|m| m.content == "ok")
            {
                break;
            }
            tokio::task::yield_now().await;
        }

        let messages = restored.store().list_messages(receipt.conversation_id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "ok");
        assert_eq!(restored.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_rehydrate_clears_active_conversation() {
        let backing = Arc::new(MemoryStore::new());
        let mut client = client().with_persistence(backing);
        let receipt = client.send("remember me").unwrap();
        client.backend().emit(0, complete());
        client.run_until_idle().await;
        assert_eq!(
            client.store().active_conversation_id(),
            Some(receipt.conversation_id)
        );

        let mut rehydrated = false;
        for _ in 0..100 {
            if client.rehydrate().await {
                rehydrated = true;
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(rehydrated);
        assert!(client.store().get_conversation(receipt.conversation_id).is_some());
        assert!(client.store().active_conversation_id().is_none());
    }

    #[tokio::test]
    async fn test_conversation_created_after_clear_all_is_persisted() {
        let backing = Arc::new(MemoryStore::new());
        let mut client = client().with_persistence(backing.clone());
        client.create_conversation("before");
        tokio::task::yield_now().await;

        client.clear_all();
        let after = client.create_conversation("after");
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let persisted = backing
            .get("chat-store:conversations")
            .await
            .expect("conversations persisted");
        let conversations: Vec<Conversation> = serde_json::from_value(persisted).unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].id, after);
        assert_eq!(conversations[0].title, "after");
    }
}
