//! Chat Core - Headless Streaming Chat Client
//!
//! This crate holds everything a chat front end needs except the front end:
//! the event-stream transport to a chat-completions gateway, the per-send
//! session state machine, and the conversation store the UI renders from.
//! It can drive a terminal client, a desktop app, or run headless in tests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          UI Surfaces                             │
//! │      ┌─────────┐     ┌─────────────┐     ┌──────────────────┐    │
//! │      │   CLI   │     │   Desktop   │     │ Headless / Tests │    │
//! │      └────┬────┘     └──────┬──────┘     └────────┬─────────┘    │
//! │           └─────────────────┴─────────────────────┘              │
//! │                 send / stop / retry   ▲ SessionUpdate            │
//! └─────────────────────────┬─────────────┼──────────────────────────┘
//!                           ▼             │
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           CHAT CORE                              │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                        ChatClient                          │  │
//! │  │ ┌───────────────┐ ┌───────────────┐ ┌────────────────────┐ │  │
//! │  │ │ Conversation  │ │ StreamSession │ │  StorePersister    │ │  │
//! │  │ │    Store      │ │  (per send)   │ │ (fire-and-forget)  │ │  │
//! │  │ └───────────────┘ └───────┬───────┘ └────────────────────┘ │  │
//! │  └───────────────────────────┼────────────────────────────────┘  │
//! │                 StreamHandle │ (tokens + cancel)                 │
//! │  ┌───────────────────────────┴────────────────────────────────┐  │
//! │  │  GatewayBackend ── EventStreamReader ── ContentExtractor   │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use chat_core::{load_config, ChatClient, GatewayBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config()?;
//!     let backend = GatewayBackend::new(config.gateway.clone())?;
//!     let mut client = ChatClient::new(backend, config);
//!
//!     client.send("Hello!")?;
//!     while let Some(update) = client.next_update().await {
//!         // Re-render the affected conversation
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`streaming`]: `data: ` event-stream line reader and content extraction
//! - [`backend`]: Streaming transport trait and the HTTP gateway backend
//! - [`session`]: Per-send state machine
//! - [`conversation`]: Conversations, messages and the streaming-target map
//! - [`messages`]: Message records and identifiers
//! - [`persistence`]: Key/value persistence collaborator and snapshot writer
//! - [`client`]: The orchestrating `ChatClient`
//! - [`config`]: TOML + environment configuration
//! - [`error`]: Transport and client errors
//!
//! # No UI Dependencies
//!
//! This crate has **zero** dependencies on any terminal or GUI framework.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod messages;
pub mod persistence;
pub mod session;
pub mod streaming;

// Re-exports for convenience
pub use backend::{
    stream_channel, CancelHandle, ChatBackend, CompletionRequest, GatewayBackend, StreamHandle,
    StreamSummary, StreamingToken,
};
pub use client::{ChatClient, SendReceipt, SessionUpdate};
pub use conversation::{derive_title, Conversation, ConversationPatch, ConversationStore, StoreSnapshot};
pub use error::ChatError;
pub use messages::{ConversationId, Message, MessageId, MessagePatch, MessageRole};
pub use persistence::{MemoryStore, PersistenceStore, StorePersister};
pub use session::{SessionStatus, StreamSession};

// Streaming exports
pub use streaming::{ContentExtractor, EventStreamReader, SseEvent, TokenUsage};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ClientConfig, ConfigError,
    ConfigOverrides, ConfigSource,
};
