//! Chat Backend Integration
//!
//! This module provides abstracted access to streaming completion backends
//! through a common trait interface.
//!
//! # Available Backends
//!
//! - **Gateway**: HTTP chat-completions gateway speaking the `data: ` event
//!   stream (default)
//!
//! # Usage
//!
//! ```ignore
//! use chat_core::backend::{ChatBackend, CompletionRequest, GatewayBackend};
//! use chat_core::config::GatewayConfig;
//! use chat_core::messages::MessageRole;
//!
//! let backend = GatewayBackend::new(GatewayConfig::default())?;
//! let request = CompletionRequest::new("gpt-4").with_message(MessageRole::User, "Hello!");
//! let (mut rx, cancel) = backend.open_stream(&request).into_parts();
//! ```

mod gateway;
mod traits;

pub use gateway::GatewayBackend;
pub use traits::{
    stream_channel, CancelHandle, CancelSignal, ChatBackend, CompletionRequest, RequestMessage,
    StreamEmitter, StreamHandle, StreamSummary, StreamingToken, TokenProvider,
};
