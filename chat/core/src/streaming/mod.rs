//! Event-Stream Decoding
//!
//! Turns the raw response body of a streaming completion into content
//! fragments:
//!
//! ```text
//! bytes ──► EventStreamReader ──► SseEvent::Data(payload) ──► ContentExtractor ──► fragment
//!                              └─► SseEvent::Done
//! ```

pub mod event_reader;
pub mod extract;

pub use event_reader::{
    EventStream, EventStreamReader, ReaderStats, SseEvent, DATA_PREFIX, DEFAULT_MAX_LINE_BYTES,
    DONE_SENTINEL,
};
pub use extract::{extract_usage, ContentExtractor, ExtractionRule, TokenUsage, DEFAULT_RULES};
