//! Event Stream Reader
//!
//! Decodes a chunked, line-delimited event-stream body into discrete events.
//!
//! Only lines starting with `data: ` are significant. The payload `[DONE]`
//! ends the sequence; everything after it is ignored. Chunk boundaries carry
//! no meaning: a line may be split across any number of chunks, and a chunk
//! may hold any number of lines, so bytes are buffered until a `\n` arrives.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{ready, Stream};

use crate::error::ChatError;

/// Literal prefix of a significant line
pub const DATA_PREFIX: &[u8] = b"data: ";

/// Payload that marks end-of-stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Default upper bound for a single unterminated line
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// A decoded protocol event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data: ` line with its payload
    Data(String),
    /// The `[DONE]` sentinel
    Done,
}

/// Counters describing what the reader saw
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// `data: ` lines emitted as events (excluding the sentinel)
    pub data_events: u64,
    /// Non-blank lines discarded because they lacked the `data: ` prefix
    pub ignored_lines: u64,
}

enum Line {
    Event(SseEvent),
    Blank,
    Ignored,
}

fn classify_line(line: &[u8]) -> Line {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.is_empty() {
        return Line::Blank;
    }
    match line.strip_prefix(DATA_PREFIX) {
        Some(payload) => {
            let payload = String::from_utf8_lossy(payload);
            if payload == DONE_SENTINEL {
                Line::Event(SseEvent::Done)
            } else {
                Line::Event(SseEvent::Data(payload.into_owned()))
            }
        }
        None => Line::Ignored,
    }
}

/// Incremental event-stream decoder
///
/// Feed it raw body chunks with [`push`](Self::push) and call
/// [`finish`](Self::finish) when the body is exhausted.
#[derive(Debug)]
pub struct EventStreamReader {
    buffer: Vec<u8>,
    done: bool,
    max_line_bytes: usize,
    stats: ReaderStats,
}

impl Default for EventStreamReader {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamReader {
    /// Create a reader with the default line limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Create a reader that fails once an unterminated line exceeds `max_line_bytes`
    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            done: false,
            max_line_bytes,
            stats: ReaderStats::default(),
        }
    }

    /// Whether the `[DONE]` sentinel (or end of input) has been seen
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    /// Consume a chunk and return the events completed by it
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Protocol`] when the carried-over fragment grows
    /// past the line limit without a terminator.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, ChatError> {
        if self.done {
            return Ok(Vec::new());
        }

        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = classify_line(&self.buffer[start..end]);
            start = end + 1;

            if self.record(line, &mut events) {
                break;
            }
        }

        if self.done {
            self.buffer.clear();
            return Ok(events);
        }

        self.buffer.drain(..start);
        if self.buffer.len() > self.max_line_bytes {
            self.done = true;
            self.buffer.clear();
            return Err(ChatError::Protocol(format!(
                "event line exceeds {} bytes",
                self.max_line_bytes
            )));
        }

        Ok(events)
    }

    /// Flush the final unterminated line at end of input
    ///
    /// After this the reader is done regardless of whether a sentinel was seen.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.done {
            let rest = std::mem::take(&mut self.buffer);
            self.record(classify_line(&rest), &mut events);
            self.done = true;
        }
        events
    }

    /// Account for one line; returns `true` when it was the sentinel
    fn record(&mut self, line: Line, events: &mut Vec<SseEvent>) -> bool {
        match line {
            Line::Event(SseEvent::Done) => {
                self.done = true;
                events.push(SseEvent::Done);
                true
            }
            Line::Event(event) => {
                self.stats.data_events += 1;
                events.push(event);
                false
            }
            Line::Ignored => {
                self.stats.ignored_lines += 1;
                false
            }
            Line::Blank => false,
        }
    }
}

/// Lazy event sequence over a body stream
///
/// Yields each event as soon as the chunk completing it arrives. The sequence
/// ends after `Done`, after end of input, or after the first error; it never
/// polls the body again once it has ended.
pub struct EventStream<S> {
    body: S,
    reader: EventStreamReader,
    pending: VecDeque<SseEvent>,
    finished: bool,
}

impl<S> EventStream<S> {
    /// Wrap a body stream
    pub fn new(body: S, reader: EventStreamReader) -> Self {
        Self {
            body,
            reader,
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Reader counters so far
    pub fn stats(&self) -> ReaderStats {
        self.reader.stats()
    }
}

impl<S, B, E> Stream for EventStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<ChatError>,
{
    type Item = Result<SseEvent, ChatError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.body).poll_next(cx)) {
                Some(Ok(chunk)) => match this.reader.push(chunk.as_ref()) {
                    Ok(events) => {
                        this.pending.extend(events);
                        this.finished = this.reader.is_done();
                    }
                    Err(err) => {
                        this.finished = true;
                        return Poll::Ready(Some(Err(err)));
                    }
                },
                Some(Err(err)) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(err.into())));
                }
                None => {
                    this.pending.extend(this.reader.finish());
                    this.finished = true;
                }
            }
        }
    }
}
