//! Server-Sent Events decoding shared by the HTTP transports
//!
//! [`SseDecoder`] reassembles events from arbitrarily fragmented byte
//! chunks. Bytes are buffered until a blank-line boundary is seen, and UTF-8
//! is decoded only on complete events, so a multi-byte character split
//! across two chunks survives intact.
//!
//! [`pump_events`] drives a response body through the decoder while
//! enforcing the per-chunk idle bound (`read_timeout_seconds`). A single idle
//! period is logged and tolerated; only [`MAX_IDLE_READS`] consecutive idle
//! periods end the stream.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use futures::{Stream, StreamExt};

/// Consecutive idle read periods after which a stream is considered dead.
pub const MAX_IDLE_READS: u32 = 3;

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// `event:` field; `None` means the default `message` type.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Event type with the SSE default applied.
    pub fn kind(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }

    /// Keepalive events carry no protocol message.
    pub fn is_ping(&self) -> bool {
        self.kind().eq_ignore_ascii_case("ping") || self.data.eq_ignore_ascii_case("[ping]")
    }
}

/// Incremental SSE decoder.
///
/// # Examples
///
/// ```
/// use conduit::mcp::transport::event_stream::SseDecoder;
///
/// let mut decoder = SseDecoder::default();
/// assert!(decoder.push(b"data: {\"a\"").is_empty());
/// let events = decoder.push(b":1}\n\n");
/// assert_eq!(events[0].data, "{\"a\":1}");
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    /// Feed one chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some((end, sep_len)) = find_boundary(&self.buffer) {
            let block = self.buffer.split_to(end);
            self.buffer.advance(sep_len);
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let block = self.buffer.split();
        parse_block(&block)
    }
}

/// Earliest event boundary: `(offset, separator length)`.
fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        match buf[i] {
            b'\n' if buf.get(i + 1) == Some(&b'\n') => return Some((i, 2)),
            b'\r' if buf[i..].starts_with(b"\r\n\r\n") => return Some((i, 4)),
            b'\r' if buf.get(i + 1) == Some(&b'\r') => return Some((i, 2)),
            _ => {}
        }
        i += 1;
    }
    None
}

fn parse_block(block: &[u8]) -> Option<SseEvent> {
    let text = match std::str::from_utf8(block) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(error = %e, "dropping SSE event with invalid UTF-8");
            return None;
        }
    };

    let mut event = SseEvent::default();
    let mut data_lines: Vec<&str> = Vec::new();
    let mut saw_field = false;

    for line in text.split(['\n', '\r']) {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        saw_field = true;
        match field {
            "data" => data_lines.push(value),
            "event" => event.event = Some(value.to_string()),
            "id" => event.id = Some(value.to_string()),
            "retry" => event.retry = value.trim().parse().ok(),
            _ => {}
        }
    }

    if !saw_field {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

/// Why [`pump_events`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEnd {
    /// The body ended normally.
    Finished,
    /// [`MAX_IDLE_READS`] consecutive idle periods elapsed.
    Idle,
    /// The body yielded a transport error.
    Failed(String),
    /// The event callback asked to stop.
    Stopped,
}

/// Drive a byte stream through an [`SseDecoder`], invoking `on_event` for
/// every complete non-ping event. Returning `false` from `on_event` stops
/// the pump.
pub async fn pump_events<S, E, F>(
    server: &str,
    stream: S,
    idle_timeout: Option<Duration>,
    mut on_event: F,
) -> PumpEnd
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
    F: FnMut(SseEvent) -> bool,
{
    tokio::pin!(stream);
    let mut decoder = SseDecoder::default();
    let mut idle_reads = 0u32;

    loop {
        let next = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    idle_reads += 1;
                    tracing::warn!(
                        server = %server,
                        idle = ?limit,
                        attempt = idle_reads,
                        max = MAX_IDLE_READS,
                        "no data on event stream within read timeout"
                    );
                    if idle_reads >= MAX_IDLE_READS {
                        return PumpEnd::Idle;
                    }
                    continue;
                }
            },
            None => stream.next().await,
        };

        match next {
            Some(Ok(chunk)) => {
                idle_reads = 0;
                for event in decoder.push(&chunk) {
                    if event.is_ping() {
                        continue;
                    }
                    if !on_event(event) {
                        return PumpEnd::Stopped;
                    }
                }
            }
            Some(Err(e)) => return PumpEnd::Failed(e.to_string()),
            None => {
                if let Some(event) = decoder.finish() {
                    if !event.is_ping() && !on_event(event) {
                        return PumpEnd::Stopped;
                    }
                }
                return PumpEnd::Finished;
            }
        }
    }
}
