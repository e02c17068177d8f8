// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream Parser (spec.md §4.2): turns a byte stream into a lazy sequence of
//! typed `Message` values.
//!
//! Grounded on `crates/adapters/src/agent/log_entry.rs`'s JSONL extraction
//! and `watcher.rs`'s `SessionLogParser`, adapted from re-reading a growing
//! file at a tracked byte offset to consuming a live `AsyncRead` (a
//! Supervisor's stdout pipe) line by line.

use relay_core::{Clock, Message, MessageType};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Running counters surfaced through `Pipeline::metrics` (spec.md §4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct ParserStats {
    pub messages_emitted: u64,
    pub oversize_lines: u64,
    pub trailing_garbage: u64,
    pub parse_errors: u64,
    pub unknown_tags: u64,
}

/// Drives one `AsyncBufRead` into a sequence of `Message`s. Not restartable:
/// once `next_message` returns `None`, the underlying reader is exhausted.
pub struct Parser<R, C> {
    reader: BufReader<R>,
    clock: C,
    max_line_bytes: usize,
    next_sequence: u64,
    stats: ParserStats,
}

impl<R, C> Parser<R, C>
where
    R: AsyncRead + Unpin,
    C: Clock,
{
    pub fn new(reader: R, clock: C, max_line_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            clock,
            max_line_bytes,
            next_sequence: 1,
            stats: ParserStats::default(),
        }
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Returns the next parsed `Message`, or `None` once the reader is
    /// exhausted. Oversize lines and undecodable trailing data at EOF are
    /// silently skipped (counted in `stats`, never surfaced as a `Message`);
    /// every other input — including malformed JSON and unrecognised `type`
    /// tags — produces one.
    pub async fn next_message(&mut self) -> Option<Message> {
        loop {
            let mut buf = Vec::new();
            let read = self.reader.read_until(b'\n', &mut buf).await.unwrap_or(0);
            if read == 0 {
                return None;
            }
            let had_newline = buf.last() == Some(&b'\n');
            let line = trim_newline(&buf);

            if line.len() > self.max_line_bytes {
                self.stats.oversize_lines += 1;
                if had_newline {
                    continue;
                }
                return None;
            }
            if line.is_empty() {
                if had_newline {
                    continue;
                }
                return None;
            }

            if !had_newline {
                // Partial trailing data at EOF: one last attempt, then done.
                return match self.try_parse(line) {
                    Some(message) => Some(message),
                    None => {
                        self.stats.trailing_garbage += 1;
                        None
                    }
                };
            }

            return Some(self.parse_line(line));
        }
    }

    fn parse_line(&mut self, line: &[u8]) -> Message {
        self.try_parse(line).unwrap_or_else(|| {
            self.stats.parse_errors += 1;
            self.emit(
                MessageType::ParseError,
                serde_json::json!({ "raw": String::from_utf8_lossy(line) }),
            )
        })
    }

    /// Attempts to decode `line` as a JSON object with a `type` tag. Returns
    /// `None` only when the bytes are not valid JSON at all — an unknown or
    /// missing tag still produces a `Message` (type `Unknown`).
    fn try_parse(&mut self, line: &[u8]) -> Option<Message> {
        let value: serde_json::Value = serde_json::from_slice(line).ok()?;
        let tag = value.get("type").and_then(|v| v.as_str()).unwrap_or("unknown");
        let message_type = MessageType::from_tag(tag);
        if matches!(message_type, MessageType::Unknown(_)) {
            self.stats.unknown_tags += 1;
        }
        Some(self.emit(message_type, value))
    }

    fn emit(&mut self, message_type: MessageType, payload: serde_json::Value) -> Message {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.stats.messages_emitted += 1;
        Message::new(message_type, payload, sequence, self.clock.epoch_ms())
    }
}

fn trim_newline(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    &buf[..end]
}
