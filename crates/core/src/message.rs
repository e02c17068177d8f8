// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One parsed unit from a subprocess's stdout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recognised `type` tags from the subprocess wire format, plus the two
/// parser-internal tags (`Unknown`, `ParseError`) that let a malformed or
/// unrecognised line pass through without aborting the stream.
///
/// New Claude CLI versions may emit tags this enum does not yet name; those
/// surface as `Unknown` with the original tag preserved rather than failing
/// to parse (see `DESIGN.md`, Open Question 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Text,
    ToolUse,
    ToolResult,
    Error,
    System,
    Completion,
    /// A tag the parser does not recognise; the original tag string is kept.
    Unknown(String),
    /// The line failed to parse as JSON; payload carries the raw bytes.
    ParseError,
}

impl MessageType {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "text" => MessageType::Text,
            "tool_use" => MessageType::ToolUse,
            "tool_result" => MessageType::ToolResult,
            "error" => MessageType::Error,
            "system" => MessageType::System,
            "completion" => MessageType::Completion,
            other => MessageType::Unknown(other.to_string()),
        }
    }

    pub fn as_tag(&self) -> &str {
        match self {
            MessageType::Text => "text",
            MessageType::ToolUse => "tool_use",
            MessageType::ToolResult => "tool_result",
            MessageType::Error => "error",
            MessageType::System => "system",
            MessageType::Completion => "completion",
            MessageType::Unknown(tag) => tag.as_str(),
            MessageType::ParseError => "parse_error",
        }
    }
}

/// One parsed unit from stdout. Sequence numbers are assigned by the parser,
/// monotonic from 1, gap-free within a session (spec.md §3 invariant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_type: MessageType,
    pub payload: Value,
    pub sequence: u64,
    pub arrived_at_epoch_ms: u64,
}

impl Message {
    pub fn new(message_type: MessageType, payload: Value, sequence: u64, arrived_at_epoch_ms: u64) -> Self {
        Self {
            message_type,
            payload,
            sequence,
            arrived_at_epoch_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_tag_maps_known_tags() {
        assert_eq!(MessageType::from_tag("text"), MessageType::Text);
        assert_eq!(MessageType::from_tag("completion"), MessageType::Completion);
    }

    #[test]
    fn from_tag_falls_back_to_unknown() {
        let mt = MessageType::from_tag("thinking");
        assert_eq!(mt, MessageType::Unknown("thinking".to_string()));
        assert_eq!(mt.as_tag(), "thinking");
    }

    #[test]
    fn message_roundtrips_through_json() {
        let msg = Message::new(MessageType::Text, serde_json::json!({"content": "hi"}), 1, 0);
        let json = serde_json::to_string(&msg).expect("serialize");
        let back: Message = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, msg);
    }
}
