//! Assistant transcript lines.
//!
//! One JSON object per line, discriminated by `type`. Conversation records
//! carry a `uuid`; summaries are keyed by the `leafUuid` they summarize.

use serde::Deserialize;
use serde_json::Value;

/// Bookkeeping record types the assistant writes that never reach the cloud.
pub const INTERNAL_RECORD_TYPES: &[&str] = &["file-history-snapshot", "change", "queue-operation"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    User,
    Assistant,
    System,
    Summary,
}

/// A validated transcript record. `raw` is the original line, untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub kind: EntryKind,
    pub id: String,
    pub raw: Value,
}

/// Outcome of parsing a single transcript line.
#[derive(Debug)]
pub enum LineParse {
    Entry(TranscriptEntry),
    /// A recognized bookkeeping record, dropped silently.
    Internal,
    /// Not JSON, or not one of the expected entry shapes.
    Invalid(String),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum EntryShape {
    User {
        uuid: String,
        #[allow(dead_code)]
        message: Value,
    },
    Assistant {
        uuid: String,
        #[allow(dead_code)]
        message: Value,
    },
    System {
        uuid: String,
    },
    Summary {
        #[serde(rename = "leafUuid")]
        leaf_uuid: String,
        #[allow(dead_code)]
        summary: String,
    },
}

impl TranscriptEntry {
    pub fn parse_line(line: &str) -> LineParse {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => return LineParse::Invalid(e.to_string()),
        };

        if let Some(kind) = value.get("type").and_then(Value::as_str) {
            if INTERNAL_RECORD_TYPES.contains(&kind) {
                return LineParse::Internal;
            }
        }

        let shape = match EntryShape::deserialize(&value) {
            Ok(shape) => shape,
            Err(e) => return LineParse::Invalid(e.to_string()),
        };

        let (kind, id) = match shape {
            EntryShape::User { uuid, .. } => (EntryKind::User, uuid),
            EntryShape::Assistant { uuid, .. } => (EntryKind::Assistant, uuid),
            EntryShape::System { uuid } => (EntryKind::System, uuid),
            EntryShape::Summary { leaf_uuid, .. } => (EntryKind::Summary, leaf_uuid),
        };

        LineParse::Entry(TranscriptEntry {
            kind,
            id,
            raw: value,
        })
    }

    pub fn is_assistant(&self) -> bool {
        self.kind == EntryKind::Assistant
    }
}
