use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::value::RawValue;

/// Maximum supported ndjson line length, shared by every stream the proxy
/// reads. Longer lines are a fatal decode error for that stream.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// MessageKind classifies a JSON-RPC 2.0 message for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// method and id present
    Request,
    /// method present, id absent
    Notification,
    /// id present, method absent
    Response,
    Invalid,
}

/// The routing view of a JSON-RPC 2.0 line. Only `jsonrpc`, `id` and `method`
/// are interpreted; params/result/error stay raw.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub jsonrpc: String,
    /// The id exactly as it appeared on the wire. A JSON `null` id is an id
    /// that is present, so plain `Option<Box<RawValue>>` would be wrong here
    /// (serde folds `null` into `None`).
    #[serde(default, deserialize_with = "raw_if_present")]
    pub id: Option<Box<RawValue>>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Box<RawValue>>,
    #[serde(default)]
    pub result: Option<Box<RawValue>>,
    #[serde(default)]
    pub error: Option<Box<RawValue>>,
}

fn raw_if_present<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

impl Envelope {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).context("parse envelope")
    }

    pub fn kind(&self) -> MessageKind {
        if self.jsonrpc != "2.0" {
            return MessageKind::Invalid;
        }
        match (self.method.is_some(), self.id.is_some()) {
            (true, true) => MessageKind::Request,
            (true, false) => MessageKind::Notification,
            (false, true) => MessageKind::Response,
            (false, false) => MessageKind::Invalid,
        }
    }

    /// Raw bytes of the id as they appeared on the wire.
    pub fn raw_id(&self) -> Option<&str> {
        self.id.as_deref().map(RawValue::get)
    }
}

/// Replace the `id` member with the decimal integer `new_id`, preserving all
/// other members. Member order is not significant downstream.
pub fn rewrite_id(line: &str, new_id: i64) -> Result<String> {
    set_raw_id(line, &new_id.to_string())
}

/// Set the `id` member to the exact raw bytes `raw`.
pub fn restore_id(line: &str, raw: &str) -> Result<String> {
    set_raw_id(line, raw)
}

fn set_raw_id(line: &str, raw: &str) -> Result<String> {
    let mut members: BTreeMap<String, Box<RawValue>> =
        serde_json::from_str(line).context("rewrite id")?;
    members.insert("id".to_string(), RawValue::from_string(raw.to_string())?);
    Ok(serde_json::to_string(&members)?)
}
