//! Tagged content blocks for messages that carry more than plain text.
//!
//! The source material this runtime is modeled on represents message content
//! as a dynamically-typed union (`str | list[dict]`); Rust has no such thing,
//! so each shape becomes its own variant here. `Message::content`
//! (`client_wrapper.rs`) remains a plain `Arc<str>` for the common
//! single-text-block case used throughout the rest of the crate.
//!
//! No call site in this crate currently builds an outbound `Message` out of
//! a `Vec<ContentBlock>` -- tool results are turned into `Role::Tool`
//! messages directly from plain text (`model_adapter::tool_result_message`).
//! The translation this type implies (first `ToolResult` block becomes the
//! `role = tool` message, any remaining blocks become a trailing `role =
//! user` message) is unimplemented; this type exists for `coalesce_text` and
//! as a typed home for richer content a future `ClientWrapper` could round-trip
//! through.

use serde_json::Value;

/// One block of a structured message body.
#[derive(Debug, Clone)]
pub enum ContentBlock {
    /// Plain text. Adjacent `Text` blocks are coalesced (concatenated) when
    /// translated to wire format.
    Text(String),
    /// Model reasoning meant to be shown inline, serialized as
    /// `<think>...</think>` within a text block.
    Think(String),
    /// Reasoning the provider redacted; serialized as
    /// `<redacted_think>...</redacted_think>`.
    RedactedThink(String),
    /// The result of a tool call, correlated by id.
    ToolResult { tool_call_id: String, text: String },
    /// An image reference (URL or data URI).
    Image { url: String },
    /// Anything else, preserved verbatim as opaque JSON so unrecognized
    /// provider-specific block shapes round-trip without data loss.
    Other(Value),
}

impl ContentBlock {
    pub fn text(s: impl Into<String>) -> Self {
        ContentBlock::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Coalesce adjacent `Text` blocks, per the model adapter's wire translation
/// rule. Non-text blocks act as a barrier: text is only merged with its
/// immediate text-typed neighbors.
pub fn coalesce_text(blocks: &[ContentBlock]) -> Vec<ContentBlock> {
    let mut out: Vec<ContentBlock> = Vec::with_capacity(blocks.len());
    for block in blocks {
        if let (Some(ContentBlock::Text(prev)), ContentBlock::Text(cur)) =
            (out.last_mut(), block)
        {
            prev.push_str(cur);
            continue;
        }
        out.push(block.clone());
    }
    out
}
