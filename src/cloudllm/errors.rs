//! Crate-wide error taxonomy for the orchestration runtime.
//!
//! Mirrors the error classes a conforming step loop must distinguish: transient
//! provider failures that are retried, tool failures that are fed back to the
//! model rather than aborting the round, channel-correlation failures, and the
//! two terminal conditions (`FatalStep`, `BudgetExceeded`) that end a task.

use thiserror::Error;

/// Errors surfaced by the orchestration runtime's core components.
///
/// Individual components still return `Box<dyn std::error::Error>` at the
/// `ClientWrapper`/`ToolProtocol` boundary (unchanged from the rest of the
/// crate); `CloudLLMError` is the typed error used by the runtime components
/// introduced for the step loop, orchestrator, merger, and channel.
#[derive(Debug, Error)]
pub enum CloudLLMError {
    /// The model provider returned a retryable failure (5xx, connection reset,
    /// timeout) and every retry attempt was exhausted.
    #[error("model provider call failed after {attempts} attempts: {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A tool invocation raised. Carried back into the step loop as a tool
    /// result message rather than aborting the round.
    #[error("tool '{tool_name}' failed: {message}")]
    ToolFailure { tool_name: String, message: String },

    /// A `Channel::send_request` timed out waiting for `set_response`.
    #[error("request '{request_id}' for tool '{tool_name}' timed out")]
    ChannelTimeout { request_id: String, tool_name: String },

    /// A `Channel` request was cancelled before it resolved.
    #[error("request '{request_id}' was cancelled")]
    ChannelCancelled { request_id: String },

    /// Malformed JSON arguments, a message missing `role`, or another
    /// schema-boundary violation. Recovered from by substituting a default
    /// (empty object, dropped message) and logging.
    #[error("schema error: {0}")]
    SchemaError(String),

    /// An exception escaped the step loop body; the loop terminates with
    /// status `error`.
    #[error("fatal step error: {0}")]
    FatalStep(String),

    /// `max_steps` was exhausted. Not an error_msg-bearing condition; carried
    /// separately so callers can distinguish `stopped` from `error`.
    #[error("step budget exhausted after {0} rounds")]
    BudgetExceeded(u32),

    /// The named producer/task id is already registered.
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    /// Lookup of a runner, merger, or agent config failed.
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, CloudLLMError>;
