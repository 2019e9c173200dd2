//! Wire format of the orchestrator's merged event stream.
//!
//! `AgentEvent` is the structured record a client consumes from
//! `Orchestrator::run`, correlated across an entire task tree by `task_id`.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::cloudllm::client_wrapper::{Message, NativeToolCall, Role};

/// Terminal/non-terminal status of a step-loop round, carried on every
/// [`AgentResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Finished,
    Stopped,
    Error,
}

/// Which of the three response shapes an [`AgentResponse`] carries.
///
/// A `finished` [`RunStatus`] always pairs with [`ResponseKind::Final`]; a
/// `running` status pairs with [`ResponseKind::Stream`] or
/// [`ResponseKind::Accumulated`]. `Stream` responses are never persisted to
/// the [`ContextStore`](crate::cloudllm::context_store::ContextStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    Stream,
    Accumulated,
    Final,
}

/// One unit of step-loop output: a delta, an accumulated snapshot, a final
/// message, or a tool-result message, always carrying the round it was
/// produced in.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub kind: ResponseKind,
    pub status: RunStatus,
    pub message: Message,
    pub error_msg: Option<String>,
    pub step_index: u32,
}

impl AgentResponse {
    pub fn stream(message: Message, step_index: u32) -> Self {
        AgentResponse {
            kind: ResponseKind::Stream,
            status: RunStatus::Running,
            message,
            error_msg: None,
            step_index,
        }
    }

    pub fn accumulated(message: Message, step_index: u32) -> Self {
        AgentResponse {
            kind: ResponseKind::Accumulated,
            status: RunStatus::Running,
            message,
            error_msg: None,
            step_index,
        }
    }

    pub fn finished(message: Message, step_index: u32) -> Self {
        AgentResponse {
            kind: ResponseKind::Final,
            status: RunStatus::Finished,
            message,
            error_msg: None,
            step_index,
        }
    }

    pub fn stopped(message: Message, step_index: u32) -> Self {
        AgentResponse {
            kind: ResponseKind::Final,
            status: RunStatus::Stopped,
            message,
            error_msg: None,
            step_index,
        }
    }

    pub fn error(error_msg: impl Into<String>, step_index: u32) -> Self {
        AgentResponse {
            kind: ResponseKind::Final,
            status: RunStatus::Error,
            message: Message {
                role: Role::Assistant,
                content: Arc::from(""),
                tool_calls: vec![],
            },
            error_msg: Some(error_msg.into()),
            step_index,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            RunStatus::Finished | RunStatus::Stopped | RunStatus::Error
        )
    }
}

/// A tool call as it appears in the wire format: `{id, type: "function",
/// function: {name, arguments}, index?}`. Distinct from
/// [`NativeToolCall`](crate::cloudllm::client_wrapper::NativeToolCall), which
/// is the in-memory representation already decoded/merged; `WireToolCall` is
/// what a provider streams and what lands in a serialized `AgentEvent`.
#[derive(Debug, Clone)]
pub struct WireToolCall {
    pub id: String,
    pub call_type: String,
    pub name: String,
    pub arguments: String,
    pub index: Option<u32>,
}

impl WireToolCall {
    /// Apply the model adapter's missing-field defaults: absent `arguments`
    /// becomes `"{}"`, absent `name` falls back to the call id or
    /// `"unknown"`.
    pub fn with_defaults(id: String, name: Option<String>, arguments: Option<String>, index: Option<u32>) -> Self {
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| if id.is_empty() { "unknown".to_string() } else { id.clone() });
        let arguments = arguments.unwrap_or_else(|| "{}".to_string());
        WireToolCall {
            id,
            call_type: "function".to_string(),
            name,
            arguments,
            index,
        }
    }
}

impl From<&NativeToolCall> for WireToolCall {
    fn from(call: &NativeToolCall) -> Self {
        WireToolCall {
            id: call.id.clone(),
            call_type: "function".to_string(),
            name: call.name.clone(),
            arguments: call.arguments.to_string(),
            index: None,
        }
    }
}

/// Which external surface a tool call of client-protocol shape is routed
/// to. The orchestrator inspects this tag on a `CLIENT_TOOL_CALL` event to
/// decide whether to forward it to the transport or spawn a child
/// [`Runner`](crate::cloudllm::runner::Runner).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientToolCallType {
    /// A human-in-the-loop or otherwise externally-answered tool (e.g.
    /// `ask_input`); the orchestrator forwards it to the connected client.
    AskInput,
    /// Any other client-routed tool whose answer arrives out-of-band.
    Client,
    /// A sub-agent invocation; the orchestrator spawns a child runner
    /// instead of forwarding externally.
    Agent,
}

impl ClientToolCallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientToolCallType::AskInput => "ask_input",
            ClientToolCallType::Client => "client",
            ClientToolCallType::Agent => "agent",
        }
    }
}

/// Payload of a `CLIENT_TOOL_CALL` event: what the tool executor asked for.
#[derive(Debug, Clone)]
pub struct ClientToolCall {
    pub request_id: String,
    pub tool_name: String,
    pub call_type: ClientToolCallType,
    pub arguments: Value,
    pub schema: Value,
}

/// Payload of a `CLIENT_TOOL_RESULT` event: the out-of-band answer, keyed by
/// `tool_call_id` so the step loop can match it to the assistant message
/// that requested it.
#[derive(Debug, Clone)]
pub struct ClientToolResult {
    pub tool_call_id: String,
    pub message: Message,
    pub error: Option<String>,
}

/// The one-of payload an `AgentEvent` carries, selected by
/// [`AgentEventType`].
#[derive(Debug, Clone)]
pub enum AgentEventPayload {
    Request { message: Message },
    Response(AgentResponse),
    Error { message: String },
    Signal { status: String },
    ClientToolCall(ClientToolCall),
    ClientToolResult(ClientToolResult),
}

/// Discriminant mirrored by [`AgentEventPayload`]; kept distinct from the
/// payload so callers can match on `event.event_type` without destructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEventType {
    Request,
    Response,
    Error,
    Signal,
    ClientToolCall,
    ClientToolResult,
}

/// The orchestrator's wire-format event. Every event after the first
/// `REQUEST` carries `task_id`; a root task's `root_task_id` equals its own
/// `task_id`; a child task's `parent_task_id` is its creator's `task_id` and
/// `root_task_id` is inherited from the root.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub event_id: String,
    pub task_id: String,
    pub parent_task_id: Option<String>,
    pub root_task_id: String,
    pub event_type: AgentEventType,
    pub agent_name: Option<String>,
    pub payload: AgentEventPayload,
    pub metadata: Value,
}

impl AgentEvent {
    pub fn new(
        task_id: impl Into<String>,
        root_task_id: impl Into<String>,
        parent_task_id: Option<String>,
        agent_name: Option<String>,
        payload: AgentEventPayload,
    ) -> Self {
        let event_type = match &payload {
            AgentEventPayload::Request { .. } => AgentEventType::Request,
            AgentEventPayload::Response(_) => AgentEventType::Response,
            AgentEventPayload::Error { .. } => AgentEventType::Error,
            AgentEventPayload::Signal { .. } => AgentEventType::Signal,
            AgentEventPayload::ClientToolCall(_) => AgentEventType::ClientToolCall,
            AgentEventPayload::ClientToolResult(_) => AgentEventType::ClientToolResult,
        };
        AgentEvent {
            event_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            parent_task_id,
            root_task_id: root_task_id.into(),
            event_type,
            agent_name,
            payload,
            metadata: Value::Null,
        }
    }

    pub fn request(task_id: impl Into<String>, root_task_id: impl Into<String>, message: Message) -> Self {
        Self::new(task_id, root_task_id, None, None, AgentEventPayload::Request { message })
    }

    pub fn response(
        task_id: impl Into<String>,
        root_task_id: impl Into<String>,
        parent_task_id: Option<String>,
        agent_name: impl Into<String>,
        response: AgentResponse,
    ) -> Self {
        Self::new(
            task_id,
            root_task_id,
            parent_task_id,
            Some(agent_name.into()),
            AgentEventPayload::Response(response),
        )
    }

    pub fn error(
        task_id: impl Into<String>,
        root_task_id: impl Into<String>,
        parent_task_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            task_id,
            root_task_id,
            parent_task_id,
            None,
            AgentEventPayload::Error { message: message.into() },
        )
    }

    pub fn signal(
        task_id: impl Into<String>,
        root_task_id: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self::new(
            task_id,
            root_task_id,
            None,
            None,
            AgentEventPayload::Signal { status: status.into() },
        )
    }

    pub fn client_tool_call(
        task_id: impl Into<String>,
        root_task_id: impl Into<String>,
        agent_name: impl Into<String>,
        call: ClientToolCall,
    ) -> Self {
        Self::new(
            task_id,
            root_task_id,
            None,
            Some(agent_name.into()),
            AgentEventPayload::ClientToolCall(call),
        )
    }

    pub fn client_tool_result(
        task_id: impl Into<String>,
        root_task_id: impl Into<String>,
        result: ClientToolResult,
    ) -> Self {
        Self::new(task_id, root_task_id, None, None, AgentEventPayload::ClientToolResult(result))
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_task_inherits_its_own_id() {
        let msg = Message { role: Role::User, content: Arc::from("hi"), tool_calls: vec![] };
        let event = AgentEvent::request("t1", "t1", msg);
        assert_eq!(event.task_id, event.root_task_id);
        assert!(event.parent_task_id.is_none());
    }

    #[test]
    fn wire_tool_call_defaults_missing_arguments_and_name() {
        let call = WireToolCall::with_defaults("call_1".to_string(), None, None, None);
        assert_eq!(call.arguments, "{}");
        assert_eq!(call.name, "call_1");
    }

    #[test]
    fn wire_tool_call_falls_back_to_unknown_when_id_is_empty() {
        let call = WireToolCall::with_defaults(String::new(), None, None, None);
        assert_eq!(call.name, "unknown");
    }
}
