//! A [`Runner`] owns exactly one agent instance: it resolves an
//! [`AgentDefinition`](crate::cloudllm::agent_registry::AgentDefinition),
//! wires its tools (local, client-routed, agent-routed), drives its
//! [`StepLoop`], and presents the result as a `send`/`stream`/`get_result`
//! triple plus a `created -> initialized -> running -> finished | error |
//! cancelled` state machine.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cloudllm::agent_registry::AgentFactory;
use crate::cloudllm::channel::Channel;
use crate::cloudllm::client_wrapper::{Message, Role};
use crate::cloudllm::config::{resolve_overflow_limits, RuntimeConfig};
use crate::cloudllm::context_store::SharedContextStore;
use crate::cloudllm::errors::{CloudLLMError, Result};
use crate::cloudllm::merger::{BoxStream, MergedItem, Merger, MergerConfig};
use crate::cloudllm::overflow::{OverflowConfig, OverflowManager};
use crate::cloudllm::step_loop::{StepLoop, StepLoopConfig};
use crate::cloudllm::task_event::{
    AgentEvent, AgentEventPayload, ClientToolCall, ClientToolResult, RunStatus,
};
use crate::cloudllm::tool_protocol::ToolRegistry;
use crate::cloudllm::tool_protocols::{agent_tool_protocol, client_tool_protocol, ToolCallSendHook};

/// `created -> initialized -> running -> finished | error | cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Initialized,
    Running,
    Finished,
    Error,
    Cancelled,
}

/// Identity and placement a [`Runner`] is created with: where it sits in
/// the task tree, and which context id its history should land in.
#[derive(Debug, Clone)]
pub struct RunnerInit {
    pub task_id: String,
    pub root_task_id: String,
    pub parent_task_id: Option<String>,
    /// Set only for a child runner spawned to serve a parent's agent-typed
    /// tool call; `get_result` uses it to address the `CLIENT_TOOL_RESULT`
    /// back to that call.
    pub tool_call_id: Option<String>,
    /// Caller-supplied context id; ignored (a fresh id is minted instead)
    /// when the resolved agent's `use_share_context` is `false`.
    pub context_id: Option<String>,
}

impl RunnerInit {
    /// A root task: `root_task_id` equals `task_id`, no parent, no captured
    /// tool call.
    pub fn root(task_id: impl Into<String>, context_id: Option<String>) -> Self {
        let task_id = task_id.into();
        RunnerInit {
            root_task_id: task_id.clone(),
            task_id,
            parent_task_id: None,
            tool_call_id: None,
            context_id,
        }
    }

    /// A child task spawned to serve `tool_call_id` on behalf of `parent`.
    pub fn child(
        task_id: impl Into<String>,
        root_task_id: impl Into<String>,
        parent_task_id: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        RunnerInit {
            task_id: task_id.into(),
            root_task_id: root_task_id.into(),
            parent_task_id: Some(parent_task_id.into()),
            tool_call_id: Some(tool_call_id.into()),
            context_id: None,
        }
    }
}

/// Owns one agent's step loop and presents it as a send/stream/get_result
/// triple addressable by task id.
pub struct Runner {
    task_id: String,
    root_task_id: String,
    parent_task_id: Option<String>,
    agent_name: String,
    tool_call_id: Option<String>,
    context_id: String,
    system_prompt: Option<String>,
    channel: Channel,
    step_loop: Arc<StepLoop>,
    step_config: StepLoopConfig,
    context_store: SharedContextStore,
    local_merger: Merger<AgentEvent>,
    state: Arc<Mutex<RunnerState>>,
    last_finished: Arc<Mutex<Option<AgentEvent>>>,
    started: Mutex<bool>,
}

impl Runner {
    /// Resolve `agent_name` via `factory`, wire its tools, and return a
    /// runner in the `Initialized` state. Nothing runs yet: the step loop
    /// starts on the first `REQUEST` event delivered to `send`.
    pub async fn init(
        factory: &dyn AgentFactory,
        agent_name: &str,
        init: RunnerInit,
        context_store: SharedContextStore,
        runtime_config: &RuntimeConfig,
    ) -> Result<Self> {
        let def = factory
            .resolve(agent_name)
            .ok_or_else(|| CloudLLMError::NotFound(format!("agent '{agent_name}'")))?;

        let context_id = if def.use_share_context {
            init.context_id.clone().unwrap_or_else(|| init.task_id.clone())
        } else {
            Uuid::new_v4().to_string()
        };

        let channel = Channel::new();
        let local_merger: Merger<AgentEvent> = Merger::new(MergerConfig::default());

        let mut registry = ToolRegistry::empty();
        if let Some(protocol) = def.local_protocol.clone() {
            registry
                .add_protocol("local", protocol)
                .await
                .map_err(|err| CloudLLMError::SchemaError(err.to_string()))?;
        }

        let send_hook = Self::build_send_hook(
            local_merger.clone(),
            init.task_id.clone(),
            init.root_task_id.clone(),
            agent_name.to_string(),
        );

        if !def.client_tools.is_empty() {
            let protocol = client_tool_protocol(channel.clone(), send_hook.clone());
            for metadata in &def.client_tools {
                protocol.register_tool(metadata.clone()).await;
            }
            registry
                .add_protocol("client", Arc::new(protocol))
                .await
                .map_err(|err| CloudLLMError::SchemaError(err.to_string()))?;
        }

        if !def.agent_tools.is_empty() {
            let protocol = agent_tool_protocol(channel.clone(), send_hook);
            for metadata in &def.agent_tools {
                protocol.register_tool(metadata.clone()).await;
            }
            registry
                .add_protocol("agent", Arc::new(protocol))
                .await
                .map_err(|err| CloudLLMError::SchemaError(err.to_string()))?;
        }

        let default_overflow = OverflowConfig::default();
        let (upper, lower) = resolve_overflow_limits(
            &def.extra_config,
            runtime_config,
            default_overflow.upper_limit,
            default_overflow.lower_limit,
        );
        let overflow_config = OverflowConfig::new(upper, lower, default_overflow.final_answer_prompt);
        let overflow = OverflowManager::new(overflow_config);

        let step_loop = Arc::new(StepLoop::new(
            def.client.clone(),
            Arc::new(registry),
            context_store.clone(),
            overflow,
        ));

        let step_config = StepLoopConfig {
            agent_name: agent_name.to_string(),
            max_steps: def.max_steps,
            tool_timeout: def.tool_timeout,
        };

        Ok(Runner {
            task_id: init.task_id,
            root_task_id: init.root_task_id,
            parent_task_id: init.parent_task_id,
            agent_name: agent_name.to_string(),
            tool_call_id: init.tool_call_id,
            context_id,
            system_prompt: def.system_prompt,
            channel,
            step_loop,
            step_config,
            context_store,
            local_merger,
            state: Arc::new(Mutex::new(RunnerState::Initialized)),
            last_finished: Arc::new(Mutex::new(None)),
            started: Mutex::new(false),
        })
    }

    /// Build the hook handed to every `ChannelToolProtocol` this runner
    /// wires up. Each invocation registers a one-shot producer under its
    /// own `request_id` into the local merger, exactly matching the
    /// contract's "register every tool send-hook call as its own
    /// generator" -- late registrations are precisely what the merger was
    /// designed to pick up mid-stream.
    fn build_send_hook(
        merger: Merger<AgentEvent>,
        task_id: String,
        root_task_id: String,
        agent_name: String,
    ) -> ToolCallSendHook {
        Arc::new(move |request_id, call_type, tool_name, arguments| {
            let merger = merger.clone();
            let task_id = task_id.clone();
            let root_task_id = root_task_id.clone();
            let agent_name = agent_name.clone();
            Box::pin(async move {
                let call = ClientToolCall {
                    request_id: request_id.clone(),
                    tool_name,
                    call_type,
                    arguments,
                    schema: Value::Null,
                };
                let event = AgentEvent::client_tool_call(task_id, root_task_id, agent_name, call);
                let producer_id = format!("toolcall:{request_id}");
                merger
                    .register(producer_id, Box::pin(futures_util::stream::once(async move { event })))
                    .await;
            })
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        self.tool_call_id.as_deref()
    }

    pub fn parent_task_id(&self) -> Option<&str> {
        self.parent_task_id.as_deref()
    }

    pub fn root_task_id(&self) -> &str {
        &self.root_task_id
    }

    pub async fn state(&self) -> RunnerState {
        *self.state.lock().await
    }

    /// Route an inbound event: a `REQUEST` seeds the context store (with a
    /// leading system message the first time, if the agent has one) and
    /// starts the step loop; a `CLIENT_TOOL_RESULT` resolves the matching
    /// `Channel` slot.
    pub async fn send(&self, event: AgentEvent) -> Result<()> {
        match event.payload {
            AgentEventPayload::Request { message } => {
                let mut seed = Vec::new();
                if let Some(prompt) = &self.system_prompt {
                    let existing = self.context_store.get_all(&self.context_id).await;
                    if existing.is_empty() {
                        seed.push(Message {
                            role: Role::System,
                            content: Arc::from(prompt.as_str()),
                            tool_calls: vec![],
                        });
                    }
                }
                seed.push(message);
                self.context_store.add(&self.context_id, seed).await;
                self.start_if_needed().await;
                Ok(())
            }
            AgentEventPayload::ClientToolResult(result) => {
                let ClientToolResult { tool_call_id, message, error } = result;
                let data = serde_json::json!({ "content": message.content.to_string() });
                self.channel.set_response(&tool_call_id, data, error).await;
                Ok(())
            }
            other => Err(CloudLLMError::SchemaError(format!(
                "runner cannot accept inbound event payload {other:?}"
            ))),
        }
    }

    async fn start_if_needed(&self) {
        let mut started = self.started.lock().await;
        if *started {
            return;
        }
        *started = true;
        *self.state.lock().await = RunnerState::Running;

        let step_loop = self.step_loop.clone();
        let context_id = self.context_id.clone();
        let step_config = self.step_config.clone();
        let merger = self.local_merger.clone();
        let task_id = self.task_id.clone();
        let root_task_id = self.root_task_id.clone();
        let parent_task_id = self.parent_task_id.clone();
        let agent_name = self.agent_name.clone();

        let (tx, rx) = tokio::sync::mpsc::channel(256);
        tokio::spawn(async move {
            let mut responses = step_loop.run(context_id, step_config);
            while let Some(response) = responses.next().await {
                let event = AgentEvent::response(
                    task_id.clone(),
                    root_task_id.clone(),
                    parent_task_id.clone(),
                    agent_name.clone(),
                    response,
                );
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        let stream: BoxStream<AgentEvent> =
            Box::pin(futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }));
        merger.register(format!("steploop:{}", self.task_id), stream).await;
    }

    /// The runner's merged event stream: step-loop output interleaved with
    /// every outstanding client/agent tool call, in arrival order.
    /// Terminal responses update the runner's observable state and are
    /// cached for [`Runner::get_result`].
    pub fn stream(&self) -> BoxStream<AgentEvent> {
        let raw = self.local_merger.stream();
        let last_finished = self.last_finished.clone();
        let state = self.state.clone();
        Box::pin(raw.filter_map(move |item| {
            let last_finished = last_finished.clone();
            let state = state.clone();
            async move {
                match item {
                    MergedItem::Item(event) => {
                        if let AgentEventPayload::Response(resp) = &event.payload {
                            if resp.is_terminal() {
                                *last_finished.lock().await = Some(event.clone());
                                *state.lock().await = match resp.status {
                                    RunStatus::Finished | RunStatus::Stopped => RunnerState::Finished,
                                    RunStatus::Error => RunnerState::Error,
                                    RunStatus::Running => RunnerState::Running,
                                };
                            }
                        }
                        Some(event)
                    }
                    MergedItem::Complete(_) => None,
                }
            }
        }))
    }

    /// After the stream has ended, the last finished `AgentEvent`. For a
    /// child runner (one created with a captured `tool_call_id`), the
    /// response is converted into a `CLIENT_TOOL_RESULT` addressed to that
    /// call -- this is how a parent observes a sub-agent's answer.
    pub async fn get_result(&self) -> Option<AgentEvent> {
        let finished = self.last_finished.lock().await.clone()?;
        let AgentEventPayload::Response(resp) = &finished.payload else {
            return Some(finished);
        };
        match &self.tool_call_id {
            Some(tool_call_id) => {
                let error = if resp.status == RunStatus::Error {
                    resp.error_msg.clone()
                } else {
                    None
                };
                let result = ClientToolResult {
                    tool_call_id: tool_call_id.clone(),
                    message: resp.message.clone(),
                    error,
                };
                Some(AgentEvent::client_tool_result(self.task_id.clone(), self.root_task_id.clone(), result))
            }
            None => Some(finished),
        }
    }

    /// Mark the runner cancelled. Does not forcibly abort the in-flight
    /// step loop task (dropping the runner's merger registration and
    /// letting the spawned task's sends fail is how that unwinds); callers
    /// tearing down a task tree drop the `Runner` itself to release it.
    pub async fn cancel(&self) {
        *self.state.lock().await = RunnerState::Cancelled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::agent_registry::{AgentDefinition, StaticAgentFactory};
    use crate::cloudllm::client_wrapper::{ClientWrapper, ToolDefinition};
    use crate::cloudllm::context_store::InMemoryContextStore;
    use crate::cloudllm::task_event::{AgentEventType, ClientToolCallType};
    use crate::cloudllm::tool_protocol::ToolMetadata;
    use async_trait::async_trait;

    struct EchoClient;

    #[async_trait]
    impl ClientWrapper for EchoClient {
        async fn send_message(
            &self,
            messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> std::result::Result<Message, Box<dyn std::error::Error>> {
            let last_user = messages
                .iter()
                .rev()
                .find(|m| matches!(m.role, Role::User))
                .map(|m| m.content.to_string())
                .unwrap_or_default();
            Ok(Message {
                role: Role::Assistant,
                content: Arc::from(format!("echo: {last_user}").as_str()),
                tool_calls: vec![],
            })
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    struct AskInputClient;

    #[async_trait]
    impl ClientWrapper for AskInputClient {
        async fn send_message(
            &self,
            messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> std::result::Result<Message, Box<dyn std::error::Error>> {
            let already_asked = messages.iter().any(|m| matches!(m.role, Role::Tool { .. }));
            if already_asked {
                let answer = messages
                    .iter()
                    .rev()
                    .find(|m| matches!(m.role, Role::Tool { .. }))
                    .map(|m| m.content.to_string())
                    .unwrap_or_default();
                return Ok(Message {
                    role: Role::Assistant,
                    content: Arc::from(format!("You said: {answer}").as_str()),
                    tool_calls: vec![],
                });
            }
            Ok(Message {
                role: Role::Assistant,
                content: Arc::from(""),
                tool_calls: vec![crate::cloudllm::client_wrapper::NativeToolCall {
                    id: "call_1".to_string(),
                    name: "ask_input".to_string(),
                    arguments: serde_json::json!({"prompt": "Your name?"}),
                }],
            })
        }

        fn model_name(&self) -> &str {
            "ask-input"
        }
    }

    fn request_event(task_id: &str, text: &str) -> AgentEvent {
        AgentEvent::request(
            task_id,
            task_id,
            Message { role: Role::User, content: Arc::from(text), tool_calls: vec![] },
        )
    }

    #[tokio::test]
    async fn finishes_a_no_tool_round_and_reports_result() {
        let factory = StaticAgentFactory::new()
            .register(AgentDefinition::new("EchoAgent", Arc::new(EchoClient)).with_max_steps(3));
        let context_store: SharedContextStore = Arc::new(InMemoryContextStore::new());
        let runner = Runner::init(
            &factory,
            "EchoAgent",
            RunnerInit::root("t1", None),
            context_store,
            &RuntimeConfig::default(),
        )
        .await
        .unwrap();

        runner.send(request_event("t1", "hi")).await.unwrap();
        let mut stream = runner.stream();
        let mut saw_finished = false;
        while let Some(event) = stream.next().await {
            if let AgentEventPayload::Response(resp) = &event.payload {
                if resp.status == RunStatus::Finished {
                    saw_finished = true;
                    assert_eq!(resp.message.content.as_ref(), "echo: hi");
                }
            }
        }
        assert!(saw_finished);
        assert_eq!(runner.state().await, RunnerState::Finished);
        let result = runner.get_result().await.unwrap();
        assert_eq!(result.event_type, AgentEventType::Response);
    }

    #[tokio::test]
    async fn child_runner_converts_finished_result_into_client_tool_result() {
        let factory = StaticAgentFactory::new()
            .register(AgentDefinition::new("EchoAgent", Arc::new(EchoClient)).with_max_steps(3));
        let context_store: SharedContextStore = Arc::new(InMemoryContextStore::new());
        let runner = Runner::init(
            &factory,
            "EchoAgent",
            RunnerInit::child("child1", "root1", "root1", "call_42"),
            context_store,
            &RuntimeConfig::default(),
        )
        .await
        .unwrap();

        runner.send(request_event("child1", "sub task")).await.unwrap();
        let mut stream = runner.stream();
        while stream.next().await.is_some() {}

        let result = runner.get_result().await.unwrap();
        match result.payload {
            AgentEventPayload::ClientToolResult(r) => {
                assert_eq!(r.tool_call_id, "call_42");
                assert_eq!(r.message.content.as_ref(), "echo: sub task");
            }
            other => panic!("expected ClientToolResult, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ask_input_tool_call_surfaces_as_client_tool_call_event() {
        let factory = StaticAgentFactory::new().register(
            AgentDefinition::new("Asker", Arc::new(AskInputClient))
                .with_max_steps(4)
                .with_client_tool(
                    ToolMetadata::new("ask_input", "ask the user something"),
                ),
        );
        let context_store: SharedContextStore = Arc::new(InMemoryContextStore::new());
        let runner = Runner::init(
            &factory,
            "Asker",
            RunnerInit::root("t2", None),
            context_store,
            &RuntimeConfig::default(),
        )
        .await
        .unwrap();

        runner.send(request_event("t2", "start")).await.unwrap();
        let mut stream = runner.stream();

        let mut request_id = None;
        while let Some(event) = stream.next().await {
            if let AgentEventPayload::ClientToolCall(call) = &event.payload {
                assert_eq!(call.call_type, ClientToolCallType::Client);
                assert_eq!(call.tool_name, "ask_input");
                request_id = Some(call.request_id.clone());
                let reply = AgentEvent::client_tool_result(
                    "t2",
                    "t2",
                    ClientToolResult {
                        tool_call_id: call.request_id.clone(),
                        message: Message {
                            role: Role::User,
                            content: Arc::from("Ada"),
                            tool_calls: vec![],
                        },
                        error: None,
                    },
                );
                runner.send(reply).await.unwrap();
            }
        }
        assert!(request_id.is_some());
        let result = runner.get_result().await.unwrap();
        if let AgentEventPayload::Response(resp) = result.payload {
            assert!(resp.message.content.contains("You said"));
        } else {
            panic!("expected a final response");
        }
    }
}
