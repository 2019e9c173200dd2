//! Builds the task tree a request spawns, multiplexes every runner's events
//! through one [`Merger`], and pumps sub-agent results back up to their
//! callers.
//!
//! [`Orchestrator::run`] owns exactly one root [`Runner`] per call; every
//! `CLIENT_TOOL_CALL` of type `agent` that root (or one of its descendants)
//! emits causes a child runner to be spawned transparently and merged into
//! the same event stream, in [`OrchestratorMode::Multi`]. [`OrchestratorMode::Single`]
//! skips that spawning step entirely: agent-typed tool calls surface to the
//! caller exactly like any other client tool call, and every runner's
//! completion is just torn down rather than propagated to a parent.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::cloudllm::agent_registry::{AgentFactory, StaticAgentFactory};
use crate::cloudllm::client_wrapper::{Message, Role};
use crate::cloudllm::config::RuntimeConfig;
use crate::cloudllm::context_store::SharedContextStore;
use crate::cloudllm::errors::{CloudLLMError, Result};
use crate::cloudllm::merger::{BoxStream, CompletionStatus, MergedItem, Merger, MergerConfig, OnComplete};
use crate::cloudllm::runner::{Runner, RunnerInit};
use crate::cloudllm::task_event::{
    AgentEvent, AgentEventPayload, ClientToolCallType, ClientToolResult,
};

/// Whether sub-agent tool calls are spawned transparently (`Multi`) or
/// surfaced to the caller untouched (`Single`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorMode {
    Multi,
    Single,
}

type RunnerMap = Arc<Mutex<HashMap<String, Arc<Runner>>>>;

struct TaskTree {
    runners: RunnerMap,
}

/// Coordinates one or more task trees, each rooted at a call to
/// [`Orchestrator::run`]. Holds the collaborators every [`Runner`] it creates
/// needs: the agent catalog, the shared context store, and the process-wide
/// overflow defaults.
pub struct Orchestrator {
    factory: Arc<dyn AgentFactory>,
    context_store: SharedContextStore,
    runtime_config: RuntimeConfig,
    trees: Arc<Mutex<HashMap<String, Arc<TaskTree>>>>,
}

impl Orchestrator {
    pub fn new(factory: Arc<dyn AgentFactory>, context_store: SharedContextStore) -> Self {
        Orchestrator {
            factory,
            context_store,
            runtime_config: RuntimeConfig::default(),
            trees: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_runtime_config(mut self, runtime_config: RuntimeConfig) -> Self {
        self.runtime_config = runtime_config;
        self
    }

    /// The agent names this orchestrator's catalog can resolve, for a
    /// `GET /agents`-style listing surface.
    pub fn agent_catalog(&self) -> Vec<String> {
        self.factory.agent_names()
    }

    /// Run `agent_name` against `entry_event`, returning a lazily-merged
    /// stream of every event the resulting task tree produces.
    ///
    /// `agent_config`, when given, shallow-merges onto the resolved agent's
    /// `extra_config` for this invocation only (e.g. a tighter context
    /// threshold); the agent's registered defaults are untouched and every
    /// child runner spawned under this tree still resolves its own default
    /// config.
    pub async fn run(
        &self,
        agent_name: &str,
        entry_event: AgentEvent,
        agent_config: Option<&Value>,
        mode: OrchestratorMode,
        context_id: Option<String>,
    ) -> Result<BoxStream<AgentEvent>> {
        let entry_event = normalize_entry(entry_event);
        let root_task_id = entry_event.task_id.clone();

        let runner = Arc::new(
            self.init_runner(
                agent_name,
                RunnerInit::root(root_task_id.clone(), context_id),
                agent_config,
            )
            .await?,
        );

        let merger: Merger<AgentEvent> = Merger::new(MergerConfig::default());
        let runners: RunnerMap = Arc::new(Mutex::new(HashMap::new()));
        runners.lock().await.insert(root_task_id.clone(), runner.clone());
        merger.register(root_task_id.clone(), runner.stream()).await;

        let tree = Arc::new(TaskTree { runners: runners.clone() });
        self.trees.lock().await.insert(root_task_id.clone(), tree);

        merger
            .set_on_complete(completion_callback(
                runners.clone(),
                self.trees.clone(),
                root_task_id.clone(),
                mode,
            ))
            .await;

        runner.send(entry_event).await?;

        let (out_tx, out_rx) = mpsc::channel(256);
        let factory = self.factory.clone();
        let context_store = self.context_store.clone();
        let runtime_config = self.runtime_config;
        let root_task_id_pump = root_task_id.clone();
        tokio::spawn(pump(merger, runners, factory, context_store, runtime_config, root_task_id_pump, mode, out_tx));

        Ok(Box::pin(futures_util::stream::unfold(out_rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })))
    }

    /// Forward `event` to the runner whose `task_id` it names, within the
    /// task tree its `root_task_id` names. Used by the transport layer to
    /// deliver `CLIENT_TOOL_RESULT`s (ask-input replies, out-of-band client
    /// tool answers) into an already-running tree.
    pub async fn send_event(&self, event: AgentEvent) -> Result<()> {
        let tree = self
            .trees
            .lock()
            .await
            .get(&event.root_task_id)
            .cloned()
            .ok_or_else(|| CloudLLMError::NotFound(format!("task tree '{}'", event.root_task_id)))?;
        let runner = tree
            .runners
            .lock()
            .await
            .get(&event.task_id)
            .cloned()
            .ok_or_else(|| CloudLLMError::NotFound(format!("task '{}'", event.task_id)))?;
        runner.send(event).await
    }

    async fn init_runner(
        &self,
        agent_name: &str,
        init: RunnerInit,
        agent_config: Option<&Value>,
    ) -> Result<Runner> {
        match agent_config {
            None => Runner::init(self.factory.as_ref(), agent_name, init, self.context_store.clone(), &self.runtime_config).await,
            Some(overrides) => {
                let def = self
                    .factory
                    .resolve(agent_name)
                    .ok_or_else(|| CloudLLMError::NotFound(format!("agent '{agent_name}'")))?
                    .with_extra_config_merged(overrides);
                let one_off = StaticAgentFactory::new().register(def);
                Runner::init(&one_off, agent_name, init, self.context_store.clone(), &self.runtime_config).await
            }
        }
    }
}

fn normalize_entry(mut entry_event: AgentEvent) -> AgentEvent {
    if entry_event.task_id.is_empty() {
        entry_event.task_id = Uuid::new_v4().to_string();
    }
    entry_event.root_task_id = entry_event.task_id.clone();
    entry_event.parent_task_id = None;
    entry_event
}

/// Parse an agent-tool call's arguments into the messages its entry
/// `REQUEST` should carry, accepting either `{messages:[{role,content},…]}`
/// or the single-field shorthand `{content:"…"}`.
fn parse_agent_messages(arguments: &Value) -> Vec<Message> {
    if let Some(items) = arguments.get("messages").and_then(|v| v.as_array()) {
        let parsed: Vec<Message> = items
            .iter()
            .map(|item| {
                let role = match item.get("role").and_then(|r| r.as_str()) {
                    Some("system") => Role::System,
                    Some("assistant") => Role::Assistant,
                    _ => Role::User,
                };
                let content = item.get("content").and_then(|c| c.as_str()).unwrap_or_default();
                Message { role, content: Arc::from(content), tool_calls: vec![] }
            })
            .collect();
        if !parsed.is_empty() {
            return parsed;
        }
    }
    let content = arguments
        .get("content")
        .and_then(|c| c.as_str())
        .or_else(|| arguments.as_str())
        .unwrap_or_default();
    vec![Message { role: Role::User, content: Arc::from(content), tool_calls: vec![] }]
}

/// Drain the tree's merger. Forward every event except `Multi`-mode
/// agent-typed `CLIENT_TOOL_CALL`s, which instead spawn a child runner
/// registered into the same merger -- the loop re-enters to pick up that
/// child's events rather than ever yielding the spawning call itself.
#[allow(clippy::too_many_arguments)]
async fn pump(
    merger: Merger<AgentEvent>,
    runners: RunnerMap,
    factory: Arc<dyn AgentFactory>,
    context_store: SharedContextStore,
    runtime_config: RuntimeConfig,
    root_task_id: String,
    mode: OrchestratorMode,
    out_tx: mpsc::Sender<AgentEvent>,
) {
    let mut stream = merger.stream();
    while let Some(item) = stream.next().await {
        let event = match item {
            MergedItem::Item(event) => event,
            MergedItem::Complete(_) => continue,
        };

        if mode == OrchestratorMode::Multi {
            if let AgentEventPayload::ClientToolCall(call) = &event.payload {
                if call.call_type == ClientToolCallType::Agent {
                    spawn_child(
                        &merger,
                        &runners,
                        factory.as_ref(),
                        &context_store,
                        &runtime_config,
                        &root_task_id,
                        &event.task_id,
                        call.request_id.clone(),
                        call.tool_name.clone(),
                        call.arguments.clone(),
                    )
                    .await;
                    continue;
                }
            }
        }

        if out_tx.send(event).await.is_err() {
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn spawn_child(
    merger: &Merger<AgentEvent>,
    runners: &RunnerMap,
    factory: &dyn AgentFactory,
    context_store: &SharedContextStore,
    runtime_config: &RuntimeConfig,
    root_task_id: &str,
    parent_task_id: &str,
    tool_call_id: String,
    agent_name: String,
    arguments: Value,
) {
    let child_task_id = Uuid::new_v4().to_string();
    let init = RunnerInit::child(child_task_id.clone(), root_task_id.to_string(), parent_task_id.to_string(), tool_call_id.clone());

    let runner = match Runner::init(factory, &agent_name, init, context_store.clone(), runtime_config).await {
        Ok(runner) => Arc::new(runner),
        Err(err) => {
            deliver_to_parent(
                runners,
                parent_task_id,
                AgentEvent::client_tool_result(
                    child_task_id,
                    root_task_id.to_string(),
                    ClientToolResult {
                        tool_call_id,
                        message: Message { role: Role::Assistant, content: Arc::from(""), tool_calls: vec![] },
                        error: Some(err.to_string()),
                    },
                ),
            )
            .await;
            return;
        }
    };

    runners.lock().await.insert(child_task_id.clone(), runner.clone());
    merger.register(child_task_id.clone(), runner.stream()).await;

    for message in parse_agent_messages(&arguments) {
        let request = AgentEvent::request(child_task_id.clone(), root_task_id.to_string(), message);
        if runner.send(request).await.is_err() {
            break;
        }
    }
}

async fn deliver_to_parent(runners: &RunnerMap, parent_task_id: &str, event: AgentEvent) {
    let parent = runners.lock().await.get(parent_task_id).cloned();
    if let Some(parent) = parent {
        let _ = parent.send(event).await;
    }
}

/// Build the merger's `on_complete` hook: a producer id is a task id, so on
/// completion we look up its runner, and -- in `Multi` mode, when it has a
/// parent -- convert its last finished result into a `CLIENT_TOOL_RESULT`
/// and deliver it there. The root task's completion additionally tears down
/// the whole tree's bookkeeping.
fn completion_callback(
    runners: RunnerMap,
    trees: Arc<Mutex<HashMap<String, Arc<TaskTree>>>>,
    root_task_id: String,
    mode: OrchestratorMode,
) -> OnComplete {
    Arc::new(move |task_id, status| {
        let runners = runners.clone();
        let trees = trees.clone();
        let root_task_id = root_task_id.clone();
        tokio::spawn(async move {
            let runner = runners.lock().await.remove(&task_id);
            if let Some(runner) = runner {
                if mode == OrchestratorMode::Multi {
                    if let Some(parent_task_id) = runner.parent_task_id().map(str::to_string) {
                        let result_event = match runner.get_result().await {
                            Some(event) => Some(event),
                            None => match status {
                                CompletionStatus::Error(err) => Some(AgentEvent::client_tool_result(
                                    task_id.clone(),
                                    root_task_id.clone(),
                                    ClientToolResult {
                                        tool_call_id: runner.tool_call_id().unwrap_or_default().to_string(),
                                        message: Message { role: Role::Assistant, content: Arc::from(""), tool_calls: vec![] },
                                        error: Some(err),
                                    },
                                )),
                                CompletionStatus::Completed => None,
                            },
                        };
                        if let Some(result_event) = result_event {
                            deliver_to_parent(&runners, &parent_task_id, result_event).await;
                        }
                    }
                }
            }

            if task_id == root_task_id {
                trees.lock().await.remove(&root_task_id);
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::agent_registry::{AgentDefinition, StaticAgentFactory};
    use crate::cloudllm::client_wrapper::{ClientWrapper, NativeToolCall, ToolDefinition};
    use crate::cloudllm::context_store::InMemoryContextStore;
    use crate::cloudllm::task_event::{AgentEventType, ClientToolCallType as CallType, RunStatus};
    use crate::cloudllm::tool_protocol::ToolMetadata;
    use async_trait::async_trait;

    struct ScriptedOnceClient {
        reply: &'static str,
    }

    #[async_trait]
    impl ClientWrapper for ScriptedOnceClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> std::result::Result<Message, Box<dyn std::error::Error>> {
            Ok(Message { role: Role::Assistant, content: Arc::from(self.reply), tool_calls: vec![] })
        }

        fn model_name(&self) -> &str {
            "scripted-once"
        }
    }

    struct MainAgentClient;

    #[async_trait]
    impl ClientWrapper for MainAgentClient {
        async fn send_message(
            &self,
            messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> std::result::Result<Message, Box<dyn std::error::Error>> {
            let tool_result = messages.iter().rev().find(|m| matches!(m.role, Role::Tool { .. }));
            if let Some(result) = tool_result {
                return Ok(Message {
                    role: Role::Assistant,
                    content: Arc::from(format!("Found: {}", result.content).as_str()),
                    tool_calls: vec![],
                });
            }
            Ok(Message {
                role: Role::Assistant,
                content: Arc::from(""),
                tool_calls: vec![NativeToolCall {
                    id: "call_1".to_string(),
                    name: "SearchAgent".to_string(),
                    arguments: serde_json::json!({"content": "find cats"}),
                }],
            })
        }

        fn model_name(&self) -> &str {
            "main"
        }
    }

    fn request_event(text: &str) -> AgentEvent {
        AgentEvent::request(
            Uuid::new_v4().to_string(),
            "",
            Message { role: Role::User, content: Arc::from(text), tool_calls: vec![] },
        )
    }

    fn context_store() -> SharedContextStore {
        Arc::new(InMemoryContextStore::new())
    }

    #[tokio::test]
    async fn single_step_no_tool_run_yields_finished_response() {
        let factory: Arc<dyn AgentFactory> = Arc::new(
            StaticAgentFactory::new().register(
                AgentDefinition::new("MainAgent", Arc::new(ScriptedOnceClient { reply: "Hi." })).with_max_steps(3),
            ),
        );
        let orchestrator = Orchestrator::new(factory, context_store());

        let mut stream = orchestrator
            .run("MainAgent", request_event("Say hi."), None, OrchestratorMode::Multi, None)
            .await
            .unwrap();

        let mut saw_finished = false;
        while let Some(event) = stream.next().await {
            if let AgentEventPayload::Response(resp) = &event.payload {
                if resp.status == RunStatus::Finished {
                    saw_finished = true;
                    assert_eq!(resp.message.content.as_ref(), "Hi.");
                }
            }
        }
        assert!(saw_finished);
    }

    #[tokio::test]
    async fn sub_agent_call_spawns_child_and_propagates_result_to_parent() {
        let factory: Arc<dyn AgentFactory> = Arc::new(
            StaticAgentFactory::new()
                .register(
                    AgentDefinition::new("MainAgent", Arc::new(MainAgentClient))
                        .with_max_steps(4)
                        .with_agent_tool(ToolMetadata::new("SearchAgent", "delegate to the search agent")),
                )
                .register(
                    AgentDefinition::new("SearchAgent", Arc::new(ScriptedOnceClient { reply: "cats are great" }))
                        .with_max_steps(3),
                ),
        );
        let orchestrator = Orchestrator::new(factory, context_store());

        let mut stream = orchestrator
            .run("MainAgent", request_event("look into cats"), None, OrchestratorMode::Multi, None)
            .await
            .unwrap();

        let mut agent_tool_calls = 0;
        let mut final_answer = None;
        let mut saw_child_event = false;
        while let Some(event) = stream.next().await {
            match &event.payload {
                AgentEventPayload::ClientToolCall(call) if call.call_type == CallType::Agent => {
                    agent_tool_calls += 1;
                }
                AgentEventPayload::Response(resp) => {
                    if event.agent_name.as_deref() == Some("SearchAgent") {
                        saw_child_event = true;
                    }
                    if resp.status == RunStatus::Finished && event.agent_name.as_deref() == Some("MainAgent") {
                        final_answer = Some(resp.message.content.to_string());
                    }
                }
                _ => {}
            }
        }

        assert_eq!(agent_tool_calls, 0, "agent-typed tool calls are consumed internally in multi mode");
        assert!(saw_child_event, "child runner's events should be merged into the stream");
        let final_answer = final_answer.expect("MainAgent should have finished");
        assert!(final_answer.contains("cats are great"), "got: {final_answer}");
    }

    #[tokio::test]
    async fn single_mode_surfaces_agent_tool_calls_instead_of_spawning() {
        let factory: Arc<dyn AgentFactory> = Arc::new(StaticAgentFactory::new().register(
            AgentDefinition::new("MainAgent", Arc::new(MainAgentClient))
                .with_max_steps(4)
                .with_agent_tool(ToolMetadata::new("SearchAgent", "delegate to the search agent")),
        ));
        let orchestrator = Orchestrator::new(factory, context_store());

        let mut stream = orchestrator
            .run("MainAgent", request_event("look into cats"), None, OrchestratorMode::Single, None)
            .await
            .unwrap();

        let mut saw_agent_tool_call = false;
        while let Some(event) = stream.next().await {
            if let AgentEventPayload::ClientToolCall(call) = &event.payload {
                if call.call_type == CallType::Agent {
                    saw_agent_tool_call = true;
                    break;
                }
            }
        }
        assert!(saw_agent_tool_call, "single mode must not spawn sub-agents transparently");
    }

    #[tokio::test]
    async fn send_event_routes_ask_input_reply_into_the_running_tree() {
        struct AskInputClient;
        #[async_trait]
        impl ClientWrapper for AskInputClient {
            async fn send_message(
                &self,
                messages: &[Message],
                _tools: Option<Vec<ToolDefinition>>,
            ) -> std::result::Result<Message, Box<dyn std::error::Error>> {
                if messages.iter().any(|m| matches!(m.role, Role::Tool { .. })) {
                    return Ok(Message { role: Role::Assistant, content: Arc::from("thanks"), tool_calls: vec![] });
                }
                Ok(Message {
                    role: Role::Assistant,
                    content: Arc::from(""),
                    tool_calls: vec![NativeToolCall {
                        id: "call_ask".to_string(),
                        name: "ask_input".to_string(),
                        arguments: serde_json::json!({"prompt": "name?"}),
                    }],
                })
            }

            fn model_name(&self) -> &str {
                "ask-input"
            }
        }

        let factory: Arc<dyn AgentFactory> = Arc::new(StaticAgentFactory::new().register(
            AgentDefinition::new("Asker", Arc::new(AskInputClient))
                .with_max_steps(4)
                .with_client_tool(ToolMetadata::new("ask_input", "ask the user something")),
        ));
        let orchestrator = Orchestrator::new(factory, context_store());
        let entry = request_event("start");
        let task_id = entry.task_id.clone();

        let mut stream = orchestrator.run("Asker", entry, None, OrchestratorMode::Multi, None).await.unwrap();

        while let Some(event) = stream.next().await {
            if let AgentEventPayload::ClientToolCall(call) = &event.payload {
                let reply = AgentEvent::client_tool_result(
                    task_id.clone(),
                    task_id.clone(),
                    ClientToolResult {
                        tool_call_id: call.request_id.clone(),
                        message: Message { role: Role::User, content: Arc::from("Ada"), tool_calls: vec![] },
                        error: None,
                    },
                );
                orchestrator.send_event(reply).await.unwrap();
            }
            if let AgentEventPayload::Response(resp) = &event.payload {
                if resp.status == RunStatus::Finished {
                    assert_eq!(resp.message.content.as_ref(), "thanks");
                    assert_eq!(event.event_type, AgentEventType::Response);
                }
            }
        }
    }
}
