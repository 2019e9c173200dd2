//! The ReAct round loop: call the model, dispatch any tool calls it asked
//! for, feed the results back, repeat until a tool-call-free message, the
//! step budget is exhausted, or an unrecoverable error occurs.
//!
//! Each round works against a private, deep-copied snapshot of the
//! persisted context — the overflow policy from [`overflow`](crate::cloudllm::overflow)
//! only ever edits that snapshot, never the [`ContextStore`](crate::cloudllm::context_store::ContextStore)
//! itself — and only complete, non-streamed messages with a settled role
//! are appended back to the store.
//!
//! A round with no tool definitions on offer tries
//! [`model_adapter::spawn_streaming_round`] first, surfacing each delta as an
//! `AgentResponse::stream` before the round's final message is persisted and
//! surfaced as `AgentResponse::accumulated`/`finished` like any other round.
//! A round with tools on offer always goes through `send_with_retry`, since
//! streaming with native tool calling is out of scope.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cloudllm::client_wrapper::{ClientWrapper, Message, ToolDefinition};
use crate::cloudllm::context_store::SharedContextStore;
use crate::cloudllm::merger::BoxStream;
use crate::cloudllm::model_adapter;
use crate::cloudllm::overflow::{OverflowManager, OverflowState};
use crate::cloudllm::task_event::AgentResponse;
use crate::cloudllm::tool_protocol::ToolRegistry;
use crate::cloudllm::tracing_contract::{self, SharedSpanSink};

/// Tunables for one run of the loop.
#[derive(Debug, Clone)]
pub struct StepLoopConfig {
    pub agent_name: String,
    /// Hard round budget. Exceeding it surfaces an `AgentResponse::stopped`,
    /// distinct from `finished` (tool-call-free) and `error` (exception).
    pub max_steps: u32,
    /// How long a single tool dispatch may run before it's treated as a
    /// failed call whose error text is fed back to the model.
    pub tool_timeout: Option<Duration>,
}

impl Default for StepLoopConfig {
    fn default() -> Self {
        StepLoopConfig {
            agent_name: "agent".to_string(),
            max_steps: 8,
            tool_timeout: None,
        }
    }
}

fn empty_message() -> Message {
    Message {
        role: crate::cloudllm::client_wrapper::Role::Assistant,
        content: Arc::from(""),
        tool_calls: vec![],
    }
}

/// Owns the collaborators one task needs to run its ReAct loop: the model,
/// the tools it may call, the store its history persists to, and the
/// overflow policy applied to what actually gets sent.
pub struct StepLoop {
    client: Arc<dyn ClientWrapper>,
    tools: Arc<ToolRegistry>,
    context_store: SharedContextStore,
    overflow: OverflowManager,
    sink: SharedSpanSink,
}

impl StepLoop {
    pub fn new(
        client: Arc<dyn ClientWrapper>,
        tools: Arc<ToolRegistry>,
        context_store: SharedContextStore,
        overflow: OverflowManager,
    ) -> Self {
        StepLoop {
            client,
            tools,
            context_store,
            overflow,
            sink: tracing_contract::default_span_sink(),
        }
    }

    pub fn with_span_sink(mut self, sink: SharedSpanSink) -> Self {
        self.sink = sink;
        self
    }

    /// Attempt a streamed round, forwarding each visible-text delta to `tx`
    /// as an `AgentResponse::stream` as it arrives. Returns `None` when the
    /// provider has no streaming support, so the caller falls back to
    /// `model_adapter::send_with_retry`.
    async fn drive_streaming_round(
        &self,
        messages: &[Message],
        step_index: u32,
        tx: &mpsc::Sender<AgentResponse>,
    ) -> Option<crate::cloudllm::errors::Result<Message>> {
        let (mut deltas, done) = model_adapter::spawn_streaming_round(self.client.clone(), messages.to_vec(), None);
        while let Some(delta) = deltas.recv().await {
            let chunk = Message {
                role: crate::cloudllm::client_wrapper::Role::Assistant,
                content: Arc::from(delta.as_str()),
                tool_calls: vec![],
            };
            if tx.send(AgentResponse::stream(chunk, step_index)).await.is_err() {
                break;
            }
        }
        match done.await {
            Ok(Ok(Some(round))) => Some(Ok(round.message)),
            Ok(Ok(None)) => None,
            Ok(Err(err)) => Some(Err(err)),
            Err(_recv_err) => Some(Err(crate::cloudllm::errors::CloudLLMError::FatalStep(
                "streaming round worker thread terminated without a result".to_string(),
            ))),
        }
    }

    fn tool_definitions(&self) -> Option<Vec<ToolDefinition>> {
        let metadata = self.tools.list_tools();
        if metadata.is_empty() {
            return None;
        }
        Some(metadata.into_iter().map(|meta| meta.to_tool_definition()).collect())
    }

    /// Run the loop for `session_id`, returning a stream of [`AgentResponse`]s.
    /// The returned stream ends once a terminal response (`finished`,
    /// `stopped`, or `error`) has been emitted.
    pub fn run(self: Arc<Self>, session_id: String, config: StepLoopConfig) -> BoxStream<AgentResponse> {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            self.drive(session_id, config, tx).await;
        });
        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    async fn drive(&self, session_id: String, config: StepLoopConfig, tx: mpsc::Sender<AgentResponse>) {
        let mut overflow_state = OverflowState::default();
        let mut step_index: u32 = 0;

        loop {
            if step_index >= config.max_steps {
                let _ = tx.send(AgentResponse::stopped(empty_message(), step_index)).await;
                return;
            }

            let snapshot = self.context_store.get_all(&session_id).await;
            let outcome = self.overflow.apply(&snapshot, &mut overflow_state);

            let mut span = tracing_contract::start_span(
                session_id.clone(),
                format!("@{} Round {}/{}", config.agent_name, step_index + 1, config.max_steps),
                self.sink.clone(),
            );

            let tool_defs = self.tool_definitions();

            // Streaming with native tool calling is out of scope (see
            // `ClientWrapper::send_message_stream`), so a round with tools on
            // offer always goes through the non-streaming path. A tool-free
            // round tries streaming first and falls back to
            // `send_with_retry` when the provider has no streaming support.
            let send_result = if tool_defs.is_none() {
                self.drive_streaming_round(&outcome.messages, step_index, &tx).await
            } else {
                None
            };
            let send_result = match send_result {
                Some(result) => result,
                None => model_adapter::send_with_retry(self.client.as_ref(), &outcome.messages, tool_defs).await,
            };

            let message = match send_result {
                Ok(message) => message,
                Err(err) => {
                    span.finish_with_error(err.to_string());
                    let _ = tx.send(AgentResponse::error(err.to_string(), step_index)).await;
                    return;
                }
            };

            self.context_store.add(&session_id, vec![message.clone()]).await;

            if message.tool_calls.is_empty() {
                span.finish();
                let _ = tx.send(AgentResponse::finished(message, step_index)).await;
                return;
            }

            // The assistant's tool-call-bearing message is a complete,
            // non-stream response in its own right -- surfaced before the
            // tool dispatch below so a client observes the call the model
            // made, not just its eventual results.
            if tx.send(AgentResponse::accumulated(message.clone(), step_index)).await.is_err() {
                span.finish();
                return;
            }

            span.record_event(
                "tool_calls_dispatched",
                serde_json::json!({"count": message.tool_calls.len()}),
            );

            let dispatches = message.tool_calls.iter().map(|call| {
                let tools = self.tools.clone();
                let name = call.name.clone();
                let id = call.id.clone();
                let arguments = call.arguments.clone();
                let timeout = config.tool_timeout;
                async move {
                    let exec = match timeout {
                        Some(d) => tokio::time::timeout(d, tools.execute_tool(&name, arguments))
                            .await
                            .unwrap_or_else(|_elapsed| Err(format!("tool '{name}' timed out").into())),
                        None => tools.execute_tool(&name, arguments).await,
                    };
                    let text = match exec {
                        Ok(result) if result.success => result.output.to_string(),
                        Ok(result) => result.error.unwrap_or_else(|| "tool failed".to_string()),
                        Err(err) => err.to_string(),
                    };
                    model_adapter::tool_result_message(id, text)
                }
            });

            let tool_messages: Vec<Message> = futures_util::future::join_all(dispatches).await;
            self.context_store.add(&session_id, tool_messages.clone()).await;
            for tool_message in tool_messages {
                if tx.send(AgentResponse::accumulated(tool_message, step_index)).await.is_err() {
                    span.finish();
                    return;
                }
            }

            span.finish();
            step_index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::{NativeToolCall, Role};
    use crate::cloudllm::context_store::InMemoryContextStore;
    use crate::cloudllm::overflow::OverflowConfig;
    use crate::cloudllm::tool_protocol::{ToolMetadata, ToolResult};
    use crate::cloudllm::tool_protocols::CustomToolProtocol;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct ScriptedClient {
        turns: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl ClientWrapper for ScriptedClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error>> {
            let mut turns = self.turns.lock().await;
            if turns.is_empty() {
                return Err("no more scripted turns".into());
            }
            Ok(turns.remove(0))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn assistant_text(text: &str) -> Message {
        Message { role: Role::Assistant, content: Arc::from(text), tool_calls: vec![] }
    }

    fn assistant_tool_call(name: &str, call_id: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: Arc::from(""),
            tool_calls: vec![NativeToolCall {
                id: call_id.to_string(),
                name: name.to_string(),
                arguments: serde_json::json!({}),
            }],
        }
    }

    async fn empty_registry() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::new(Arc::new(CustomToolProtocol::new())))
    }

    #[tokio::test]
    async fn finishes_immediately_on_tool_call_free_message() {
        let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient {
            turns: Mutex::new(vec![assistant_text("final answer")]),
        });
        let context_store: SharedContextStore = Arc::new(InMemoryContextStore::new());
        let overflow = OverflowManager::new(OverflowConfig::default());
        let step_loop = Arc::new(StepLoop::new(client, empty_registry().await, context_store.clone(), overflow));

        let mut stream = step_loop.run("s1".to_string(), StepLoopConfig::default());
        let response = stream.next().await.unwrap();
        assert_eq!(response.status, crate::cloudllm::task_event::RunStatus::Finished);
        assert_eq!(response.message.content.as_ref(), "final answer");
        assert!(stream.next().await.is_none());

        let persisted = context_store.get_all("s1").await;
        assert_eq!(persisted.len(), 1);
    }

    #[tokio::test]
    async fn stops_after_exhausting_max_steps() {
        let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient {
            turns: Mutex::new(vec![
                assistant_tool_call("noop", "c1"),
                assistant_tool_call("noop", "c2"),
            ]),
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let protocol = Arc::new(CustomToolProtocol::new());
        let calls_for_tool = calls.clone();
        protocol
            .register_tool(
                ToolMetadata::new("noop", "does nothing"),
                Arc::new(move |_params| {
                    calls_for_tool.fetch_add(1, Ordering::SeqCst);
                    Ok(ToolResult::success(serde_json::json!({"ok": true})))
                }),
            )
            .await;
        let mut registry = ToolRegistry::new(protocol);
        registry.discover_tools_from_primary().await.unwrap();
        let registry = Arc::new(registry);

        let context_store: SharedContextStore = Arc::new(InMemoryContextStore::new());
        let overflow = OverflowManager::new(OverflowConfig::default());
        let step_loop = Arc::new(StepLoop::new(client, registry, context_store, overflow));

        let config = StepLoopConfig { agent_name: "a".to_string(), max_steps: 2, tool_timeout: None };
        let mut stream = step_loop.run("s2".to_string(), config);

        let mut last_status = None;
        while let Some(response) = stream.next().await {
            last_status = Some(response.status.clone());
        }
        assert_eq!(last_status, Some(crate::cloudllm::task_event::RunStatus::Stopped));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tool_call_round_is_surfaced_before_the_tool_results_it_produced() {
        let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient {
            turns: Mutex::new(vec![assistant_tool_call("noop", "c1"), assistant_text("done")]),
        });
        let protocol = Arc::new(CustomToolProtocol::new());
        protocol
            .register_tool(
                ToolMetadata::new("noop", "does nothing"),
                Arc::new(|_params| Ok(ToolResult::success(serde_json::json!({"ok": true})))),
            )
            .await;
        let mut registry = ToolRegistry::new(protocol);
        registry.discover_tools_from_primary().await.unwrap();
        let registry = Arc::new(registry);

        let context_store: SharedContextStore = Arc::new(InMemoryContextStore::new());
        let overflow = OverflowManager::new(OverflowConfig::default());
        let step_loop = Arc::new(StepLoop::new(client, registry, context_store, overflow));

        let mut stream = step_loop.run("s3".to_string(), StepLoopConfig::default());
        let responses: Vec<_> = {
            let mut out = Vec::new();
            while let Some(r) = stream.next().await {
                out.push(r);
            }
            out
        };

        assert!(!responses[0].message.tool_calls.is_empty(), "the tool-call round must be surfaced first");
        assert!(matches!(responses[1].message.role, Role::Tool { .. }), "then the tool result");
        assert_eq!(responses.last().unwrap().status, crate::cloudllm::task_event::RunStatus::Finished);
    }

    struct StreamingOnlyClient;

    #[async_trait]
    impl ClientWrapper for StreamingOnlyClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error>> {
            unreachable!("a tool-free round must prefer the streaming path")
        }

        fn send_message_stream<'a>(
            &'a self,
            _messages: &'a [Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> crate::cloudllm::client_wrapper::MessageStreamFuture<'a> {
            Box::pin(async {
                let chunks: Vec<
                    Result<crate::cloudllm::client_wrapper::MessageChunk, Box<dyn std::error::Error>>,
                > = vec![
                    Ok(crate::cloudllm::client_wrapper::MessageChunk {
                        content: "hello ".to_string(),
                        tool_call_deltas: vec![],
                        finish_reason: None,
                    }),
                    Ok(crate::cloudllm::client_wrapper::MessageChunk {
                        content: "world".to_string(),
                        tool_call_deltas: vec![],
                        finish_reason: Some("stop".to_string()),
                    }),
                ];
                Ok(Some(Box::pin(futures_util::stream::iter(chunks))
                    as crate::cloudllm::client_wrapper::MessageChunkStream))
            })
        }

        fn model_name(&self) -> &str {
            "streaming-only"
        }
    }

    #[tokio::test]
    async fn tool_free_round_streams_deltas_before_the_final_message() {
        let client: Arc<dyn ClientWrapper> = Arc::new(StreamingOnlyClient);
        let context_store: SharedContextStore = Arc::new(InMemoryContextStore::new());
        let overflow = OverflowManager::new(OverflowConfig::default());
        let step_loop = Arc::new(StepLoop::new(client, empty_registry().await, context_store, overflow));

        let mut stream = step_loop.run("s4".to_string(), StepLoopConfig::default());
        let responses: Vec<_> = {
            let mut out = Vec::new();
            while let Some(r) = stream.next().await {
                out.push(r);
            }
            out
        };

        let deltas: Vec<&str> = responses
            .iter()
            .filter(|r| r.kind == crate::cloudllm::task_event::ResponseKind::Stream)
            .map(|r| r.message.content.as_ref())
            .collect();
        assert_eq!(deltas, vec!["hello ", "world"]);
        let last = responses.last().unwrap();
        assert_eq!(last.status, crate::cloudllm::task_event::RunStatus::Finished);
        assert_eq!(last.message.content.as_ref(), "hello world");
    }
}
