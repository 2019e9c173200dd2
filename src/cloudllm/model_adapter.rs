//! Translation between the step loop's `Message` world and the wire shapes a
//! `ClientWrapper` actually sends and streams, plus the retry policy every
//! outbound call goes through.
//!
//! Three concerns live here because they all sit at the same seam: (1)
//! pulling `<think>` reasoning back out of a whole or streamed response, (2)
//! wrapping every `send_message`/`send_message_stream` call in the same
//! bounded retry, and (3) bridging a streamed round, whose future is not
//! `Send`, onto a dedicated thread so `StepLoop` can drive it from a
//! `tokio::spawn`ed round loop.
//!
//! `content_block::ContentBlock` is a separate, currently free-standing
//! representation for structured message content; nothing in this crate
//! assembles an outbound `Message` out of a `Vec<ContentBlock>` yet; see
//! `content_block` for the gap.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use regex::Regex;
use tokio::sync::{mpsc, oneshot};

use crate::cloudllm::client_wrapper::{ClientWrapper, Message, NativeToolCall, Role, ToolCallDelta, ToolDefinition};
use crate::cloudllm::errors::{CloudLLMError, Result};

lazy_static::lazy_static! {
    static ref THINK_TAG: Regex = Regex::new(r"(?s)<think>(.*?)</think>").unwrap();
}

/// Maximum outbound attempts before a call is surfaced as
/// [`CloudLLMError::Transient`]. Sleeps between attempts are `2 * attempt`
/// seconds: 2, 4, 6, 8.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

fn backoff_seconds(attempt: u32) -> u64 {
    2 * attempt as u64
}

/// Extracted reasoning and the remainder of the text it was pulled out of.
#[derive(Debug, Clone, Default)]
pub struct ExtractedReasoning {
    pub reasoning: Option<String>,
    pub text: String,
}

/// Pull `<think>...</think>` out of a whole (non-streamed) message body.
/// Used on the "message already arrived in full" path; the streaming path
/// uses [`ThinkTagScanner`] instead, since a regex can't be applied
/// incrementally to a stream of chunks that may split the tag across
/// boundaries.
pub fn extract_reasoning_from_whole(text: &str) -> ExtractedReasoning {
    if let Some(caps) = THINK_TAG.captures(text) {
        let reasoning = caps.get(1).map(|m| m.as_str().to_string());
        let remainder = THINK_TAG.replace(text, "").into_owned();
        ExtractedReasoning { reasoning, text: remainder }
    } else {
        ExtractedReasoning { reasoning: None, text: text.to_string() }
    }
}

/// Incremental `<think>...</think>` extraction for a stream of text chunks,
/// character by character, so a tag split across two chunk boundaries is
/// still recognized. Visible text is buffered separately from reasoning
/// text; callers drain both after each `feed`.
#[derive(Debug, Default)]
pub struct ThinkTagScanner {
    state: ScannerState,
    tag_buf: String,
    visible: String,
    reasoning: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
enum ScannerState {
    #[default]
    Outside,
    MaybeOpen,
    InsideThink,
    MaybeClose,
}

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

impl ThinkTagScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all buffered state; called when a retry restarts a stream from
    /// scratch so a partially matched tag from the failed attempt doesn't
    /// bleed into the retried one.
    pub fn reset(&mut self) {
        *self = ThinkTagScanner::default();
    }

    pub fn feed(&mut self, chunk: &str) {
        for ch in chunk.chars() {
            self.feed_char(ch);
        }
    }

    fn feed_char(&mut self, ch: char) {
        match self.state {
            ScannerState::Outside => {
                if ch == '<' {
                    self.tag_buf.push(ch);
                    self.state = ScannerState::MaybeOpen;
                } else {
                    self.visible.push(ch);
                }
            }
            ScannerState::MaybeOpen => {
                self.tag_buf.push(ch);
                if OPEN_TAG.starts_with(&self.tag_buf) {
                    if self.tag_buf == OPEN_TAG {
                        self.tag_buf.clear();
                        self.state = ScannerState::InsideThink;
                    }
                } else {
                    self.visible.push_str(&self.tag_buf);
                    self.tag_buf.clear();
                    self.state = ScannerState::Outside;
                }
            }
            ScannerState::InsideThink => {
                if ch == '<' {
                    self.tag_buf.push(ch);
                    self.state = ScannerState::MaybeClose;
                } else {
                    self.reasoning.push(ch);
                }
            }
            ScannerState::MaybeClose => {
                self.tag_buf.push(ch);
                if CLOSE_TAG.starts_with(&self.tag_buf) {
                    if self.tag_buf == CLOSE_TAG {
                        self.tag_buf.clear();
                        self.state = ScannerState::Outside;
                    }
                } else {
                    self.reasoning.push_str(&self.tag_buf);
                    self.tag_buf.clear();
                    self.state = ScannerState::InsideThink;
                }
            }
        }
    }

    /// Drain and return everything accumulated so far, leaving the scanner's
    /// match state untouched so a tag split across this drain and the next
    /// `feed` is still recognized.
    pub fn drain(&mut self) -> ExtractedReasoning {
        let text = std::mem::take(&mut self.visible);
        let reasoning = std::mem::take(&mut self.reasoning);
        ExtractedReasoning {
            reasoning: if reasoning.is_empty() { None } else { Some(reasoning) },
            text,
        }
    }
}

/// Convert a tool-result content block into the `Role::Tool` message the
/// wire format expects: the tool's own output text becomes the message
/// content, tagged with the `tool_call_id` it answers.
pub fn tool_result_message(tool_call_id: String, text: String) -> Message {
    Message {
        role: Role::Tool { call_id: tool_call_id },
        content: Arc::from(text.as_str()),
        tool_calls: vec![],
    }
}

/// A boxed error's message, captured as an owned `String` so it can be
/// wrapped in [`CloudLLMError::Transient`] (which requires `Send + Sync`)
/// even when the original `Box<dyn Error>` carried no such guarantee.
#[derive(Debug)]
struct OpaqueError(String);

impl std::fmt::Display for OpaqueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for OpaqueError {}

/// Run `call` up to [`MAX_RETRY_ATTEMPTS`] times with a linear 2s/4s/6s/8s
/// backoff between attempts, surfacing the last error as
/// [`CloudLLMError::Transient`] if every attempt fails.
pub async fn with_retry<T, F, Fut>(mut call: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, Box<dyn std::error::Error>>>,
{
    let mut last_err: Option<String> = None;
    for attempt in 1..=MAX_RETRY_ATTEMPTS {
        match call(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                log::warn!("@model_adapter attempt {attempt}/{MAX_RETRY_ATTEMPTS} failed: {err}");
                last_err = Some(err.to_string());
                if attempt < MAX_RETRY_ATTEMPTS {
                    tokio::time::sleep(Duration::from_secs(backoff_seconds(attempt))).await;
                }
            }
        }
    }
    Err(CloudLLMError::Transient {
        attempts: MAX_RETRY_ATTEMPTS,
        source: Box::new(OpaqueError(
            last_err.unwrap_or_else(|| "retry loop exhausted with no recorded error".to_string()),
        )),
    })
}

/// Send one message turn through a client wrapper with the standard retry
/// policy applied.
pub async fn send_with_retry(
    client: &dyn ClientWrapper,
    messages: &[Message],
    tools: Option<Vec<ToolDefinition>>,
) -> Result<Message> {
    with_retry(|_attempt| {
        let tools = tools.clone();
        async move { client.send_message(messages, tools).await }
    })
    .await
}

/// The outcome of a successfully streamed round: every visible-text delta in
/// arrival order (for `ResponseKind::Stream` emission) plus the accumulated
/// message those deltas merge into.
pub struct StreamedRound {
    pub deltas: Vec<String>,
    pub message: Message,
}

#[derive(Debug, Default, Clone)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Merges a stream of [`ToolCallDelta`]s into complete [`NativeToolCall`]s,
/// keyed by `index`. `id`/`name` are overwritten by the first non-empty value
/// seen for that index (a provider sends them once, on the chunk that
/// introduces the call); `arguments_fragment` pieces are concatenated in
/// arrival order into one JSON string per index. Calls are returned in
/// ascending index order.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    by_index: std::collections::BTreeMap<u32, PartialToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, delta: &ToolCallDelta) {
        let entry = self.by_index.entry(delta.index).or_default();
        if let Some(id) = delta.id.as_ref().filter(|id| !id.is_empty()) {
            entry.id = id.clone();
        }
        if let Some(name) = delta.name.as_ref().filter(|name| !name.is_empty()) {
            entry.name = name.clone();
        }
        if let Some(fragment) = &delta.arguments_fragment {
            entry.arguments.push_str(fragment);
        }
    }

    /// Finalize every accumulated call. A call whose arguments never arrived
    /// gets `{}`; arguments that fail to parse as JSON are carried as a JSON
    /// string rather than dropped.
    pub fn finish(self) -> Vec<NativeToolCall> {
        self.by_index
            .into_values()
            .map(|partial| NativeToolCall {
                id: partial.id,
                name: partial.name,
                arguments: if partial.arguments.is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&partial.arguments)
                        .unwrap_or_else(|_| serde_json::Value::String(partial.arguments))
                },
            })
            .collect()
    }
}

/// Attempt a streamed round through `client.send_message_stream`, retried
/// with the same linear backoff as [`send_with_retry`]. Returns `Ok(None)`
/// when the provider has no streaming support (`send_message_stream`
/// resolving to `Ok(None)`) so the caller can fall back to
/// [`send_with_retry`] -- this crate's streaming clients explicitly treat
/// native tool calling as out of scope for the streamed path, so callers
/// should only reach for this when no tool definitions are being sent.
///
/// A mid-stream error re-subscribes on the next attempt with a freshly reset
/// [`ThinkTagScanner`], per the retry policy's "streaming retries reset the
/// `<think>`-tag state machine before re-subscribing".
pub async fn send_streaming_round(
    client: &dyn ClientWrapper,
    messages: &[Message],
    tools: Option<Vec<ToolDefinition>>,
) -> Result<Option<StreamedRound>> {
    send_streaming_round_with_sink(client, messages, tools, None).await
}

/// Same as [`send_streaming_round`], forwarding each drained visible-text
/// delta to `sink` as it arrives rather than only once the round completes.
/// `sink` is re-sent on every retry attempt, so a caller observes exactly the
/// deltas belonging to the attempt that ultimately succeeded.
async fn send_streaming_round_with_sink(
    client: &dyn ClientWrapper,
    messages: &[Message],
    tools: Option<Vec<ToolDefinition>>,
    sink: Option<&mpsc::UnboundedSender<String>>,
) -> Result<Option<StreamedRound>> {
    let mut scanner = ThinkTagScanner::new();
    let outcome: Option<(Vec<String>, String, Vec<NativeToolCall>)> = with_retry(|_attempt| {
        scanner.reset();
        let tools = tools.clone();
        async {
            match client.send_message_stream(messages, tools).await? {
                None => Ok(None),
                Some(mut stream) => {
                    let mut deltas = Vec::new();
                    let mut visible = String::new();
                    let mut tool_calls = ToolCallAccumulator::new();
                    while let Some(chunk) = stream.next().await {
                        let chunk = chunk?;
                        for delta in &chunk.tool_call_deltas {
                            tool_calls.feed(delta);
                        }
                        if chunk.content.is_empty() {
                            continue;
                        }
                        scanner.feed(&chunk.content);
                        let drained = scanner.drain();
                        if !drained.text.is_empty() {
                            if let Some(sink) = sink {
                                let _ = sink.send(drained.text.clone());
                            }
                            visible.push_str(&drained.text);
                            deltas.push(drained.text);
                        }
                    }
                    Ok(Some((deltas, visible, tool_calls.finish())))
                }
            }
        }
    })
    .await?;

    Ok(outcome.map(|(deltas, visible, tool_calls)| StreamedRound {
        deltas,
        message: Message {
            role: Role::Assistant,
            content: Arc::from(visible.as_str()),
            tool_calls,
        },
    }))
}

/// Drive a streamed round on a dedicated OS thread with its own
/// current-thread runtime.
///
/// `ClientWrapper::send_message_stream` intentionally returns a future that
/// is not bound `Send`, so providers whose SDKs aren't `Send` internally can
/// still implement it. That future can never be held across an await point
/// inside a future that is itself spawned with `tokio::spawn` (as `StepLoop`
/// spawns its round loop). Running it to completion with `block_on` on a
/// thread of its own sidesteps the bound instead of requiring it: `block_on`,
/// unlike `spawn`, has no `Send` requirement on the future it drives.
///
/// Returns a channel of visible-text deltas as they're produced and a
/// one-shot carrying the final [`StreamedRound`] (or `None` if the provider
/// has no streaming support, or the retry budget was exhausted).
pub fn spawn_streaming_round(
    client: Arc<dyn ClientWrapper>,
    messages: Vec<Message>,
    tools: Option<Vec<ToolDefinition>>,
) -> (mpsc::UnboundedReceiver<String>, oneshot::Receiver<Result<Option<StreamedRound>>>) {
    let (delta_tx, delta_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                let _ = done_tx.send(Err(CloudLLMError::FatalStep(format!(
                    "failed to start streaming round runtime: {err}"
                ))));
                return;
            }
        };
        let result = runtime.block_on(send_streaming_round_with_sink(
            client.as_ref(),
            &messages,
            tools,
            Some(&delta_tx),
        ));
        let _ = done_tx.send(result);
    });

    (delta_rx, done_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_reasoning_from_whole_strips_tag() {
        let extracted = extract_reasoning_from_whole("hello <think>plan</think> world");
        assert_eq!(extracted.reasoning.as_deref(), Some("plan"));
        assert_eq!(extracted.text, "hello  world");
    }

    #[test]
    fn extract_reasoning_from_whole_is_noop_without_tag() {
        let extracted = extract_reasoning_from_whole("just text");
        assert!(extracted.reasoning.is_none());
        assert_eq!(extracted.text, "just text");
    }

    #[test]
    fn scanner_recognizes_tag_split_across_feeds() {
        let mut scanner = ThinkTagScanner::new();
        scanner.feed("before <thi");
        scanner.feed("nk>plan");
        scanner.feed("</think> after");
        let drained = scanner.drain();
        assert_eq!(drained.text, "before  after");
        assert_eq!(drained.reasoning.as_deref(), Some("plan"));
    }

    #[test]
    fn scanner_handles_false_alarm_angle_bracket() {
        let mut scanner = ThinkTagScanner::new();
        scanner.feed("a < b <think>x</think>");
        let drained = scanner.drain();
        assert_eq!(drained.text, "a < b ");
        assert_eq!(drained.reasoning.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn with_retry_returns_first_success() {
        let result: Result<u32> = with_retry(|attempt| async move {
            if attempt < 3 {
                Err("not yet".into())
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn with_retry_surfaces_transient_after_exhaustion() {
        let result: Result<u32> = with_retry(|_attempt| async move { Err("always fails".into()) }).await;
        match result {
            Err(CloudLLMError::Transient { attempts, .. }) => assert_eq!(attempts, MAX_RETRY_ATTEMPTS),
            other => panic!("expected Transient error, got {other:?}"),
        }
    }

    struct StreamingClient;

    #[async_trait::async_trait]
    impl ClientWrapper for StreamingClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> std::result::Result<Message, Box<dyn std::error::Error>> {
            unreachable!("this mock only exercises the streaming path")
        }

        fn send_message_stream<'a>(
            &'a self,
            _messages: &'a [Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> crate::cloudllm::client_wrapper::MessageStreamFuture<'a> {
            Box::pin(async {
                let chunks: Vec<std::result::Result<crate::cloudllm::client_wrapper::MessageChunk, Box<dyn std::error::Error>>> = vec![
                    Ok(crate::cloudllm::client_wrapper::MessageChunk {
                        content: "before <thi".to_string(),
                        tool_call_deltas: vec![],
                        finish_reason: None,
                    }),
                    Ok(crate::cloudllm::client_wrapper::MessageChunk {
                        content: "nk>plan</think> after".to_string(),
                        tool_call_deltas: vec![],
                        finish_reason: Some("stop".to_string()),
                    }),
                ];
                Ok(Some(Box::pin(futures_util::stream::iter(chunks)) as crate::cloudllm::client_wrapper::MessageChunkStream))
            })
        }

        fn model_name(&self) -> &str {
            "streaming-mock"
        }
    }

    struct NonStreamingClient;

    #[async_trait::async_trait]
    impl ClientWrapper for NonStreamingClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> std::result::Result<Message, Box<dyn std::error::Error>> {
            Ok(Message { role: Role::Assistant, content: Arc::from("whole reply"), tool_calls: vec![] })
        }

        fn model_name(&self) -> &str {
            "non-streaming-mock"
        }
    }

    #[tokio::test]
    async fn streaming_round_accumulates_deltas_and_strips_think_tags_split_across_chunks() {
        let round = send_streaming_round(&StreamingClient, &[], None)
            .await
            .unwrap()
            .expect("provider advertises streaming support");
        assert_eq!(round.deltas.join(""), "before  after");
        assert_eq!(round.message.content.as_ref(), "before  after");
    }

    #[tokio::test]
    async fn streaming_round_is_none_when_provider_has_no_streaming_support() {
        let round = send_streaming_round(&NonStreamingClient, &[], None).await.unwrap();
        assert!(round.is_none());
    }

    #[test]
    fn tool_call_accumulator_merges_multi_chunk_calls_by_index() {
        let mut acc = ToolCallAccumulator::new();
        // call 0's id/name arrive on the first chunk, arguments split over three.
        acc.feed(&ToolCallDelta {
            index: 0,
            id: Some("call_1".to_string()),
            name: Some("calculator".to_string()),
            arguments_fragment: Some("{\"expr".to_string()),
        });
        // call 1 interleaves in the same chunk stream.
        acc.feed(&ToolCallDelta {
            index: 1,
            id: Some("call_2".to_string()),
            name: Some("lookup".to_string()),
            arguments_fragment: Some("{\"q".to_string()),
        });
        acc.feed(&ToolCallDelta {
            index: 0,
            id: None,
            name: None,
            arguments_fragment: Some("ession\":".to_string()),
        });
        acc.feed(&ToolCallDelta {
            index: 1,
            id: None,
            name: None,
            arguments_fragment: Some("uery\":\"rust\"}".to_string()),
        });
        acc.feed(&ToolCallDelta {
            index: 0,
            id: None,
            name: None,
            arguments_fragment: Some("\"2+2\"}".to_string()),
        });

        let calls = acc.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "calculator");
        assert_eq!(calls[0].arguments, serde_json::json!({"expression": "2+2"}));
        assert_eq!(calls[1].id, "call_2");
        assert_eq!(calls[1].name, "lookup");
        assert_eq!(calls[1].arguments, serde_json::json!({"query": "rust"}));
    }

    #[test]
    fn tool_call_accumulator_defaults_missing_arguments_to_empty_object() {
        let mut acc = ToolCallAccumulator::new();
        acc.feed(&ToolCallDelta {
            index: 0,
            id: Some("call_1".to_string()),
            name: Some("noop".to_string()),
            arguments_fragment: None,
        });
        let calls = acc.finish();
        assert_eq!(calls[0].arguments, serde_json::json!({}));
    }

    struct ToolCallStreamingClient;

    #[async_trait::async_trait]
    impl ClientWrapper for ToolCallStreamingClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> std::result::Result<Message, Box<dyn std::error::Error>> {
            unreachable!("this mock only exercises the streaming path")
        }

        fn send_message_stream<'a>(
            &'a self,
            _messages: &'a [Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> crate::cloudllm::client_wrapper::MessageStreamFuture<'a> {
            Box::pin(async {
                let chunks: Vec<
                    std::result::Result<crate::cloudllm::client_wrapper::MessageChunk, Box<dyn std::error::Error>>,
                > = vec![
                    Ok(crate::cloudllm::client_wrapper::MessageChunk {
                        content: String::new(),
                        tool_call_deltas: vec![ToolCallDelta {
                            index: 0,
                            id: Some("call_1".to_string()),
                            name: Some("calculator".to_string()),
                            arguments_fragment: Some("{\"expression\":".to_string()),
                        }],
                        finish_reason: None,
                    }),
                    Ok(crate::cloudllm::client_wrapper::MessageChunk {
                        content: String::new(),
                        tool_call_deltas: vec![ToolCallDelta {
                            index: 0,
                            id: None,
                            name: None,
                            arguments_fragment: Some("\"2+2\"}".to_string()),
                        }],
                        finish_reason: Some("tool_calls".to_string()),
                    }),
                ];
                Ok(Some(Box::pin(futures_util::stream::iter(chunks))
                    as crate::cloudllm::client_wrapper::MessageChunkStream))
            })
        }

        fn model_name(&self) -> &str {
            "tool-call-streaming-mock"
        }
    }

    #[tokio::test]
    async fn streaming_round_merges_tool_call_deltas_from_separate_chunks() {
        let round = send_streaming_round(&ToolCallStreamingClient, &[], None)
            .await
            .unwrap()
            .expect("provider advertises streaming support");
        assert_eq!(round.message.tool_calls.len(), 1);
        assert_eq!(round.message.tool_calls[0].id, "call_1");
        assert_eq!(round.message.tool_calls[0].name, "calculator");
        assert_eq!(round.message.tool_calls[0].arguments, serde_json::json!({"expression": "2+2"}));
    }
}
