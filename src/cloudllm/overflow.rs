//! Two-threshold hysteresis context overflow manager.
//!
//! Applied to a *working copy* of the model input the step loop is about to
//! send — never to the persisted `ContextStore`. Compresses or evicts tool
//! output between a lower and upper token bound and, as a last resort,
//! activates "force final answer" mode: a prompt appended to the model input
//! only, telling the model to stop using tools and answer with what it has.

use std::sync::Arc;

use crate::cloudllm::client_wrapper::{Message, Role};

/// Estimates the token cost of a message. The default fallback divides the
/// serialized length by 3; callers wire in a real BPE-style encoder by
/// implementing this trait over their tokenizer of choice.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, message: &Message) -> usize;
}

/// `len(serialized) / 3`, rounded up, minimum 1. Used when no BPE-style
/// encoder is configured.
pub struct ApproximateTokenEstimator;

impl TokenEstimator for ApproximateTokenEstimator {
    fn estimate(&self, message: &Message) -> usize {
        let serialized = serialize_for_estimate(message);
        (serialized.len() / 3).max(1)
    }
}

fn serialize_for_estimate(message: &Message) -> String {
    format!("{}{}", role_discriminant(&message.role), message.content)
}

fn role_discriminant(role: &Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool { .. } => "tool",
    }
}

fn total_tokens(estimator: &dyn TokenEstimator, messages: &[Message]) -> usize {
    messages.iter().map(|m| estimator.estimate(m)).sum()
}

/// Configuration for the overflow manager. `lower_limit` is auto-repaired to
/// `1 ≤ lower < upper` if misconfigured, matching the contract's "auto-repaired
/// if the user sets them incorrectly".
#[derive(Debug, Clone)]
pub struct OverflowConfig {
    pub upper_limit: usize,
    pub lower_limit: usize,
    pub final_answer_prompt: String,
}

impl Default for OverflowConfig {
    fn default() -> Self {
        let upper_limit = 100_000;
        OverflowConfig {
            upper_limit,
            lower_limit: (upper_limit as f64 * 0.9) as usize,
            final_answer_prompt: DEFAULT_FINAL_ANSWER_PROMPT.to_string(),
        }
    }
}

pub const DEFAULT_FINAL_ANSWER_PROMPT: &str =
    "Stop using tools. Based on everything gathered so far, give your best answer now in the form: \
     <think>...</think><answer>...</answer>";

impl OverflowConfig {
    pub fn new(upper_limit: usize, lower_limit: usize, final_answer_prompt: impl Into<String>) -> Self {
        let mut cfg = OverflowConfig {
            upper_limit,
            lower_limit,
            final_answer_prompt: final_answer_prompt.into(),
        };
        cfg.repair();
        cfg
    }

    fn repair(&mut self) {
        if self.lower_limit < 1 || self.lower_limit >= self.upper_limit {
            self.lower_limit = ((self.upper_limit as f64) * 0.9) as usize;
            self.lower_limit = self.lower_limit.max(1);
        }
    }
}

const BATCH_OPEN: &str = "<batch_search_results>";
const BATCH_CLOSE: &str = "</batch_search_results>";
const BATCH_COMPRESSED_OPEN: &str = "<batch_search_results_compressed>";

/// Holds the per-task compression state that must persist across overflow
/// invocations within a single step loop: once a message has been
/// compressed it is never revisited, and once force-final-answer activates
/// it stays active for the remainder of the task.
#[derive(Debug, Default, Clone)]
pub struct OverflowState {
    compressed_message_ids: Vec<usize>,
    pub force_final_answer: bool,
}

/// Outcome of running the overflow policy once.
pub struct OverflowOutcome {
    pub messages: Vec<Message>,
    pub final_answer_activated_this_round: bool,
}

/// The overflow manager itself. Stateless except for the caller-supplied
/// [`OverflowState`], which callers (the step loop) thread through
/// successive rounds of the same task.
pub struct OverflowManager {
    pub config: OverflowConfig,
    pub estimator: Arc<dyn TokenEstimator>,
}

impl OverflowManager {
    pub fn new(config: OverflowConfig) -> Self {
        OverflowManager {
            config,
            estimator: Arc::new(ApproximateTokenEstimator),
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Apply the policy to a working copy of the model input. `state` is
    /// mutated in place to track compressed messages and whether
    /// force-final-answer has activated; the returned message list is what
    /// the model adapter should actually send, with the final-answer prompt
    /// appended as a trailing system message when active. None of this ever
    /// touches the persisted `ContextStore`.
    pub fn apply(&self, input: &[Message], state: &mut OverflowState) -> OverflowOutcome {
        let mut messages = input.to_vec();
        let mut activated_this_round = false;

        let tokens = total_tokens(self.estimator.as_ref(), &messages);
        if tokens < self.config.upper_limit {
            return self.finish(messages, state, activated_this_round);
        }

        // Step 2: compress/evict down toward lower_limit.
        loop {
            let tokens = total_tokens(self.estimator.as_ref(), &messages);
            if tokens < self.config.lower_limit {
                break;
            }

            if self.compress_earliest_batch_search(&mut messages, state) {
                continue;
            }

            if self.evict_earliest_search_tool_cycle(&mut messages) {
                continue;
            }

            if !state.force_final_answer {
                state.force_final_answer = true;
                activated_this_round = true;
            }
            break;
        }

        // Step 3: regardless of whether final-answer activated, enforce the
        // upper bound unconditionally.
        loop {
            let tokens = total_tokens(self.estimator.as_ref(), &messages);
            if tokens <= self.config.upper_limit {
                break;
            }
            if self.evict_earliest_tool_cycle(&mut messages) {
                continue;
            }
            if !self.evict_earliest_non_system_message(&mut messages) {
                break; // nothing left to evict; give up, system messages are sacrosanct
            }
        }

        self.finish(messages, state, activated_this_round)
    }

    fn finish(
        &self,
        mut messages: Vec<Message>,
        state: &OverflowState,
        activated_this_round: bool,
    ) -> OverflowOutcome {
        if state.force_final_answer {
            messages.push(Message {
                role: Role::System,
                content: Arc::from(self.config.final_answer_prompt.as_str()),
                tool_calls: vec![],
            });
        }
        OverflowOutcome {
            messages,
            final_answer_activated_this_round: activated_this_round,
        }
    }

    /// Find the earliest not-yet-compressed `<batch_search_results>` wrapper
    /// (in any message's content) and strip its inner `<content>...</content>`
    /// regions, renaming the wrapper to the compressed form. Returns whether
    /// a compression was performed.
    fn compress_earliest_batch_search(
        &self,
        messages: &mut [Message],
        state: &mut OverflowState,
    ) -> bool {
        for (idx, message) in messages.iter_mut().enumerate() {
            if state.compressed_message_ids.contains(&idx) {
                continue;
            }
            if !message.content.contains(BATCH_OPEN) {
                continue;
            }
            let compressed = compress_batch_search_wrapper(&message.content);
            message.content = Arc::from(compressed.as_str());
            state.compressed_message_ids.push(idx);
            return true;
        }
        false
    }

    /// Drop the earliest assistant tool-call message whose call is
    /// search-related (name contains "search", or `batch_web_surfer` with
    /// `action = batch_search`), together with every tool-result message
    /// sharing a `tool_call_id` with one of its calls.
    fn evict_earliest_search_tool_cycle(&self, messages: &mut Vec<Message>) -> bool {
        self.evict_earliest_tool_cycle_matching(messages, is_search_related_call)
    }

    /// Drop the earliest assistant tool-call message of any kind, together
    /// with its matching tool-result message(s). Used unconditionally in
    /// step 3.
    fn evict_earliest_tool_cycle(&self, messages: &mut Vec<Message>) -> bool {
        self.evict_earliest_tool_cycle_matching(messages, |_| true)
    }

    fn evict_earliest_tool_cycle_matching(
        &self,
        messages: &mut Vec<Message>,
        matches: impl Fn(&str) -> bool,
    ) -> bool {
        let victim_idx = messages.iter().position(|m| {
            matches!(m.role, Role::Assistant)
                && m.tool_calls
                    .iter()
                    .any(|tc| matches(&tc.name))
        });
        let Some(victim_idx) = victim_idx else {
            return false;
        };
        let call_ids: Vec<String> = messages[victim_idx]
            .tool_calls
            .iter()
            .map(|tc| tc.id.clone())
            .collect();
        messages.remove(victim_idx);
        messages.retain(|m| match &m.role {
            Role::Tool { call_id } => !call_ids.contains(call_id),
            _ => true,
        });
        true
    }

    /// Drop the earliest non-system message, one at a time, as the absolute
    /// last resort in step 3.
    fn evict_earliest_non_system_message(&self, messages: &mut Vec<Message>) -> bool {
        let idx = messages.iter().position(|m| !matches!(m.role, Role::System));
        match idx {
            Some(idx) => {
                messages.remove(idx);
                true
            }
            None => false,
        }
    }
}

fn is_search_related_call(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("search") || lower == "batch_web_surfer"
}

/// Strip `<content>...</content>` regions nested inside a
/// `<batch_search_results>...</batch_search_results>` wrapper and rename the
/// wrapper tag. Operates textually (not via an XML parser) to match the
/// "either a plain string or a text content block nested arbitrarily deep"
/// contract without depending on the exact shape of surrounding content.
fn compress_batch_search_wrapper(original: &str) -> String {
    let Some(open_at) = original.find(BATCH_OPEN) else {
        return original.to_string();
    };
    let search_from = open_at + BATCH_OPEN.len();
    let Some(close_rel) = original[search_from..].find(BATCH_CLOSE) else {
        return original.to_string();
    };
    let close_at = search_from + close_rel;
    let inner = &original[search_from..close_at];
    let stripped_inner = strip_content_tags(inner);

    let mut out = String::with_capacity(original.len());
    out.push_str(&original[..open_at]);
    out.push_str(BATCH_COMPRESSED_OPEN);
    out.push_str(&stripped_inner);
    out.push_str("</batch_search_results_compressed>");
    out.push_str(&original[close_at + BATCH_CLOSE.len()..]);
    out
}

fn strip_content_tags(inner: &str) -> String {
    const OPEN: &str = "<content>";
    const CLOSE: &str = "</content>";
    let mut out = String::with_capacity(inner.len());
    let mut rest = inner;
    loop {
        match rest.find(OPEN) {
            Some(start) => {
                out.push_str(&rest[..start]);
                let after_open = &rest[start + OPEN.len()..];
                match after_open.find(CLOSE) {
                    Some(end) => {
                        out.push_str(OPEN);
                        out.push_str(CLOSE);
                        rest = &after_open[end + CLOSE.len()..];
                    }
                    None => {
                        // unterminated; keep the rest verbatim
                        out.push_str(OPEN);
                        out.push_str(after_open);
                        break;
                    }
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out
}
