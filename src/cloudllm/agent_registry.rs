//! Static lookup of agent definitions by name.
//!
//! A [`Runner`](crate::cloudllm::runner::Runner) resolves the named agent
//! it was asked to run through an [`AgentFactory`]; the
//! [`Orchestrator`](crate::cloudllm::orchestrator::Orchestrator) resolves a
//! child agent's definition the same way when a `CLIENT_TOOL_CALL{type:
//! agent}` asks it to spawn one. No dynamic plugin loading: just a
//! name-keyed table the application builds once at startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::cloudllm::client_wrapper::ClientWrapper;
use crate::cloudllm::tool_protocol::{ToolMetadata, ToolProtocol};

/// Everything a [`Runner`](crate::cloudllm::runner::Runner) needs to drive
/// one named agent's step loop: its model, its local tools, the client- and
/// agent-routed tools it may additionally call, and its round budget.
#[derive(Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub client: Arc<dyn ClientWrapper>,
    pub system_prompt: Option<String>,
    pub max_steps: u32,
    /// Mirrors `config.use_share_context`: when `false`, the runner derives
    /// a fresh context id instead of reusing the caller-supplied one.
    pub use_share_context: bool,
    pub tool_timeout: Option<Duration>,
    /// In-process/MCP tools this agent can call directly, function-tool
    /// style. Registered under protocol name `"local"`.
    pub local_protocol: Option<Arc<dyn ToolProtocol>>,
    /// Tools routed out-of-band to the connected client (e.g. `ask_input`).
    pub client_tools: Vec<ToolMetadata>,
    /// Tools that name a sub-agent; calling one spawns a child runner
    /// instead of forwarding externally.
    pub agent_tools: Vec<ToolMetadata>,
    /// Free-form per-agent overrides, including the
    /// `final_answer_context_{upper,lower}_limit` / `_threshold` keys
    /// consulted by [`crate::cloudllm::config::resolve_overflow_limits`].
    pub extra_config: Value,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, client: Arc<dyn ClientWrapper>) -> Self {
        AgentDefinition {
            name: name.into(),
            client,
            system_prompt: None,
            max_steps: 8,
            use_share_context: true,
            tool_timeout: None,
            local_protocol: None,
            client_tools: Vec::new(),
            agent_tools: Vec::new(),
            extra_config: Value::Null,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_fresh_context(mut self) -> Self {
        self.use_share_context = false;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(timeout);
        self
    }

    pub fn with_local_protocol(mut self, protocol: Arc<dyn ToolProtocol>) -> Self {
        self.local_protocol = Some(protocol);
        self
    }

    pub fn with_client_tool(mut self, metadata: ToolMetadata) -> Self {
        self.client_tools.push(metadata);
        self
    }

    pub fn with_agent_tool(mut self, metadata: ToolMetadata) -> Self {
        self.agent_tools.push(metadata);
        self
    }

    pub fn with_extra_config(mut self, extra_config: Value) -> Self {
        self.extra_config = extra_config;
        self
    }

    /// Shallow-merge `overrides` on top of this definition's `extra_config`,
    /// used by the orchestrator's `run(agent_config?)` parameter to tweak a
    /// single invocation (e.g. a tighter context threshold) without touching
    /// the agent's registered defaults.
    pub fn with_extra_config_merged(mut self, overrides: &Value) -> Self {
        self.extra_config = merge_json(self.extra_config, overrides.clone());
        self
    }
}

fn merge_json(base: Value, overrides: Value) -> Value {
    match (base, overrides) {
        (Value::Object(mut base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                base.insert(key, value);
            }
            Value::Object(base)
        }
        (_, overrides) => overrides,
    }
}

/// Resolves a named agent to its [`AgentDefinition`]. Implemented by a
/// simple static table ([`StaticAgentFactory`]) in this crate; applications
/// with a dynamic agent catalog may implement their own.
pub trait AgentFactory: Send + Sync {
    fn resolve(&self, agent_name: &str) -> Option<AgentDefinition>;

    /// List every agent name this factory can resolve, in no particular
    /// order. Used by `GET /agents`-style surfaces and by the orchestrator
    /// to validate an `agent_tools` reference at registration time.
    fn agent_names(&self) -> Vec<String>;
}

/// A fixed, in-memory table of agent definitions, keyed by name.
#[derive(Clone, Default)]
pub struct StaticAgentFactory {
    definitions: HashMap<String, AgentDefinition>,
}

impl StaticAgentFactory {
    pub fn new() -> Self {
        StaticAgentFactory::default()
    }

    pub fn register(mut self, definition: AgentDefinition) -> Self {
        self.definitions.insert(definition.name.clone(), definition);
        self
    }

    pub fn insert(&mut self, definition: AgentDefinition) {
        self.definitions.insert(definition.name.clone(), definition);
    }
}

impl AgentFactory for StaticAgentFactory {
    fn resolve(&self, agent_name: &str) -> Option<AgentDefinition> {
        self.definitions.get(agent_name).cloned()
    }

    fn agent_names(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }
}
