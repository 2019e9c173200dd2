//! Request/response correlation by opaque request id.
//!
//! A [`Channel`] lets a tool executor fire a request whose answer arrives
//! out-of-band — over a WebSocket callback, from a child agent's completion,
//! or from a human typing a reply — and block on it as if it were a normal
//! call. Exactly one of `{result, error, timeout, cancellation}` resolves any
//! given request; the pending entry is always removed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::cloudllm::errors::{CloudLLMError, Result};

/// Resolution delivered to a waiting `send_request` call.
#[derive(Debug, Clone)]
pub enum ChannelResolution {
    Data(Value),
    Error(String),
}

struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<ChannelResolution>>>,
    counter: AtomicU64,
}

/// The request/response rendezvous primitive.
///
/// Cheaply clonable (`Arc` inside) so a `Toolset`, a `Runner`, and the
/// orchestrator's transport-facing code can all hold a handle to the same
/// pending table.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel {
    pub fn new() -> Self {
        Channel {
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                counter: AtomicU64::new(0),
            }),
        }
    }

    /// Allocate a fresh request id unique to this channel.
    pub fn create_request_id(&self) -> String {
        let n = self.shared.counter.fetch_add(1, Ordering::Relaxed);
        format!("req_{n}")
    }

    /// Send a request and await its resolution.
    ///
    /// `on_send` is invoked with `(tool_name, request_id, parameters)` once
    /// the pending slot is installed, so the caller can forward the request
    /// to its out-of-band destination (a `CLIENT_TOOL_CALL` event, an MCP
    /// call, etc.) without racing a response that arrives before the slot
    /// exists. `request_id` is allocated via [`Channel::create_request_id`]
    /// when not supplied by the caller.
    pub async fn send_request<F, Fut>(
        &self,
        tool_name: &str,
        parameters: Value,
        request_id: Option<String>,
        timeout: Option<Duration>,
        on_send: F,
    ) -> Result<(String, Value)>
    where
        F: FnOnce(String, Value) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let request_id = request_id.unwrap_or_else(|| self.create_request_id());
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(request_id.clone(), tx);

        on_send(request_id.clone(), parameters).await;

        let resolution = match timeout {
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(Ok(resolution)) => Ok(resolution),
                Ok(Err(_canceled)) => Err(CloudLLMError::ChannelCancelled {
                    request_id: request_id.clone(),
                }),
                Err(_elapsed) => {
                    self.shared.pending.lock().await.remove(&request_id);
                    return Err(CloudLLMError::ChannelTimeout {
                        request_id,
                        tool_name: tool_name.to_string(),
                    });
                }
            },
            None => rx.await.map_err(|_canceled| CloudLLMError::ChannelCancelled {
                request_id: request_id.clone(),
            }),
        };

        self.shared.pending.lock().await.remove(&request_id);

        match resolution? {
            ChannelResolution::Data(v) => Ok((request_id, v)),
            ChannelResolution::Error(msg) => Err(CloudLLMError::ToolFailure {
                tool_name: tool_name.to_string(),
                message: msg,
            }),
        }
    }

    /// Resolve a pending request exactly once. A second call, or a call for
    /// an id that has already timed out / been cancelled / never existed, is
    /// silently ignored — the distilled contract allows the response to
    /// arrive late for a request nobody is waiting on anymore.
    pub async fn set_response(&self, request_id: &str, data: Value, error: Option<String>) {
        let sender = self.shared.pending.lock().await.remove(request_id);
        if let Some(sender) = sender {
            let resolution = match error {
                Some(msg) => ChannelResolution::Error(msg),
                None => ChannelResolution::Data(data),
            };
            // Ignore the Err: the receiver side was dropped (e.g. its
            // send_request was cancelled), which is a legal race, not a bug.
            let _ = sender.send(resolution);
        }
    }

    /// True if a request with this id is still awaiting resolution.
    pub async fn is_pending(&self, request_id: &str) -> bool {
        self.shared.pending.lock().await.contains_key(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_with_matching_data() {
        let channel = Channel::new();
        let c2 = channel.clone();
        let responder = tokio::spawn(async move {
            // Give send_request a moment to install the pending slot.
            tokio::time::sleep(Duration::from_millis(5)).await;
            c2.set_response("req_0", serde_json::json!({"ok": true}), None)
                .await;
        });

        let (id, data) = channel
            .send_request(
                "ask_input",
                serde_json::json!({"prompt": "name?"}),
                None,
                None,
                |_id, _params| async {},
            )
            .await
            .unwrap();
        assert_eq!(id, "req_0");
        assert_eq!(data, serde_json::json!({"ok": true}));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn double_set_response_is_a_no_op() {
        let channel = Channel::new();
        let id = channel.create_request_id();
        channel
            .set_response(&id, serde_json::json!(1), None)
            .await;
        // No pending waiter existed at all (nobody called send_request) --
        // this must not panic and must simply do nothing.
        channel.set_response(&id, serde_json::json!(2), None).await;
        assert!(!channel.is_pending(&id).await);
    }

    #[tokio::test]
    async fn timeout_removes_the_pending_slot() {
        let channel = Channel::new();
        let result = channel
            .send_request(
                "slow_tool",
                serde_json::json!({}),
                Some("req_timeout".to_string()),
                Some(Duration::from_millis(10)),
                |_id, _params| async {},
            )
            .await;
        assert!(matches!(result, Err(CloudLLMError::ChannelTimeout { .. })));
        assert!(!channel.is_pending("req_timeout").await);
    }

    #[tokio::test]
    async fn error_resolution_surfaces_as_tool_failure() {
        let channel = Channel::new();
        let c2 = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            c2.set_response("req_err", serde_json::json!(null), Some("boom".into()))
                .await;
        });
        let result = channel
            .send_request(
                "shell",
                serde_json::json!({}),
                Some("req_err".to_string()),
                None,
                |_id, _params| async {},
            )
            .await;
        assert!(matches!(result, Err(CloudLLMError::ToolFailure { .. })));
    }
}
