//! Per-session append-only conversation log.
//!
//! Generalizes the conversation-history field that used to live embedded
//! inside `LLMSession` into a standalone, shareable log keyed by session id,
//! so the step loop, the overflow manager, and checkpointing can all observe
//! the same history without owning an `LLMSession`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::cloudllm::client_wrapper::Message;

/// An append-only log of chat messages for one session.
///
/// `add` and `get_all` must agree: `get_all()` always reflects every prior
/// `add()` call from the same session, in insertion order. Implementations
/// must be `Send + Sync` so a `ContextStore` can be shared across the step
/// loop and any background flush task.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Append messages produced by one step-loop round, in order.
    async fn add(&self, session_id: &str, messages: Vec<Message>);

    /// Return a snapshot copy of everything appended for `session_id` so far.
    async fn get_all(&self, session_id: &str) -> Vec<Message>;

    /// Drop all history for a session (used when `use_share_context` is
    /// false and a runner derives a fresh context id).
    async fn clear(&self, session_id: &str);
}

/// In-memory implementation. The default for single-process runs and for
/// tests.
#[derive(Default)]
pub struct InMemoryContextStore {
    sessions: Mutex<HashMap<String, Vec<Message>>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn add(&self, session_id: &str, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .extend(messages);
    }

    async fn get_all(&self, session_id: &str) -> Vec<Message> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn clear(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }
}

/// File-backed implementation with batched write-behind: appended messages
/// accumulate in memory and are flushed to `<dir>/<session_id>.jsonl` once
/// `flush_threshold` messages have queued up, or on an explicit `flush`.
/// `get_all` always answers from the in-memory copy, so readers never
/// observe a torn file.
pub struct FileBackedContextStore {
    dir: PathBuf,
    flush_threshold: usize,
    sessions: Mutex<HashMap<String, Vec<Message>>>,
    unflushed: Mutex<HashMap<String, usize>>,
}

impl FileBackedContextStore {
    pub fn new(dir: impl Into<PathBuf>, flush_threshold: usize) -> Self {
        FileBackedContextStore {
            dir: dir.into(),
            flush_threshold: flush_threshold.max(1),
            sessions: Mutex::new(HashMap::new()),
            unflushed: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    /// Force a flush of any buffered-but-unwritten messages for `session_id`.
    pub async fn flush(&self, session_id: &str) -> std::io::Result<()> {
        let pending = self.unflushed.lock().await.remove(session_id).unwrap_or(0);
        if pending == 0 {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let messages = self.get_all(session_id).await;
        let start = messages.len().saturating_sub(pending);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(session_id))
            .await?;
        for message in &messages[start..] {
            let line = serde_json::json!({
                "role": role_tag(&message.role),
                "content": message.content.as_ref(),
            });
            file.write_all(line.to_string().as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await
    }
}

fn role_tag(role: &crate::cloudllm::client_wrapper::Role) -> &'static str {
    use crate::cloudllm::client_wrapper::Role;
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool { .. } => "tool",
    }
}

#[async_trait]
impl ContextStore for FileBackedContextStore {
    async fn add(&self, session_id: &str, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let added = messages.len();
        {
            let mut sessions = self.sessions.lock().await;
            sessions
                .entry(session_id.to_string())
                .or_default()
                .extend(messages);
        }
        let should_flush = {
            let mut unflushed = self.unflushed.lock().await;
            let counter = unflushed.entry(session_id.to_string()).or_insert(0);
            *counter += added;
            *counter >= self.flush_threshold
        };
        if should_flush {
            if let Err(err) = self.flush(session_id).await {
                log::warn!("@context_store flush failed for {session_id}: {err}");
            }
        }
    }

    async fn get_all(&self, session_id: &str) -> Vec<Message> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn clear(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
        self.unflushed.lock().await.remove(session_id);
    }
}

/// Convenience alias used throughout the step loop and runner: a shared
/// handle to whichever `ContextStore` backend the caller configured.
pub type SharedContextStore = Arc<dyn ContextStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::Role;
    use std::sync::Arc;

    fn msg(role: Role, content: &str) -> Message {
        Message {
            role,
            content: Arc::from(content),
            tool_calls: vec![],
        }
    }

    #[tokio::test]
    async fn in_memory_get_all_reflects_prior_adds_in_order() {
        let store = InMemoryContextStore::new();
        store
            .add("s1", vec![msg(Role::System, "sys"), msg(Role::User, "hi")])
            .await;
        store
            .add("s1", vec![msg(Role::Assistant, "hello")])
            .await;
        let all = store.get_all("s1").await;
        let contents: Vec<&str> = all.iter().map(|m| m.content.as_ref()).collect();
        assert_eq!(contents, vec!["sys", "hi", "hello"]);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let store = InMemoryContextStore::new();
        store.add("a", vec![msg(Role::User, "for a")]).await;
        store.add("b", vec![msg(Role::User, "for b")]).await;
        assert_eq!(store.get_all("a").await.len(), 1);
        assert_eq!(store.get_all("b").await.len(), 1);
        store.clear("a").await;
        assert_eq!(store.get_all("a").await.len(), 0);
        assert_eq!(store.get_all("b").await.len(), 1);
    }

    #[tokio::test]
    async fn file_backed_flushes_after_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileBackedContextStore::new(tmp.path(), 2);
        store.add("s1", vec![msg(Role::User, "one")]).await;
        assert!(!tmp.path().join("s1.jsonl").exists());
        store.add("s1", vec![msg(Role::Assistant, "two")]).await;
        assert!(tmp.path().join("s1.jsonl").exists());
        let written = tokio::fs::read_to_string(tmp.path().join("s1.jsonl"))
            .await
            .unwrap();
        assert_eq!(written.lines().count(), 2);
    }
}
