//! 通道注册表：agent → 句柄
//!
//! 与通道丢失通知共享：丢失事件可能与编排器的查询并发到达。
//! 查询要么返回当前登记的句柄，要么明确返回 None，绝不返回已被注销的旧句柄。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::channel::{ChannelAdapter, ChannelError, ChannelHandle, ChannelLost};
use crate::core::AgentId;

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    entries: RwLock<HashMap<AgentId, ChannelHandle>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lookup(&self, agent_id: &str) -> Option<ChannelHandle> {
        self.entries.read().await.get(agent_id).cloned()
    }

    pub async fn register(&self, handle: ChannelHandle) {
        tracing::debug!(agent = %handle.agent_id, handle = %handle.id, "channel registered");
        self.entries
            .write()
            .await
            .insert(handle.agent_id.clone(), handle);
    }

    /// 注销某个 Agent 的通道，返回被移除的句柄
    pub async fn remove(&self, agent_id: &str) -> Option<ChannelHandle> {
        self.entries.write().await.remove(agent_id)
    }

    /// 处理通道丢失通知；带句柄 id 时只在仍是同一句柄时移除，避免误删新建的通道
    pub async fn handle_loss(&self, lost: &ChannelLost) -> bool {
        let mut entries = self.entries.write().await;
        let matches = match (entries.get(&lost.agent_id), &lost.handle) {
            (Some(current), Some(id)) => &current.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            entries.remove(&lost.agent_id);
            tracing::info!(agent = %lost.agent_id, "unregistered lost channel");
        }
        matches
    }

    pub async fn agents(&self) -> Vec<AgentId> {
        let mut ids: Vec<_> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 获取通道：已登记且仍存活则复用；失效则注销后新建并登记
    pub async fn acquire(
        &self,
        adapter: &dyn ChannelAdapter,
        agent_id: &str,
    ) -> Result<ChannelHandle, ChannelError> {
        if let Some(existing) = self.lookup(agent_id).await {
            if adapter.is_alive(&existing).await {
                tracing::debug!(agent = %agent_id, handle = %existing.id, "reusing channel");
                return Ok(existing);
            }
            tracing::info!(agent = %agent_id, handle = %existing.id, "registered channel is no longer valid, discarding");
            self.handle_loss(&ChannelLost {
                agent_id: agent_id.to_string(),
                handle: Some(existing.id),
            })
            .await;
        }

        tracing::info!(agent = %agent_id, "opening channel");
        let handle = adapter.ensure_channel(agent_id).await?;
        self.register(handle.clone()).await;
        Ok(handle)
    }

    /// 在后台消费通道丢失通知，直到发送端全部关闭
    pub fn spawn_loss_listener(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ChannelLost>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(lost) = rx.recv().await {
                registry.handle_loss(&lost).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ScriptedAdapter;

    #[tokio::test]
    async fn test_loss_with_stale_handle_keeps_new_entry() {
        let reg = ChannelRegistry::new();
        reg.register(ChannelHandle::new("claude", "tab-2")).await;

        let removed = reg
            .handle_loss(&ChannelLost {
                agent_id: "claude".into(),
                handle: Some("tab-1".into()),
            })
            .await;

        assert!(!removed);
        assert_eq!(reg.lookup("claude").await.unwrap().id, "tab-2");
    }

    #[tokio::test]
    async fn test_loss_without_handle_removes_entry() {
        let reg = ChannelRegistry::new();
        reg.register(ChannelHandle::new("gemini", "tab-9")).await;
        assert!(
            reg.handle_loss(&ChannelLost {
                agent_id: "gemini".into(),
                handle: None,
            })
            .await
        );
        assert!(reg.lookup("gemini").await.is_none());
    }

    #[tokio::test]
    async fn test_acquire_reuses_live_channel() {
        let adapter = ScriptedAdapter::new(["chatgpt"]);
        let reg = ChannelRegistry::new();
        let first = reg.acquire(&adapter, "chatgpt").await.unwrap();
        let second = reg.acquire(&adapter, "chatgpt").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(adapter.channels_opened("chatgpt"), 1);
    }

    #[tokio::test]
    async fn test_acquire_replaces_dead_channel() {
        let adapter = ScriptedAdapter::new(["chatgpt"]);
        let reg = ChannelRegistry::new();
        let first = reg.acquire(&adapter, "chatgpt").await.unwrap();
        adapter.close_channel(&first);

        let second = reg.acquire(&adapter, "chatgpt").await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(reg.lookup("chatgpt").await, Some(second));
    }

    #[tokio::test]
    async fn test_loss_listener_invalidates() {
        let reg = Arc::new(ChannelRegistry::new());
        reg.register(ChannelHandle::new("claude", "tab-1")).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = reg.spawn_loss_listener(rx);
        tx.send(ChannelLost {
            agent_id: "claude".into(),
            handle: Some("tab-1".into()),
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(reg.lookup("claude").await.is_none());
    }
}
