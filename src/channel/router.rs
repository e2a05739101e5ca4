//! 按 Agent id 选择具体适配器
//!
//! 每个提供方可以有各自的实现（不同页面、不同启发式），对编排器而言它们是同一个 ChannelAdapter。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::{ChannelAdapter, ChannelError, ChannelHandle};
use crate::core::AgentId;

#[derive(Default, Clone)]
pub struct AdapterRouter {
    routes: HashMap<AgentId, Arc<dyn ChannelAdapter>>,
}

impl AdapterRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, agent_id: impl Into<AgentId>, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.routes.insert(agent_id.into(), adapter);
        self
    }

    pub fn agents(&self) -> Vec<AgentId> {
        let mut ids: Vec<_> = self.routes.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn adapter_for(&self, agent_id: &str) -> Result<&Arc<dyn ChannelAdapter>, ChannelError> {
        self.routes
            .get(agent_id)
            .ok_or_else(|| ChannelError::UnknownAgent(agent_id.to_string()))
    }
}

#[async_trait]
impl ChannelAdapter for AdapterRouter {
    async fn ensure_channel(&self, agent_id: &str) -> Result<ChannelHandle, ChannelError> {
        self.adapter_for(agent_id)?.ensure_channel(agent_id).await
    }

    async fn is_alive(&self, handle: &ChannelHandle) -> bool {
        match self.adapter_for(&handle.agent_id) {
            Ok(adapter) => adapter.is_alive(handle).await,
            Err(_) => false,
        }
    }

    async fn check_ready(&self, handle: &ChannelHandle) -> Result<bool, ChannelError> {
        self.adapter_for(&handle.agent_id)?.check_ready(handle).await
    }

    async fn send_prompt(&self, handle: &ChannelHandle, text: &str) -> Result<(), ChannelError> {
        self.adapter_for(&handle.agent_id)?
            .send_prompt(handle, text)
            .await
    }

    async fn fetch_reply(&self, handle: &ChannelHandle) -> Result<String, ChannelError> {
        self.adapter_for(&handle.agent_id)?.fetch_reply(handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ScriptedAdapter;

    #[tokio::test]
    async fn test_routes_by_agent_id() {
        let a = Arc::new(ScriptedAdapter::new(["chatgpt"]));
        let b = Arc::new(ScriptedAdapter::new(["claude"]));
        b.push_replies("claude", ["from claude"]);
        let router = AdapterRouter::new()
            .route("chatgpt", a.clone())
            .route("claude", b.clone());

        let handle = router.ensure_channel("claude").await.unwrap();
        router.send_prompt(&handle, "hi").await.unwrap();
        assert_eq!(router.fetch_reply(&handle).await.unwrap(), "from claude");
        assert_eq!(b.sent_prompts("claude"), vec!["hi".to_string()]);
        assert!(a.sent_prompts("chatgpt").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let router = AdapterRouter::new();
        let err = router.ensure_channel("grok").await.unwrap_err();
        assert_eq!(err, ChannelError::UnknownAgent("grok".into()));
        assert!(!router.is_alive(&ChannelHandle::new("grok", "x")).await);
    }
}
