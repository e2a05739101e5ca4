//! 脚本化适配器（用于测试与 dry-run，无需真实页面）
//!
//! 每个 Agent 可预置就绪序列与回复序列；序列耗尽后默认就绪，
//! 并返回一条基于发送次数生成的回复，便于本地跑通完整流程。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::{ChannelAdapter, ChannelError, ChannelHandle, ChannelLost};
use crate::core::AgentId;

/// 一次就绪检查的预置结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyStep {
    Ready,
    NotReady,
    /// 模拟页面脚本尚未加载
    NotFound,
}

#[derive(Debug, Default)]
struct AgentScript {
    ready_steps: VecDeque<ReadyStep>,
    never_ready: bool,
    replies: VecDeque<Result<String, ChannelError>>,
    send_error: Option<String>,
    open_error: Option<ChannelError>,
    sent: Vec<String>,
    ready_checks: u32,
    fetches: u32,
    opened: u32,
}

#[derive(Debug, Default)]
struct Inner {
    agents: HashMap<AgentId, AgentScript>,
    open: HashSet<ChannelHandle>,
    next_id: u64,
    /// 所有 send_prompt 调用的全局顺序（agent id）
    dispatch_log: Vec<AgentId>,
}

#[derive(Debug, Default)]
pub struct ScriptedAdapter {
    inner: Mutex<Inner>,
    loss_tx: Option<mpsc::UnboundedSender<ChannelLost>>,
}

impl ScriptedAdapter {
    pub fn new<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        let agents = agents
            .into_iter()
            .map(|a| (a.into(), AgentScript::default()))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                agents,
                ..Default::default()
            }),
            loss_tx: None,
        }
    }

    /// 关闭通道时向注册表发送丢失通知
    pub fn with_loss_notifier(mut self, tx: mpsc::UnboundedSender<ChannelLost>) -> Self {
        self.loss_tx = Some(tx);
        self
    }

    fn with_script<R>(&self, agent_id: &str, f: impl FnOnce(&mut AgentScript) -> R) -> R {
        let mut inner = self.lock();
        let script = inner.agents.entry(agent_id.to_string()).or_default();
        f(script)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_ready_steps(&self, agent_id: &str, steps: impl IntoIterator<Item = ReadyStep>) {
        self.with_script(agent_id, |s| s.ready_steps.extend(steps));
    }

    pub fn set_never_ready(&self, agent_id: &str) {
        self.with_script(agent_id, |s| s.never_ready = true);
    }

    pub fn push_replies<I, S>(&self, agent_id: &str, replies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_script(agent_id, |s| {
            s.replies.extend(replies.into_iter().map(|r| Ok(r.into())))
        });
    }

    pub fn push_reply_error(&self, agent_id: &str, error: ChannelError) {
        self.with_script(agent_id, |s| s.replies.push_back(Err(error)));
    }

    pub fn fail_sends(&self, agent_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        self.with_script(agent_id, |s| s.send_error = Some(reason));
    }

    pub fn fail_open(&self, agent_id: &str, error: ChannelError) {
        self.with_script(agent_id, |s| s.open_error = Some(error));
    }

    /// 模拟外部资源被关闭
    pub fn close_channel(&self, handle: &ChannelHandle) {
        let removed = self.lock().open.remove(handle);
        if removed {
            if let Some(tx) = &self.loss_tx {
                let _ = tx.send(ChannelLost {
                    agent_id: handle.agent_id.clone(),
                    handle: Some(handle.id.clone()),
                });
            }
        }
    }

    pub fn sent_prompts(&self, agent_id: &str) -> Vec<String> {
        self.with_script(agent_id, |s| s.sent.clone())
    }

    pub fn dispatch_log(&self) -> Vec<AgentId> {
        self.lock().dispatch_log.clone()
    }

    pub fn ready_checks(&self, agent_id: &str) -> u32 {
        self.with_script(agent_id, |s| s.ready_checks)
    }

    pub fn fetches(&self, agent_id: &str) -> u32 {
        self.with_script(agent_id, |s| s.fetches)
    }

    pub fn channels_opened(&self, agent_id: &str) -> u32 {
        self.with_script(agent_id, |s| s.opened)
    }

    fn ensure_open(inner: &Inner, handle: &ChannelHandle) -> Result<(), ChannelError> {
        if inner.open.contains(handle) {
            Ok(())
        } else {
            Err(ChannelError::NotFound(handle.to_string()))
        }
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedAdapter {
    async fn ensure_channel(&self, agent_id: &str) -> Result<ChannelHandle, ChannelError> {
        let mut inner = self.lock();
        let id = inner.next_id;
        let script = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ChannelError::UnknownAgent(agent_id.to_string()))?;
        if let Some(err) = script.open_error.clone() {
            return Err(err);
        }
        script.opened += 1;
        inner.next_id += 1;
        let handle = ChannelHandle::new(agent_id, format!("scripted-{id}"));
        inner.open.insert(handle.clone());
        Ok(handle)
    }

    async fn is_alive(&self, handle: &ChannelHandle) -> bool {
        self.lock().open.contains(handle)
    }

    async fn check_ready(&self, handle: &ChannelHandle) -> Result<bool, ChannelError> {
        let mut inner = self.lock();
        let open = Self::ensure_open(&inner, handle);
        let script = inner.agents.entry(handle.agent_id.clone()).or_default();
        script.ready_checks += 1;
        open?;
        match script.ready_steps.pop_front() {
            Some(ReadyStep::Ready) => Ok(true),
            Some(ReadyStep::NotReady) => Ok(false),
            Some(ReadyStep::NotFound) => Err(ChannelError::NotFound(handle.to_string())),
            None => Ok(!script.never_ready),
        }
    }

    async fn send_prompt(&self, handle: &ChannelHandle, text: &str) -> Result<(), ChannelError> {
        let mut inner = self.lock();
        Self::ensure_open(&inner, handle)?;
        inner.dispatch_log.push(handle.agent_id.clone());
        let script = inner.agents.entry(handle.agent_id.clone()).or_default();
        if let Some(reason) = &script.send_error {
            return Err(ChannelError::Rejected(reason.clone()));
        }
        script.sent.push(text.to_string());
        Ok(())
    }

    async fn fetch_reply(&self, handle: &ChannelHandle) -> Result<String, ChannelError> {
        let mut inner = self.lock();
        Self::ensure_open(&inner, handle)?;
        let script = inner.agents.entry(handle.agent_id.clone()).or_default();
        script.fetches += 1;
        match script.replies.pop_front() {
            Some(reply) => reply,
            None => Ok(format!(
                "{} response #{}",
                handle.agent_id,
                script.sent.len()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_steps_then_default() {
        let adapter = ScriptedAdapter::new(["claude"]);
        adapter.push_ready_steps("claude", [ReadyStep::NotFound, ReadyStep::NotReady]);
        let h = adapter.ensure_channel("claude").await.unwrap();

        assert!(adapter.check_ready(&h).await.unwrap_err().is_not_found());
        assert!(!adapter.check_ready(&h).await.unwrap());
        assert!(adapter.check_ready(&h).await.unwrap());
        assert_eq!(adapter.ready_checks("claude"), 3);
    }

    #[tokio::test]
    async fn test_closed_channel_is_not_found() {
        let adapter = ScriptedAdapter::new(["gemini"]);
        let h = adapter.ensure_channel("gemini").await.unwrap();
        adapter.close_channel(&h);
        assert!(!adapter.is_alive(&h).await);
        assert!(adapter.send_prompt(&h, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_default_reply_mentions_agent() {
        let adapter = ScriptedAdapter::new(["chatgpt"]);
        let h = adapter.ensure_channel("chatgpt").await.unwrap();
        adapter.send_prompt(&h, "topic").await.unwrap();
        assert_eq!(adapter.fetch_reply(&h).await.unwrap(), "chatgpt response #1");
    }
}
