//! Agent 通道适配器契约
//!
//! 每个 Agent 只能通过一条独占通道访问（例如一个浏览器标签页）。
//! 编排器只依赖这里的 trait，从不根据提供方身份分支。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::AgentId;

/// 通道句柄：适配器返回的不透明 id + 所属 Agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub agent_id: AgentId,
    pub id: String,
}

impl ChannelHandle {
    pub fn new(agent_id: impl Into<AgentId>, id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.agent_id, self.id)
    }
}

/// 外部资源被关闭时的异步通知；`handle` 为空表示该 Agent 的任何通道都失效
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLost {
    pub agent_id: AgentId,
    pub handle: Option<String>,
}

/// 适配器层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// 通道另一端尚不存在（页面脚本未加载 / 标签页已关闭）
    #[error("channel not found: {0}")]
    NotFound(String),

    #[error("channel not ready: {0}")]
    NotReady(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// 对端明确拒绝了请求（如找不到输入框）
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl ChannelError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChannelError::NotFound(_))
    }
}

/// Agent 通道适配器：创建 / 探活 / 就绪检查 / 发送 / 读取最新回复
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// 查找或创建通道；允许耗时较长（外部资源需要初始化）
    async fn ensure_channel(&self, agent_id: &str) -> Result<ChannelHandle, ChannelError>;

    /// 句柄是否仍指向有效的外部资源
    async fn is_alive(&self, handle: &ChannelHandle) -> bool;

    /// 对端是否可以接收提示
    async fn check_ready(&self, handle: &ChannelHandle) -> Result<bool, ChannelError>;

    async fn send_prompt(&self, handle: &ChannelHandle, text: &str) -> Result<(), ChannelError>;

    /// 读取最新一条回复（尽力而为，可能不完整）
    async fn fetch_reply(&self, handle: &ChannelHandle) -> Result<String, ChannelError>;
}
