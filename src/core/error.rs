//! 编排错误类型
//!
//! 所有运行期致命错误都会把 status 置为 Error 并广播诊断信息；
//! StartRejection 则在同步校验阶段直接拒绝，不改动任何状态。

use thiserror::Error;

use crate::core::AgentId;

/// start 请求被拒绝的原因（运行从未开始，status 不变）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartRejection {
    #[error("a flow is already running")]
    AlreadyRunning,

    #[error("no agents selected")]
    NoAgentsSelected,

    #[error("no topic provided")]
    EmptyTopic,

    #[error("flow \"{flow}\" not found (available: {})", available.join(", "))]
    UnknownFlow { flow: String, available: Vec<String> },

    #[error("none of the selected agents take part in this flow")]
    NoMatchingAgents,
}

/// 编排器对外暴露的错误分类
#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("invalid start request: {0}")]
    InvalidStartRequest(#[from] StartRejection),

    /// 就绪屏障未通过：列出所有未就绪的 Agent
    #[error("agents not ready: {} ({detail})", agents.join(", "))]
    ChannelAcquisitionFailure { agents: Vec<AgentId>, detail: String },

    #[error("no channel found for {0}")]
    ChannelMissing(AgentId),

    #[error("failed to send prompt to {agent}: {reason}")]
    DispatchFailure { agent: AgentId, reason: String },

    #[error("failed to get response from {agent} after {attempts} attempts: {last_error}")]
    ExtractionFailure {
        agent: AgentId,
        attempts: u32,
        last_error: String,
    },

    /// 独立的结论生成失败；不影响 RunState.status
    #[error("conclusion from {agent} failed: {source}")]
    ConclusionFailure {
        agent: AgentId,
        #[source]
        source: Box<ArenaError>,
    },

    #[error("conclusion needs a non-empty transcript")]
    EmptyTranscript,

    #[error("conclusion prompt is empty")]
    EmptyPrompt,
}

impl ArenaError {
    /// 是否为 start 同步校验阶段的拒绝
    pub fn is_rejection(&self) -> bool {
        matches!(self, ArenaError::InvalidStartRequest(_))
    }
}
