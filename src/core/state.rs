//! 运行状态：RunState 单例、TurnRecord、状态广播事件与轮次换算
//!
//! RunState 只由 TurnOrchestrator 写入；外部通过 `get_state()` 拿到只读快照。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::AgentRole;

/// Agent 标识（提供方 id，如 chatgpt / claude / gemini）
pub type AgentId = String;

/// 运行状态机：Idle → Running → {Complete | Error}；Running → Idle（显式 stop）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Complete,
    Error,
}

impl RunStatus {
    /// 是否允许从当前状态发起新的 start
    pub fn accepts_start(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// 单个 Agent 的一次完成发言；创建后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub agent_id: AgentId,
    pub role: String,
    pub text: String,
    pub turn_index: usize,
}

/// 轮次 t 对应的位置：agent 下标与轮数（round 由 turn 推导，不单独存储）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnSlot {
    pub agent_index: usize,
    pub round_index: usize,
}

impl TurnSlot {
    /// `agent_count` 必须 ≥ 1
    pub fn for_turn(turn: usize, agent_count: usize) -> Self {
        Self {
            agent_index: turn % agent_count,
            round_index: turn / agent_count,
        }
    }
}

/// 总轮次 = agent 数 × 轮数
pub fn total_turns(agent_count: usize, max_rounds: usize) -> usize {
    agent_count * max_rounds
}

/// 一次编排运行的全部状态
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunState {
    pub status: RunStatus,
    /// 本次运行 id；start 时生成，用于识别被 stop / 新运行取代的旧循环
    pub run_id: Option<Uuid>,
    pub active_flow_id: Option<String>,
    pub current_turn: usize,
    pub max_rounds: usize,
    /// 按 flow 配置顺序、过滤到本次选中的 Agent
    pub agent_order: Vec<AgentRole>,
    pub transcript: Vec<TurnRecord>,
    pub user_topic: String,
    /// 最近一次致命错误的诊断信息
    pub last_error: Option<String>,
}

impl RunState {
    pub fn total_turns(&self) -> usize {
        total_turns(self.agent_order.len(), self.max_rounds)
    }

    /// 当前轮次对应的 Agent；运行已结束或无 Agent 时返回 None
    pub fn pending_agent(&self) -> Option<&AgentRole> {
        if self.agent_order.is_empty() || self.current_turn >= self.total_turns() {
            return None;
        }
        let slot = TurnSlot::for_turn(self.current_turn, self.agent_order.len());
        self.agent_order.get(slot.agent_index)
    }

    /// 是否仍是 `run_id` 对应的那次运行且处于 Running
    pub fn is_live(&self, run_id: Uuid) -> bool {
        self.status == RunStatus::Running && self.run_id == Some(run_id)
    }
}

/// 每次状态迁移后广播给展示层的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub status: RunStatus,
    pub run_id: Option<Uuid>,
    pub flow_id: Option<String>,
    /// 待执行（或已完成）轮次，0 起
    pub current_turn: usize,
    pub total_turns: usize,
    pub agent_id: Option<AgentId>,
    pub role: Option<String>,
    pub error: Option<String>,
}

impl StatusEvent {
    /// 基于当前状态生成事件（不带 agent / error）
    pub fn from_state(state: &RunState) -> Self {
        Self {
            status: state.status,
            run_id: state.run_id,
            flow_id: state.active_flow_id.clone(),
            current_turn: state.current_turn,
            total_turns: state.total_turns(),
            agent_id: None,
            role: None,
            error: None,
        }
    }

    pub fn with_agent(mut self, agent: &AgentRole) -> Self {
        self.agent_id = Some(agent.agent_id.clone());
        self.role = Some(agent.role.clone());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
