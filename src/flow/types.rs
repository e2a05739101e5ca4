//! Flow 配置类型
//!
//! 一个 Flow = 有序的 (agent, role, goal, constraints, output_format) 列表 + 轮数。
//! 运行开始前完整给定，运行期间不可变。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::AgentId;

/// Flow 定义错误
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("flow {0} has no agents")]
    NoAgents(String),

    #[error("flow {0}: max_rounds must be at least 1")]
    ZeroRounds(String),

    #[error("flow {flow}: agent {agent} appears more than once")]
    DuplicateAgent { flow: String, agent: AgentId },

    #[error("failed to read flow file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse flow file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// 单个 Agent 在 Flow 中的角色设定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRole {
    #[serde(alias = "provider")]
    pub agent_id: AgentId,
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default, alias = "outputFormat")]
    pub output_format: String,
}

impl AgentRole {
    pub fn new(agent_id: impl Into<AgentId>, role: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: role.into(),
            goal: String::new(),
            constraints: Vec::new(),
            output_format: String::new(),
        }
    }

    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn constraints<I, S>(mut self, constraints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.constraints = constraints.into_iter().map(Into::into).collect();
        self
    }

    pub fn output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = format.into();
        self
    }
}

/// Flow 配置（模板）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// 为空时由 catalog 以文件名填充
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "ais")]
    pub agents: Vec<AgentRole>,
    #[serde(alias = "maxRounds")]
    pub max_rounds: usize,
}

impl FlowConfig {
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.agents.is_empty() {
            return Err(FlowError::NoAgents(self.id.clone()));
        }
        if self.max_rounds == 0 {
            return Err(FlowError::ZeroRounds(self.id.clone()));
        }
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.agent_id.as_str()) {
                return Err(FlowError::DuplicateAgent {
                    flow: self.id.clone(),
                    agent: agent.agent_id.clone(),
                });
            }
        }
        Ok(())
    }

    /// 按配置顺序保留被选中的 Agent
    pub fn select_agents<S: AsRef<str>>(&self, selected: &[S]) -> Vec<AgentRole> {
        self.agents
            .iter()
            .filter(|a| selected.iter().any(|s| s.as_ref() == a.agent_id))
            .cloned()
            .collect()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.iter().map(|a| a.agent_id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> FlowConfig {
        FlowConfig {
            id: "t".into(),
            name: "T".into(),
            description: String::new(),
            agents: vec![
                AgentRole::new("a", "First"),
                AgentRole::new("b", "Second"),
                AgentRole::new("c", "Third"),
            ],
            max_rounds: 1,
        }
    }

    #[test]
    fn test_select_preserves_config_order() {
        let selected = flow().select_agents(&["c", "a"]);
        let ids: Vec<_> = selected.iter().map(|a| a.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_select_ignores_unknown() {
        assert!(flow().select_agents(&["zzz"]).is_empty());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_zero_rounds() {
        let mut f = flow();
        f.agents.push(AgentRole::new("a", "Again"));
        assert!(matches!(f.validate(), Err(FlowError::DuplicateAgent { .. })));

        let mut f = flow();
        f.max_rounds = 0;
        assert!(matches!(f.validate(), Err(FlowError::ZeroRounds(_))));
    }
}
