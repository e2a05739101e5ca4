//! Flow 目录：内置模板 + 目录中的自定义 TOML
//!
//! 自定义文件示例（flows/panel.toml）：
//!
//! ```toml
//! name = "Panel"
//! max_rounds = 2
//!
//! [[agents]]
//! agent_id = "claude"
//! role = "Moderator"
//! goal = "Keep the discussion focused"
//! constraints = ["Be brief"]
//! output_format = "Short summary"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use crate::flow::{AgentRole, FlowConfig, FlowError};

#[derive(Debug, Clone, Default)]
pub struct FlowCatalog {
    flows: BTreeMap<String, FlowConfig>,
}

impl FlowCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// 内置四个模板：brainstorm / debate / validation / redteam
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        for flow in builtin_flows() {
            catalog.flows.insert(flow.id.clone(), flow);
        }
        catalog
    }

    /// 校验后加入目录；同 id 覆盖
    pub fn insert(&mut self, flow: FlowConfig) -> Result<(), FlowError> {
        flow.validate()?;
        self.flows.insert(flow.id.clone(), flow);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&FlowConfig> {
        self.flows.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.flows.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowConfig> {
        self.flows.values()
    }

    /// 读取目录下所有 *.toml；目录不存在时视为空
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, FlowError> {
        if !dir.exists() {
            return Ok(0);
        }
        let entries = std::fs::read_dir(dir).map_err(|source| FlowError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let flow = parse_flow_file(&path)?;
            tracing::info!(flow = %flow.id, path = %path.display(), "loaded custom flow");
            self.insert(flow)?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

fn parse_flow_file(path: &Path) -> Result<FlowConfig, FlowError> {
    let raw = std::fs::read_to_string(path).map_err(|source| FlowError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut flow: FlowConfig = toml::from_str(&raw).map_err(|source| FlowError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    if flow.id.trim().is_empty() {
        flow.id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    Ok(flow)
}

fn builtin_flows() -> Vec<FlowConfig> {
    vec![
        FlowConfig {
            id: "brainstorm".into(),
            name: "Brainstorm".into(),
            description: "Generate ideas, critique them, then synthesize improvements".into(),
            agents: vec![
                AgentRole::new("chatgpt", "Idea Generator")
                    .goal("Generate 5 diverse ideas")
                    .constraints(["No evaluation", "No filtering", "Raw ideas only"])
                    .output_format("Numbered list"),
                AgentRole::new("claude", "Devil's Advocate")
                    .goal("Attack assumptions and find flaws")
                    .constraints(["No solutions", "No politeness", "Bullet points only"])
                    .output_format("Critical analysis"),
                AgentRole::new("gemini", "Synthesizer")
                    .goal("Improve ideas based on criticism")
                    .constraints(["Address flaws", "Rank by survivability"])
                    .output_format("Ranked list with reasoning"),
            ],
            max_rounds: 1,
        },
        FlowConfig {
            id: "debate".into(),
            name: "Debate".into(),
            description: "Two AIs debate a topic, third judges the winner".into(),
            agents: vec![
                AgentRole::new("chatgpt", "Advocate")
                    .goal("Defend the position strongly")
                    .constraints(["Use evidence", "Address counterarguments", "Stay on topic"])
                    .output_format("Structured argument"),
                AgentRole::new("claude", "Opponent")
                    .goal("Attack the position with counterarguments")
                    .constraints(["Find weaknesses", "Provide alternatives", "Be rigorous"])
                    .output_format("Point-by-point rebuttal"),
                AgentRole::new("gemini", "Judge")
                    .goal("Evaluate both arguments objectively")
                    .constraints([
                        "Identify strongest points",
                        "Spot logical flaws",
                        "Declare winner",
                    ])
                    .output_format("Verdict with reasoning"),
            ],
            max_rounds: 2,
        },
        FlowConfig {
            id: "validation".into(),
            name: "Validation".into(),
            description: "Propose solution, test edge cases, assess feasibility".into(),
            agents: vec![
                AgentRole::new("chatgpt", "Solution Designer")
                    .goal("Design a complete solution to the problem")
                    .constraints([
                        "Be specific",
                        "Include implementation details",
                        "Consider tradeoffs",
                    ])
                    .output_format("Detailed solution"),
                AgentRole::new("claude", "Edge Case Analyst")
                    .goal("Find edge cases and failure scenarios")
                    .constraints(["Think adversarially", "Test boundaries", "No mercy"])
                    .output_format("List of edge cases with severity"),
                AgentRole::new("gemini", "Feasibility Assessor")
                    .goal("Evaluate if solution handles edge cases")
                    .constraints([
                        "Rate feasibility 1-10",
                        "Identify gaps",
                        "Suggest modifications",
                    ])
                    .output_format("Assessment with score"),
            ],
            max_rounds: 1,
        },
        FlowConfig {
            id: "redteam".into(),
            name: "Red Team".into(),
            description: "Security analysis through adversarial thinking".into(),
            agents: vec![
                AgentRole::new("chatgpt", "System Architect")
                    .goal("Describe the system architecture and security measures")
                    .constraints(["Be thorough", "Document assumptions", "Explain defenses"])
                    .output_format("Architecture description"),
                AgentRole::new("claude", "Attacker")
                    .goal("Find vulnerabilities and attack vectors")
                    .constraints(["Think like a hacker", "Exploit weaknesses", "Chain attacks"])
                    .output_format("Attack scenarios"),
                AgentRole::new("gemini", "Security Auditor")
                    .goal("Prioritize vulnerabilities and recommend fixes")
                    .constraints([
                        "Risk assessment",
                        "Practical remediation",
                        "Cost-benefit analysis",
                    ])
                    .output_format("Security report"),
            ],
            max_rounds: 1,
        },
    ]
}
