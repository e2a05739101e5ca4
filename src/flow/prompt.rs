//! Prompt 构建
//!
//! 纯函数：角色设定 + 完整历史发言 + 用户主题 → 单个提示字符串。

use crate::core::TurnRecord;
use crate::flow::AgentRole;

/// 构建一轮发言的提示（包含此前所有轮次，而不只是本轮）
pub fn build_prompt(agent: &AgentRole, transcript: &[TurnRecord], topic: &str) -> String {
    let mut prompt = format!("ROLE: {}\n", agent.role);
    prompt.push_str(&format!("GOAL: {}\n", agent.goal));
    prompt.push_str("CONSTRAINTS:\n");
    let constraints: Vec<String> = agent.constraints.iter().map(|c| format!("- {c}")).collect();
    prompt.push_str(&constraints.join("\n"));
    prompt.push('\n');
    prompt.push_str(&format!("OUTPUT FORMAT: {}\n\n", agent.output_format));

    if !topic.trim().is_empty() {
        prompt.push_str(&format!("PROBLEM/TOPIC:\n{topic}\n\n"));
    }

    if !transcript.is_empty() {
        prompt.push_str("PREVIOUS RESPONSES:\n");
        for record in transcript {
            prompt.push_str(&format!("\n[{}]:\n{}\n", record.role, record.text));
        }
        prompt.push('\n');
    }

    prompt.push_str("Your response:");
    prompt
}

/// 构建「总结并裁决」提示：逐条嵌入发言，标注 Agent 与角色
pub fn build_conclusion_prompt(transcript: &[TurnRecord]) -> String {
    let mut conversation = String::from("CONVERSATION SUMMARY:\n\n");
    for record in transcript {
        conversation.push_str(&format!(
            "[{} - {}]:\n{}\n\n",
            record.agent_id.to_uppercase(),
            record.role,
            record.text
        ));
    }

    format!(
        "You are a Synthesizer and Judge. Your task is to provide a comprehensive conclusion \
based on the following conversation between multiple AI models.

{conversation}
Please provide:
1. A summary of the key points discussed
2. The main arguments and counterarguments
3. Areas of agreement and disagreement
4. Your final assessment or recommendation
5. Any important insights or takeaways

Format your response clearly with sections and bullet points where appropriate."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advocate() -> AgentRole {
        AgentRole::new("chatgpt", "Advocate")
            .goal("Defend the position strongly")
            .constraints(["Use evidence", "Stay on topic"])
            .output_format("Structured argument")
    }

    fn record(agent: &str, role: &str, text: &str, turn: usize) -> TurnRecord {
        TurnRecord {
            agent_id: agent.into(),
            role: role.into(),
            text: text.into(),
            turn_index: turn,
        }
    }

    #[test]
    fn test_first_turn_prompt() {
        let prompt = build_prompt(&advocate(), &[], "Remote work is better");
        assert_eq!(
            prompt,
            "ROLE: Advocate\n\
             GOAL: Defend the position strongly\n\
             CONSTRAINTS:\n- Use evidence\n- Stay on topic\n\
             OUTPUT FORMAT: Structured argument\n\n\
             PROBLEM/TOPIC:\nRemote work is better\n\n\
             Your response:"
        );
    }

    #[test]
    fn test_prompt_includes_every_previous_turn() {
        let transcript = vec![
            record("chatgpt", "Advocate", "Round one argument", 0),
            record("claude", "Opponent", "Round one rebuttal", 1),
            record("chatgpt", "Advocate", "Round two argument", 2),
        ];
        let prompt = build_prompt(&advocate(), &transcript, "topic");
        assert!(prompt.contains("PREVIOUS RESPONSES:\n\n[Advocate]:\nRound one argument\n"));
        assert!(prompt.contains("[Opponent]:\nRound one rebuttal"));
        assert!(prompt.contains("Round two argument"));
        assert!(prompt.ends_with("Your response:"));
    }

    #[test]
    fn test_conclusion_prompt_labels_agent_and_role() {
        let transcript = vec![record("claude", "Opponent", "No.", 0)];
        let prompt = build_conclusion_prompt(&transcript);
        assert!(prompt.starts_with("You are a Synthesizer and Judge."));
        assert!(prompt.contains("[CLAUDE - Opponent]:\nNo.\n"));
        assert!(prompt.contains("4. Your final assessment or recommendation"));
    }
}
