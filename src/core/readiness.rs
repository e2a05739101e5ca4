//! 通道获取与就绪屏障
//!
//! 先为每个选中的 Agent 获取（或新建）通道，等待页面稳定后逐个轮询 check_ready。
//! 所有 Agent 都通过后才允许发送任何提示；任一失败则整个 start 失败。

use std::time::Duration;

use crate::channel::{ChannelAdapter, ChannelHandle, ChannelRegistry};
use crate::core::timing::{RetryPolicy, Sleeper};
use crate::core::{AgentId, ArenaError};

/// 轮询单个通道直到就绪或预算耗尽；失败时返回最后一次的原因
pub async fn wait_until_ready(
    adapter: &dyn ChannelAdapter,
    handle: &ChannelHandle,
    policy: RetryPolicy,
    sleeper: &dyn Sleeper,
) -> Result<u32, String> {
    if !policy.initial_delay.is_zero() {
        sleeper.sleep(policy.initial_delay).await;
    }

    let mut last_reason = String::from("not ready");
    for attempt in 1..=policy.max_attempts {
        tracing::debug!(agent = %handle.agent_id, attempt, max = policy.max_attempts, "checking readiness");
        match adapter.check_ready(handle).await {
            Ok(true) => {
                tracing::info!(agent = %handle.agent_id, attempt, "agent is ready");
                return Ok(attempt);
            }
            Ok(false) => {
                last_reason = "not ready".to_string();
            }
            // 对端脚本可能尚未加载，与「未就绪」同样处理：等待后重试
            Err(e) if e.is_not_found() => {
                tracing::debug!(agent = %handle.agent_id, "channel endpoint not loaded yet");
                last_reason = e.to_string();
            }
            Err(e) => {
                tracing::warn!(agent = %handle.agent_id, attempt, "readiness check failed: {}", e);
                last_reason = e.to_string();
            }
        }
        if attempt < policy.max_attempts {
            sleeper.sleep(policy.retry_delay).await;
        }
    }

    tracing::error!(
        agent = %handle.agent_id,
        attempts = policy.max_attempts,
        "agent failed to become ready"
    );
    Err(format!(
        "not ready after {} attempts: {}",
        policy.max_attempts, last_reason
    ))
}

/// 获取全部通道并执行就绪屏障
///
/// `settle` 为获取完成到开始轮询之间的等待；返回时所有 Agent 都已就绪，
/// 否则返回列出全部未就绪 Agent 的 ChannelAcquisitionFailure。
pub async fn prepare_channels(
    registry: &ChannelRegistry,
    adapter: &dyn ChannelAdapter,
    agents: &[AgentId],
    settle: Duration,
    policy: RetryPolicy,
    sleeper: &dyn Sleeper,
) -> Result<(), ArenaError> {
    let mut failures: Vec<(AgentId, String)> = Vec::new();
    let mut acquired: Vec<AgentId> = Vec::new();

    for agent in agents {
        match registry.acquire(adapter, agent).await {
            Ok(_) => acquired.push(agent.clone()),
            Err(e) => {
                tracing::error!(agent = %agent, "failed to open channel: {}", e);
                failures.push((agent.clone(), format!("failed to open channel: {e}")));
            }
        }
    }

    if !acquired.is_empty() && !settle.is_zero() {
        tracing::info!("waiting {:?} for channels to load", settle);
        sleeper.sleep(settle).await;
    }

    for agent in &acquired {
        // 等待期间通道可能已丢失，重新获取
        let handle = match registry.lookup(agent).await {
            Some(h) => h,
            None => match registry.acquire(adapter, agent).await {
                Ok(h) => h,
                Err(e) => {
                    failures.push((agent.clone(), format!("channel lost: {e}")));
                    continue;
                }
            },
        };
        if let Err(reason) = wait_until_ready(adapter, &handle, policy, sleeper).await {
            failures.push((agent.clone(), reason));
        }
    }

    if failures.is_empty() {
        tracing::info!(agents = ?agents, "all agents are ready");
        return Ok(());
    }

    let detail = failures
        .iter()
        .map(|(agent, reason)| format!("{agent}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ");
    Err(ArenaError::ChannelAcquisitionFailure {
        agents: failures.into_iter().map(|(agent, _)| agent).collect(),
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelError, ReadyStep, ScriptedAdapter};
    use crate::core::timing::testing::RecordingSleeper;
    use crate::core::Timing;

    #[tokio::test]
    async fn test_not_found_is_retried_like_not_ready() {
        let adapter = ScriptedAdapter::new(["claude"]);
        adapter.push_ready_steps(
            "claude",
            [ReadyStep::NotFound, ReadyStep::NotReady, ReadyStep::Ready],
        );
        let handle = adapter.ensure_channel("claude").await.unwrap();
        let sleeper = RecordingSleeper::default();

        let attempt = wait_until_ready(&adapter, &handle, Timing::default().readiness, &sleeper)
            .await
            .unwrap();

        assert_eq!(attempt, 3);
        assert_eq!(sleeper.recorded(), vec![Duration::from_secs(2); 2]);
    }

    #[tokio::test]
    async fn test_gives_up_after_five_attempts() {
        let adapter = ScriptedAdapter::new(["gemini"]);
        adapter.set_never_ready("gemini");
        let handle = adapter.ensure_channel("gemini").await.unwrap();
        let sleeper = RecordingSleeper::default();

        let err = wait_until_ready(&adapter, &handle, Timing::default().readiness, &sleeper)
            .await
            .unwrap_err();

        assert!(err.contains("5 attempts"));
        assert_eq!(adapter.ready_checks("gemini"), 5);
        // 最后一次失败后不再等待
        assert_eq!(sleeper.recorded().len(), 4);
    }

    #[tokio::test]
    async fn test_barrier_names_every_unready_agent() {
        let adapter = ScriptedAdapter::new(["chatgpt", "claude", "gemini"]);
        adapter.set_never_ready("claude");
        adapter.fail_open("gemini", ChannelError::Backend("browser crashed".into()));
        let registry = ChannelRegistry::new();
        let sleeper = RecordingSleeper::default();
        let agents: Vec<AgentId> = vec!["chatgpt".into(), "claude".into(), "gemini".into()];

        let err = prepare_channels(
            &registry,
            &adapter,
            &agents,
            Duration::from_secs(3),
            Timing::default().readiness,
            &sleeper,
        )
        .await
        .unwrap_err();

        match err {
            ArenaError::ChannelAcquisitionFailure { agents, detail } => {
                assert_eq!(agents, vec!["gemini".to_string(), "claude".to_string()]);
                assert!(detail.contains("browser crashed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(sleeper.recorded()[0], Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_barrier_passes_and_registers_channels() {
        let adapter = ScriptedAdapter::new(["chatgpt", "claude"]);
        let registry = ChannelRegistry::new();
        let sleeper = RecordingSleeper::default();
        let agents: Vec<AgentId> = vec!["chatgpt".into(), "claude".into()];

        prepare_channels(
            &registry,
            &adapter,
            &agents,
            Duration::ZERO,
            Timing::default().readiness,
            &sleeper,
        )
        .await
        .unwrap();

        assert_eq!(registry.agents().await, agents);
        assert!(sleeper.recorded().is_empty());
    }
}
