//! 提示发送与有限重试的回复提取
//!
//! 发送失败不重试（盲目重发可能导致重复提交）。
//! 发送成功后先等待固定时长让对端生成，再最多提取 N 次，间隔固定；
//! 空回复、过短回复与读取错误都记为「最后错误」并重试。

use crate::channel::{ChannelAdapter, ChannelHandle};
use crate::core::timing::{RetryPolicy, Sleeper};
use crate::core::ArenaError;

/// 成功提取的回复及其所在的尝试序号（1 起）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedReply {
    pub text: String,
    pub attempt: u32,
}

pub async fn dispatch_prompt(
    adapter: &dyn ChannelAdapter,
    handle: &ChannelHandle,
    prompt: &str,
) -> Result<(), ArenaError> {
    tracing::debug!(agent = %handle.agent_id, chars = prompt.len(), "sending prompt");
    adapter
        .send_prompt(handle, prompt)
        .await
        .map_err(|e| ArenaError::DispatchFailure {
            agent: handle.agent_id.clone(),
            reason: e.to_string(),
        })
}

/// 回复 trim 后非空且满足最小长度才接受
fn accept(raw: &str, min_chars: usize) -> Result<String, String> {
    let text = raw.trim();
    if text.is_empty() {
        return Err("Empty response".to_string());
    }
    let len = text.chars().count();
    if len < min_chars {
        return Err(format!("Response text too short ({len} chars)"));
    }
    Ok(text.to_string())
}

pub async fn extract_reply(
    adapter: &dyn ChannelAdapter,
    handle: &ChannelHandle,
    policy: RetryPolicy,
    min_chars: usize,
    sleeper: &dyn Sleeper,
) -> Result<ExtractedReply, ArenaError> {
    let agent = &handle.agent_id;
    tracing::info!(agent = %agent, "waiting {:?} for response", policy.initial_delay);
    sleeper.sleep(policy.initial_delay).await;

    let mut last_error = String::from("Unknown extraction error");
    for attempt in 1..=policy.max_attempts {
        tracing::debug!(agent = %agent, attempt, max = policy.max_attempts, "extraction attempt");
        let outcome = adapter
            .fetch_reply(handle)
            .await
            .map_err(|e| e.to_string())
            .and_then(|raw| accept(&raw, min_chars));

        match outcome {
            Ok(text) => {
                tracing::info!(agent = %agent, attempt, chars = text.chars().count(), "got response");
                return Ok(ExtractedReply { text, attempt });
            }
            Err(reason) => {
                tracing::warn!(agent = %agent, attempt, "extraction failed: {}, retrying", reason);
                last_error = reason;
            }
        }

        if attempt < policy.max_attempts {
            sleeper.sleep(policy.retry_delay).await;
        }
    }

    Err(ArenaError::ExtractionFailure {
        agent: agent.clone(),
        attempts: policy.max_attempts,
        last_error,
    })
}
