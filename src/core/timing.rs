//! 等待策略：固定延迟常量与计时器抽象
//!
//! 外部 Agent 没有可靠的「生成完成」信号，只能按固定延迟轮询。
//! 所有等待都经过 Sleeper，生产环境用 tokio 定时器，测试里可替换为即时返回的实现。

use std::time::Duration;

use async_trait::async_trait;

/// 计时器抽象：协作式挂起，不阻塞线程
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// 基于 tokio::time 的默认实现
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(duration).await;
        }
    }
}

/// 一组「等待 + 固定次数重试」参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 首次尝试前的等待
    pub initial_delay: Duration,
    pub max_attempts: u32,
    /// 两次尝试之间的固定间隔（不做指数增长）
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(initial_delay: Duration, max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_attempts,
            retry_delay,
        }
    }
}

/// 设计常量（不对用户开放配置）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// 所有通道获取完毕后、就绪屏障开始前的等待
    pub post_acquire_settle: Duration,
    /// 就绪检查：5 次，每次间隔 2s
    pub readiness: RetryPolicy,
    /// 普通轮次：发送后等 15s，再最多提取 5 次，间隔 3s
    pub turn_extraction: RetryPolicy,
    /// 两轮之间给外部页面的稳定时间
    pub inter_turn_settle: Duration,
    /// 结论生成：就绪检查前的等待
    pub conclusion_settle: Duration,
    /// 结论文本更长：等 30s，间隔 5s
    pub conclusion_extraction: RetryPolicy,
    /// 回复 trim 后的最小字符数
    pub min_reply_chars: usize,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            post_acquire_settle: Duration::from_secs(3),
            readiness: RetryPolicy::new(Duration::ZERO, 5, Duration::from_secs(2)),
            turn_extraction: RetryPolicy::new(Duration::from_secs(15), 5, Duration::from_secs(3)),
            inter_turn_settle: Duration::from_secs(2),
            conclusion_settle: Duration::from_secs(2),
            conclusion_extraction: RetryPolicy::new(
                Duration::from_secs(30),
                5,
                Duration::from_secs(5),
            ),
            min_reply_chars: 1,
        }
    }
}

impl Timing {
    /// 重试次数与下限不变，所有延迟归零（测试与 dry-run 使用）
    pub fn zero() -> Self {
        let base = Self::default();
        Self {
            post_acquire_settle: Duration::ZERO,
            readiness: RetryPolicy::new(Duration::ZERO, base.readiness.max_attempts, Duration::ZERO),
            turn_extraction: RetryPolicy::new(
                Duration::ZERO,
                base.turn_extraction.max_attempts,
                Duration::ZERO,
            ),
            inter_turn_settle: Duration::ZERO,
            conclusion_settle: Duration::ZERO,
            conclusion_extraction: RetryPolicy::new(
                Duration::ZERO,
                base.conclusion_extraction.max_attempts,
                Duration::ZERO,
            ),
            min_reply_chars: base.min_reply_chars,
        }
    }
}
