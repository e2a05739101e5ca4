//! 状态广播：每次状态迁移后推送 StatusEvent
//!
//! 基于 tokio broadcast；没有订阅者时发送失败会被忽略，绝不反向影响编排器。

use tokio::sync::broadcast;

use crate::core::StatusEvent;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// 订阅状态事件（慢订阅者会丢失最旧的事件）
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StatusEvent) {
        tracing::debug!(
            status = %event.status,
            turn = event.current_turn,
            total = event.total_turns,
            "status update"
        );
        let _ = self.tx.send(event);
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunState, RunStatus};

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let b = StatusBroadcaster::new();
        b.publish(StatusEvent::from_state(&RunState::default()));
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let b = StatusBroadcaster::new();
        let mut rx = b.subscribe();
        let state = RunState {
            status: RunStatus::Running,
            ..Default::default()
        };
        b.publish(StatusEvent::from_state(&state).with_error("boom"));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.status, RunStatus::Running);
        assert_eq!(ev.error.as_deref(), Some("boom"));
    }
}
