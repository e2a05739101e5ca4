//! 轮次编排器：状态机与主循环
//!
//! 负责：校验 start 请求、初始化 RunState、执行就绪屏障，
//! 然后按 turn 顺序逐个 Agent 构建提示 → 发送 → 提取回复 → 追加记录，
//! 直到总轮次耗尽（Complete）或出现致命错误（Error）。
//!
//! 同一时间只允许一个运行处于 Running；轮次严格串行。
//! `stop()` 不会打断正在进行的发送/提取，该轮结束后其结果被丢弃，循环退出。

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::channel::{ChannelAdapter, ChannelRegistry};
use crate::core::extraction::{dispatch_prompt, extract_reply};
use crate::core::readiness::prepare_channels;
use crate::core::timing::{Sleeper, Timing};
use crate::core::{
    AgentId, ArenaError, RunState, RunStatus, StartRejection, StatusBroadcaster, StatusEvent,
    TurnRecord, TurnSlot,
};
use crate::flow::{build_conclusion_prompt, build_prompt, FlowCatalog};
use crate::history::{HistoryEntry, HistorySink};

/// start 请求：选中的 Agent、Flow id、用户主题
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub selected_agents: Vec<AgentId>,
    pub flow_id: String,
    pub topic: String,
}

impl StartRequest {
    pub fn new<I, S>(selected_agents: I, flow_id: impl Into<String>, topic: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AgentId>,
    {
        Self {
            selected_agents: selected_agents.into_iter().map(Into::into).collect(),
            flow_id: flow_id.into(),
            topic: topic.into(),
        }
    }
}

/// 一轮待执行的工作（从状态中取出后释放锁）
struct PendingTurn {
    turn: usize,
    total: usize,
    agent_id: AgentId,
    role: String,
    prompt: String,
    event: StatusEvent,
}

enum Step {
    Turn(PendingTurn),
    Finished(RunStatus),
}

pub struct TurnOrchestrator {
    catalog: FlowCatalog,
    adapter: Arc<dyn ChannelAdapter>,
    registry: Arc<ChannelRegistry>,
    state: RwLock<RunState>,
    broadcaster: StatusBroadcaster,
    history: Option<Arc<dyn HistorySink>>,
    sleeper: Arc<dyn Sleeper>,
    timing: Timing,
}

impl TurnOrchestrator {
    pub(crate) fn from_parts(
        catalog: FlowCatalog,
        adapter: Arc<dyn ChannelAdapter>,
        registry: Arc<ChannelRegistry>,
        history: Option<Arc<dyn HistorySink>>,
        sleeper: Arc<dyn Sleeper>,
        timing: Timing,
    ) -> Self {
        Self {
            catalog,
            adapter,
            registry,
            state: RwLock::new(RunState::default()),
            broadcaster: StatusBroadcaster::new(),
            history,
            sleeper,
            timing,
        }
    }

    /// 共享注册表（通道丢失通知经由它注销）
    pub fn registry(&self) -> Arc<ChannelRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.broadcaster.subscribe()
    }

    /// 只读快照
    pub async fn get_state(&self) -> RunState {
        self.state.read().await.clone()
    }

    /// 启动一次运行并驱动到结束
    ///
    /// 请求不合法时同步拒绝且不改动状态；就绪屏障失败时进入 Error。
    /// 返回运行结束时的状态（Complete，或被 stop 后的 Idle）。
    pub async fn start(&self, request: StartRequest) -> Result<RunStatus, ArenaError> {
        let (run_id, agents) = self.begin(&request).await?;
        tracing::info!(
            run = %run_id,
            flow = %request.flow_id,
            agents = ?agents,
            "flow started"
        );

        if let Err(e) = prepare_channels(
            &self.registry,
            self.adapter.as_ref(),
            &agents,
            self.timing.post_acquire_settle,
            self.timing.readiness,
            self.sleeper.as_ref(),
        )
        .await
        {
            return self.fail(run_id, e).await;
        }

        let event = {
            let state = self.state.read().await;
            if !state.is_live(run_id) {
                return Ok(state.status);
            }
            StatusEvent::from_state(&state)
        };
        self.broadcaster.publish(event);

        self.run_turns(run_id).await
    }

    /// 校验请求并初始化状态；全部在同一把写锁内完成
    async fn begin(&self, request: &StartRequest) -> Result<(Uuid, Vec<AgentId>), ArenaError> {
        let mut state = self.state.write().await;

        if !state.status.accepts_start() {
            return Err(StartRejection::AlreadyRunning.into());
        }
        if request.selected_agents.is_empty() {
            return Err(StartRejection::NoAgentsSelected.into());
        }
        if request.topic.trim().is_empty() {
            return Err(StartRejection::EmptyTopic.into());
        }
        let flow = self
            .catalog
            .get(&request.flow_id)
            .ok_or_else(|| StartRejection::UnknownFlow {
                flow: request.flow_id.clone(),
                available: self.catalog.ids(),
            })?;
        let agent_order = flow.select_agents(request.selected_agents.as_slice());
        if agent_order.is_empty() {
            return Err(StartRejection::NoMatchingAgents.into());
        }

        let run_id = Uuid::new_v4();
        let agents = agent_order.iter().map(|a| a.agent_id.clone()).collect();
        *state = RunState {
            status: RunStatus::Running,
            run_id: Some(run_id),
            active_flow_id: Some(flow.id.clone()),
            current_turn: 0,
            max_rounds: flow.max_rounds,
            agent_order,
            transcript: Vec::new(),
            user_topic: request.topic.clone(),
            last_error: None,
        };
        let event = StatusEvent::from_state(&state);
        drop(state);

        self.broadcaster.publish(event);
        Ok((run_id, agents))
    }

    async fn run_turns(&self, run_id: Uuid) -> Result<RunStatus, ArenaError> {
        loop {
            let pending = match self.next_step(run_id).await {
                Step::Finished(status) => return Ok(status),
                Step::Turn(pending) => pending,
            };

            tracing::info!(
                turn = pending.turn + 1,
                total = pending.total,
                agent = %pending.agent_id,
                role = %pending.role,
                "executing turn"
            );

            let Some(handle) = self.registry.lookup(&pending.agent_id).await else {
                return self
                    .fail(run_id, ArenaError::ChannelMissing(pending.agent_id))
                    .await;
            };

            // 发送前先广播，发送卡住时观察者也能看到进度
            self.broadcaster.publish(pending.event);

            if let Err(e) = dispatch_prompt(self.adapter.as_ref(), &handle, &pending.prompt).await {
                return self.fail(run_id, e).await;
            }

            let reply = match extract_reply(
                self.adapter.as_ref(),
                &handle,
                self.timing.turn_extraction,
                self.timing.min_reply_chars,
                self.sleeper.as_ref(),
            )
            .await
            {
                Ok(reply) => reply,
                Err(e) => return self.fail(run_id, e).await,
            };

            let more_turns = {
                let mut state = self.state.write().await;
                if !state.is_live(run_id) {
                    tracing::info!(
                        agent = %pending.agent_id,
                        "run stopped while turn was in flight, discarding reply"
                    );
                    return Ok(state.status);
                }
                state.transcript.push(TurnRecord {
                    agent_id: pending.agent_id,
                    role: pending.role,
                    text: reply.text,
                    turn_index: pending.turn,
                });
                state.current_turn += 1;
                state.current_turn < state.total_turns()
            };

            if more_turns {
                self.sleeper.sleep(self.timing.inter_turn_settle).await;
            }
        }
    }

    /// 取出下一轮；运行已结束时负责 Complete 迁移与持久化交接
    async fn next_step(&self, run_id: Uuid) -> Step {
        let mut state = self.state.write().await;
        if !state.is_live(run_id) {
            return Step::Finished(state.status);
        }

        let total = state.total_turns();
        if state.current_turn >= total {
            state.status = RunStatus::Complete;
            let event = StatusEvent::from_state(&state);
            let entry = HistoryEntry::new(
                run_id,
                state.active_flow_id.clone().unwrap_or_default(),
                state.user_topic.clone(),
                state.transcript.clone(),
            );
            drop(state);

            tracing::info!(run = %run_id, turns = entry.turn_count, "flow complete");
            self.broadcaster.publish(event);
            self.persist(entry).await;
            return Step::Finished(RunStatus::Complete);
        }

        let turn = state.current_turn;
        let Some(agent) = state.pending_agent().cloned() else {
            return Step::Finished(state.status);
        };
        let slot = TurnSlot::for_turn(turn, state.agent_order.len());
        let prompt = build_prompt(&agent, &state.transcript, &state.user_topic);
        tracing::debug!(round = slot.round_index + 1, agent = %agent.agent_id, "turn scheduled");

        Step::Turn(PendingTurn {
            turn,
            total,
            event: StatusEvent::from_state(&state).with_agent(&agent),
            agent_id: agent.agent_id,
            role: agent.role,
            prompt,
        })
    }

    async fn persist(&self, entry: HistoryEntry) {
        let Some(history) = &self.history else {
            return;
        };
        if let Err(e) = history.record(entry).await {
            tracing::warn!("failed to save flow history: {:#}", e);
        }
    }

    /// 致命错误：仍是当前运行时置 Error 并广播；运行已被 stop / 取代时丢弃该错误
    async fn fail(&self, run_id: Uuid, error: ArenaError) -> Result<RunStatus, ArenaError> {
        let mut state = self.state.write().await;
        if !state.is_live(run_id) {
            tracing::info!("run no longer active, ignoring error: {}", error);
            return Ok(state.status);
        }
        let message = error.to_string();
        tracing::error!(run = %run_id, "flow failed: {}", message);
        state.status = RunStatus::Error;
        state.last_error = Some(message.clone());
        let event = StatusEvent::from_state(&state).with_error(message);
        drop(state);

        self.broadcaster.publish(event);
        Err(error)
    }

    /// 停止当前运行：Running → Idle，清空 active_flow_id，保留 transcript；幂等
    pub async fn stop(&self) -> RunStatus {
        let mut state = self.state.write().await;
        if state.status != RunStatus::Running {
            return state.status;
        }
        state.status = RunStatus::Idle;
        state.active_flow_id = None;
        let event = StatusEvent::from_state(&state);
        drop(state);

        tracing::info!("flow stopped");
        self.broadcaster.publish(event);
        RunStatus::Idle
    }

    /// 独立的结论生成：与运行状态无关，失败也不改变 RunState.status
    pub async fn generate_conclusion(&self, agent_id: &str, prompt: &str) -> Result<String, ArenaError> {
        self.conclusion_exchange(agent_id, prompt)
            .await
            .map_err(|e| ArenaError::ConclusionFailure {
                agent: agent_id.to_string(),
                source: Box::new(e),
            })
    }

    /// 基于当前 transcript 构建结论提示并生成结论
    pub async fn conclude(&self, agent_id: &str) -> Result<String, ArenaError> {
        let transcript = self.state.read().await.transcript.clone();
        if transcript.is_empty() {
            return Err(ArenaError::EmptyTranscript);
        }
        let prompt = build_conclusion_prompt(&transcript);
        self.generate_conclusion(agent_id, &prompt).await
    }

    async fn conclusion_exchange(&self, agent_id: &str, prompt: &str) -> Result<String, ArenaError> {
        if prompt.trim().is_empty() {
            return Err(ArenaError::EmptyPrompt);
        }
        tracing::info!(agent = %agent_id, "generating conclusion");

        let agents = vec![agent_id.to_string()];
        prepare_channels(
            &self.registry,
            self.adapter.as_ref(),
            &agents,
            self.timing.conclusion_settle,
            self.timing.readiness,
            self.sleeper.as_ref(),
        )
        .await?;

        let handle = self
            .registry
            .lookup(agent_id)
            .await
            .ok_or_else(|| ArenaError::ChannelMissing(agent_id.to_string()))?;

        dispatch_prompt(self.adapter.as_ref(), &handle, prompt).await?;
        let reply = extract_reply(
            self.adapter.as_ref(),
            &handle,
            self.timing.conclusion_extraction,
            self.timing.min_reply_chars,
            self.sleeper.as_ref(),
        )
        .await?;
        Ok(reply.text)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::channel::{ChannelError, ChannelHandle, ScriptedAdapter};
    use crate::core::timing::testing::RecordingSleeper;
    use crate::core::OrchestratorBuilder;
    use crate::flow::{AgentRole, FlowConfig};

    fn duo_catalog(rounds: usize) -> FlowCatalog {
        let mut catalog = FlowCatalog::empty();
        catalog
            .insert(FlowConfig {
                id: "duo".into(),
                name: "Duo".into(),
                description: String::new(),
                agents: vec![
                    AgentRole::new("a", "Proposer").goal("Propose"),
                    AgentRole::new("b", "Critic").goal("Critique"),
                ],
                max_rounds: rounds,
            })
            .unwrap();
        catalog
    }

    fn setup(rounds: usize) -> (Arc<ScriptedAdapter>, Arc<RecordingSleeper>, TurnOrchestrator) {
        let adapter = Arc::new(ScriptedAdapter::new(["a", "b"]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let orch = OrchestratorBuilder::new(adapter.clone())
            .with_catalog(duo_catalog(rounds))
            .with_sleeper(sleeper.clone())
            .build();
        (adapter, sleeper, orch)
    }

    /// 每次发送前先把已收到的状态事件记下来，用来核对广播与发送的先后
    struct EventTap {
        inner: Arc<ScriptedAdapter>,
        rx: Mutex<Option<broadcast::Receiver<StatusEvent>>>,
        log: Mutex<Vec<String>>,
    }

    impl EventTap {
        fn drain(&self) {
            let mut rx = self.rx.lock().unwrap();
            let Some(rx) = rx.as_mut() else {
                return;
            };
            let mut log = self.log.lock().unwrap();
            while let Ok(ev) = rx.try_recv() {
                log.push(format!(
                    "{}:{}:{}/{}",
                    ev.status,
                    ev.agent_id.as_deref().unwrap_or("-"),
                    ev.current_turn,
                    ev.total_turns
                ));
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for EventTap {
        async fn ensure_channel(&self, agent_id: &str) -> Result<ChannelHandle, ChannelError> {
            self.inner.ensure_channel(agent_id).await
        }

        async fn is_alive(&self, handle: &ChannelHandle) -> bool {
            self.inner.is_alive(handle).await
        }

        async fn check_ready(&self, handle: &ChannelHandle) -> Result<bool, ChannelError> {
            self.inner.check_ready(handle).await
        }

        async fn send_prompt(&self, handle: &ChannelHandle, text: &str) -> Result<(), ChannelError> {
            self.drain();
            self.log.lock().unwrap().push(format!("send:{}", handle.agent_id));
            self.inner.send_prompt(handle, text).await
        }

        async fn fetch_reply(&self, handle: &ChannelHandle) -> Result<String, ChannelError> {
            self.inner.fetch_reply(handle).await
        }
    }

    #[tokio::test]
    async fn test_events_precede_each_dispatch_until_failure() {
        let inner = Arc::new(ScriptedAdapter::new(["a", "b"]));
        inner.fail_sends("b", "boom");
        let tap = Arc::new(EventTap {
            inner: inner.clone(),
            rx: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        });
        let orch = OrchestratorBuilder::new(tap.clone())
            .with_catalog(duo_catalog(2))
            .with_sleeper(Arc::new(RecordingSleeper::default()))
            .build();
        let mut events = orch.subscribe();
        *tap.rx.lock().unwrap() = Some(orch.subscribe());

        let err = orch
            .start(StartRequest::new(["a", "b"], "duo", "topic"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::DispatchFailure { ref agent, .. } if agent == "b"));

        assert_eq!(
            *tap.log.lock().unwrap(),
            vec![
                "running:-:0/4",
                "running:-:0/4",
                "running:a:0/4",
                "send:a",
                "running:b:1/4",
                "send:b",
            ]
        );
        assert_eq!(inner.dispatch_log(), vec!["a", "b"]);

        let mut seen = Vec::new();
        while let Ok(ev) = events.try_recv() {
            seen.push(ev);
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[2].role.as_deref(), Some("Proposer"));
        assert_eq!(seen[3].role.as_deref(), Some("Critic"));

        let last = &seen[4];
        assert_eq!(last.status, RunStatus::Error);
        assert_eq!((last.current_turn, last.total_turns), (1, 4));
        assert!(last.agent_id.is_none());
        assert_eq!(
            last.error.as_deref(),
            Some("failed to send prompt to b: rejected: boom")
        );
    }

    #[tokio::test]
    async fn test_turns_alternate_with_expected_waits() {
        let (adapter, sleeper, orch) = setup(2);

        let status = orch
            .start(StartRequest::new(["a", "b"], "duo", "Rust vs Go"))
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Complete);
        assert_eq!(adapter.dispatch_log(), vec!["a", "b", "a", "b"]);

        let state = orch.get_state().await;
        assert_eq!(state.current_turn, 4);
        let indices: Vec<usize> = state.transcript.iter().map(|t| t.turn_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        let s = Duration::from_secs;
        assert_eq!(
            sleeper.recorded(),
            vec![s(3), s(15), s(2), s(15), s(2), s(15), s(2), s(15)]
        );
    }

    #[tokio::test]
    async fn test_rejected_start_leaves_state_untouched() {
        let (adapter, _, orch) = setup(1);
        let before = orch.get_state().await;

        let cases = [
            (StartRequest::new(Vec::<String>::new(), "duo", "t"), StartRejection::NoAgentsSelected),
            (StartRequest::new(["a"], "duo", "   "), StartRejection::EmptyTopic),
            (StartRequest::new(["c"], "duo", "t"), StartRejection::NoMatchingAgents),
        ];
        for (req, expected) in cases {
            match orch.start(req).await {
                Err(ArenaError::InvalidStartRequest(r)) => assert_eq!(r, expected),
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
        let err = orch
            .start(StartRequest::new(["a"], "chess", "t"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ArenaError::InvalidStartRequest(StartRejection::UnknownFlow { .. })
        ));

        assert_eq!(orch.get_state().await.status, before.status);
        assert!(orch.get_state().await.run_id.is_none());
        assert_eq!(adapter.channels_opened("a"), 0);
    }

    #[tokio::test]
    async fn test_unready_agent_blocks_every_dispatch() {
        let (adapter, _, orch) = setup(1);
        adapter.set_never_ready("b");

        let err = orch
            .start(StartRequest::new(["a", "b"], "duo", "topic"))
            .await
            .unwrap_err();
        match err {
            ArenaError::ChannelAcquisitionFailure { agents, .. } => assert_eq!(agents, vec!["b"]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(adapter.dispatch_log().is_empty());
        assert_eq!(adapter.ready_checks("b"), 5);

        let state = orch.get_state().await;
        assert_eq!(state.status, RunStatus::Error);
        assert!(state.last_error.unwrap().contains('b'));
    }

    #[tokio::test]
    async fn test_late_reply_is_accepted_on_last_attempt() {
        let (adapter, sleeper, orch) = setup(1);
        adapter.push_replies("a", ["", "  ", "", "", "ok answer"]);

        orch.start(StartRequest::new(["a"], "duo", "topic"))
            .await
            .unwrap();

        let state = orch.get_state().await;
        assert_eq!(state.transcript.len(), 1);
        assert_eq!(state.transcript[0].text, "ok answer");
        assert_eq!(adapter.fetches("a"), 5);

        let s = Duration::from_secs;
        assert_eq!(sleeper.recorded(), vec![s(3), s(15), s(3), s(3), s(3), s(3)]);
    }

    #[tokio::test]
    async fn test_exhausted_extraction_sets_error() {
        let (adapter, _, orch) = setup(1);
        adapter.push_replies("b", ["", "", "", "", ""]);

        let err = orch
            .start(StartRequest::new(["a", "b"], "duo", "topic"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::ExtractionFailure { attempts: 5, .. }));

        let state = orch.get_state().await;
        assert_eq!(state.status, RunStatus::Error);
        assert_eq!(state.transcript.len(), 1);
        assert_eq!(state.current_turn, 1);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_not_retried() {
        let (adapter, _, orch) = setup(1);
        adapter.fail_sends("a", "Send button is disabled");

        let err = orch
            .start(StartRequest::new(["a", "b"], "duo", "topic"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::DispatchFailure { .. }));
        assert_eq!(adapter.fetches("a"), 0);
        assert_eq!(orch.get_state().await.status, RunStatus::Error);
    }

    #[tokio::test]
    async fn test_stop_outside_running_is_noop() {
        let (_, _, orch) = setup(1);
        assert_eq!(orch.stop().await, RunStatus::Idle);

        orch.start(StartRequest::new(["a"], "duo", "topic"))
            .await
            .unwrap();
        assert_eq!(orch.stop().await, RunStatus::Complete);
        assert_eq!(orch.get_state().await.active_flow_id.as_deref(), Some("duo"));
    }

    #[tokio::test]
    async fn test_conclusion_does_not_touch_status() {
        let (adapter, sleeper, orch) = setup(1);
        orch.start(StartRequest::new(["a", "b"], "duo", "topic"))
            .await
            .unwrap();
        let waits_before = sleeper.recorded().len();

        adapter.push_replies("b", ["Final verdict"]);
        let text = orch.conclude("b").await.unwrap();
        assert_eq!(text, "Final verdict");
        let prompt = adapter.sent_prompts("b").pop().unwrap();
        assert!(prompt.contains("[A - Proposer]"));

        let s = Duration::from_secs;
        assert_eq!(sleeper.recorded()[waits_before..], [s(2), s(30)]);

        adapter.push_replies("a", ["", "", "", "", ""]);
        let err = orch.conclude("a").await.unwrap_err();
        assert!(matches!(err, ArenaError::ConclusionFailure { .. }));
        assert_eq!(orch.get_state().await.status, RunStatus::Complete);
    }

    #[tokio::test]
    async fn test_conclusion_input_checks() {
        let (_, _, orch) = setup(1);
        assert!(matches!(
            orch.conclude("a").await.unwrap_err(),
            ArenaError::EmptyTranscript
        ));
        let err = orch.generate_conclusion("a", "  ").await.unwrap_err();
        match err {
            ArenaError::ConclusionFailure { source, .. } => {
                assert!(matches!(*source, ArenaError::EmptyPrompt))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
