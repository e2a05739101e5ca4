//! 核心编排层：状态机、错误分类、计时、就绪屏障、回复提取、状态广播

pub mod broadcaster;
pub mod builder;
pub mod error;
pub mod extraction;
pub mod orchestrator;
pub mod readiness;
pub mod state;
pub mod timing;

pub use broadcaster::StatusBroadcaster;
pub use builder::OrchestratorBuilder;
pub use error::{ArenaError, StartRejection};
pub use extraction::ExtractedReply;
pub use orchestrator::{StartRequest, TurnOrchestrator};
pub use state::{total_turns, AgentId, RunState, RunStatus, StatusEvent, TurnRecord, TurnSlot};
pub use timing::{RetryPolicy, Sleeper, Timing, TokioSleeper};
