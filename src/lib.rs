//! Arena - 多 Agent 轮流对话编排
//!
//! 把同一个话题按 Flow 中的角色顺序轮流交给多个 Agent（每个 Agent 独占一条通道，
//! 例如一个浏览器标签页），汇总完整记录，并可让其中一个 Agent 生成结论。
//!
//! 模块划分：
//! - **channel**: 通道适配器契约、注册表、按 Agent 路由、脚本化 / 浏览器适配器
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排状态机、就绪屏障、回复提取、状态广播
//! - **flow**: Flow / 角色定义、内置与自定义 Flow 目录、提示词构造
//! - **history**: 已完成运行的 JSON 历史
//! - **observability**: tracing 初始化

pub mod channel;
pub mod config;
pub mod core;
pub mod flow;
pub mod history;
pub mod observability;

pub use crate::core::{ArenaError, OrchestratorBuilder, RunStatus, StartRequest, TurnOrchestrator};
