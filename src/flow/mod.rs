//! Flow 层：角色模板、模板目录、Prompt 构建

pub mod catalog;
pub mod prompt;
pub mod types;

pub use catalog::FlowCatalog;
pub use prompt::{build_conclusion_prompt, build_prompt};
pub use types::{AgentRole, FlowConfig, FlowError};
