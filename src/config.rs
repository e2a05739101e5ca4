//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ARENA__*` 覆盖（双下划线表示嵌套，如 `ARENA__HISTORY__LIMIT=20`）。
//! 轮询/等待时长属于设计常量（见 core::timing），不在此处配置。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::history::DEFAULT_HISTORY_LIMIT;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub flows: FlowsSection,
    pub history: HistorySection,
    pub browser: BrowserSection,
}

/// [app] 段：默认参与的 Agent 与结论 Agent
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// CLI 未指定 --agents 时使用
    #[serde(default = "default_agents")]
    pub default_agents: Vec<String>,
    /// 生成结论时使用的 Agent；未设置时取本次运行的第一个 Agent
    pub conclusion_agent: Option<String>,
}

fn default_agents() -> Vec<String> {
    vec!["chatgpt".into(), "claude".into(), "gemini".into()]
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            default_agents: default_agents(),
            conclusion_agent: None,
        }
    }
}

/// [flows] 段：自定义 Flow 目录（*.toml）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FlowsSection {
    pub dir: Option<PathBuf>,
}

/// [history] 段：历史文件路径与保留条数
#[derive(Debug, Clone, Deserialize)]
pub struct HistorySection {
    #[serde(default = "default_history_path")]
    pub path: PathBuf,
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_path() -> PathBuf {
    PathBuf::from("arena/history.json")
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            path: default_history_path(),
            limit: default_history_limit(),
        }
    }
}

/// [browser] 段：浏览器通道（需启用 feature "browser"）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BrowserSection {
    /// 需要登录的站点通常要有界面，默认 false
    #[serde(default)]
    pub headless: bool,
    /// 复用已登录的 Chrome 用户目录
    pub user_data_dir: Option<PathBuf>,
    /// 按提供方覆盖内置页面配置
    #[serde(default)]
    pub providers: HashMap<String, ProviderSection>,
}

/// [browser.providers.<id>] 段：未设置的字段沿用内置值
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderSection {
    pub url: Option<String>,
    pub input_selectors: Option<Vec<String>>,
    pub submit_selectors: Option<Vec<String>>,
    pub reply_selector: Option<String>,
    pub busy_selector: Option<String>,
}

/// 从 config 目录加载配置，环境变量 ARENA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ARENA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ARENA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.default_agents, vec!["chatgpt", "claude", "gemini"]);
        assert_eq!(cfg.history.limit, 10);
        assert!(!cfg.browser.headless);
        assert!(cfg.flows.dir.is_none());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.toml");
        std::fs::write(
            &path,
            r#"
[app]
default_agents = ["claude", "gemini"]
conclusion_agent = "claude"

[history]
limit = 3

[browser.providers.claude]
url = "https://claude.ai/new"
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.app.default_agents, vec!["claude", "gemini"]);
        assert_eq!(cfg.app.conclusion_agent.as_deref(), Some("claude"));
        assert_eq!(cfg.history.limit, 3);
        assert_eq!(cfg.history.path, PathBuf::from("arena/history.json"));
        assert_eq!(
            cfg.browser.providers["claude"].url.as_deref(),
            Some("https://claude.ai/new")
        );
    }
}
