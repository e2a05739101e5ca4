//! 编排器构建器：统一组装通道适配器、Flow 目录、历史存储与计时器

use std::sync::Arc;

use crate::channel::{ChannelAdapter, ChannelLost, ChannelRegistry};
use crate::config::AppConfig;
use crate::core::timing::{Sleeper, Timing, TokioSleeper};
use crate::core::TurnOrchestrator;
use crate::flow::{FlowCatalog, FlowError};
use crate::history::{HistorySink, JsonHistoryStore};
use tokio::sync::mpsc;

pub struct OrchestratorBuilder {
    adapter: Arc<dyn ChannelAdapter>,
    catalog: FlowCatalog,
    registry: Arc<ChannelRegistry>,
    history: Option<Arc<dyn HistorySink>>,
    sleeper: Arc<dyn Sleeper>,
    timing: Timing,
    loss_rx: Option<mpsc::UnboundedReceiver<ChannelLost>>,
}

impl OrchestratorBuilder {
    /// 默认：内置 Flow、无历史存储、tokio 计时器、设计常量
    pub fn new(adapter: Arc<dyn ChannelAdapter>) -> Self {
        Self {
            adapter,
            catalog: FlowCatalog::builtin(),
            registry: Arc::new(ChannelRegistry::new()),
            history: None,
            sleeper: Arc::new(TokioSleeper),
            timing: Timing::default(),
            loss_rx: None,
        }
    }

    /// 按配置加载自定义 Flow 与历史文件
    pub fn with_config(mut self, cfg: &AppConfig) -> Result<Self, FlowError> {
        if let Some(dir) = &cfg.flows.dir {
            self.catalog.load_dir(dir)?;
        }
        self.history = Some(Arc::new(JsonHistoryStore::new(
            &cfg.history.path,
            cfg.history.limit,
        )));
        Ok(self)
    }

    pub fn with_catalog(mut self, catalog: FlowCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_registry(mut self, registry: Arc<ChannelRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// 适配器的通道丢失通知；build 时在后台注销对应注册项（需在 tokio 运行时内调用 build）
    pub fn with_loss_events(mut self, rx: mpsc::UnboundedReceiver<ChannelLost>) -> Self {
        self.loss_rx = Some(rx);
        self
    }

    pub fn build(self) -> TurnOrchestrator {
        if let Some(rx) = self.loss_rx {
            self.registry.spawn_loss_listener(rx);
        }
        TurnOrchestrator::from_parts(
            self.catalog,
            self.adapter,
            self.registry,
            self.history,
            self.sleeper,
            self.timing,
        )
    }
}
