//! 运行历史持久化
//!
//! 运行自然完成时编排器交出一条记录；存储侧负责追加并只保留最近 N 条。
//! 单文件 JSON，最新在前。

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::core::TurnRecord;

/// 默认保留条数
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub flow_id: String,
    pub topic: String,
    pub turn_count: usize,
    pub transcript: Vec<TurnRecord>,
}

impl HistoryEntry {
    pub fn new(run_id: Uuid, flow_id: impl Into<String>, topic: impl Into<String>, transcript: Vec<TurnRecord>) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            flow_id: flow_id.into(),
            topic: topic.into(),
            turn_count: transcript.len(),
            transcript,
        }
    }
}

/// 持久化接收方：每次运行完成调用一次
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, entry: HistoryEntry) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct JsonHistoryStore {
    path: PathBuf,
    limit: usize,
}

impl JsonHistoryStore {
    pub fn new(path: impl AsRef<Path>, limit: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            limit: limit.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取全部历史（最新在前）；文件不存在时返回空
    pub async fn load(&self) -> anyhow::Result<Vec<HistoryEntry>> {
        match fs::read_to_string(&self.path).await {
            Ok(data) if data.trim().is_empty() => Ok(Vec::new()),
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("corrupt history file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", self.path.display())),
        }
    }

    pub async fn append(&self, entry: HistoryEntry) -> anyhow::Result<()> {
        let mut history = self.load().await?;
        history.insert(0, entry);
        history.truncate(self.limit);
        self.save(&history).await
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }

    async fn save(&self, history: &[HistoryEntry]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_string_pretty(history)?;
        fs::write(&self.path, data)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

#[async_trait]
impl HistorySink for JsonHistoryStore {
    async fn record(&self, entry: HistoryEntry) -> anyhow::Result<()> {
        self.append(entry).await?;
        tracing::info!(path = %self.path.display(), "flow saved to history");
        Ok(())
    }
}
