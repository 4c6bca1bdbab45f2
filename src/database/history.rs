//! Append-only run history

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::core::error::{EngineError, EngineResult};
use crate::orchestration::RunStatus;
use crate::resources::ResourcePool;
use crate::strategies::{Performance, StrategyType};
use crate::swarm::state::SwarmState;

/// One executed (or attempted) step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub swarm_id: String,
    pub run_id: String,
    pub routine_id: String,
    pub node_id: String,
    pub step_type: String,
    pub strategy_type: Option<StrategyType>,
    pub success: bool,
    pub fallback_used: bool,
    pub error: Option<String>,
    pub issues: Vec<String>,
    pub usage: ResourcePool,
    pub confidence: f64,
    pub execution_time_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Final state of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub swarm_id: String,
    pub run_id: String,
    pub routine_id: String,
    pub status: RunStatus,
    pub steps_executed: u64,
    pub issues: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

/// Performance review written when a swarm leaves `Reviewing`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub swarm_id: String,
    pub goal: String,
    pub final_state: SwarmState,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub replans: u32,
    pub issues: Vec<String>,
    pub strategy_metrics: Vec<(StrategyType, Performance)>,
    pub reviewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryRecord {
    Step(StepRecord),
    Run(RunRecord),
    Review(ReviewRecord),
}

impl HistoryRecord {
    pub fn swarm_id(&self) -> &str {
        match self {
            HistoryRecord::Step(r) => &r.swarm_id,
            HistoryRecord::Run(r) => &r.swarm_id,
            HistoryRecord::Review(r) => &r.swarm_id,
        }
    }
}

#[async_trait]
pub trait HistoryLog: Send + Sync {
    async fn append(&self, record: HistoryRecord) -> EngineResult<()>;

    /// Every record of a swarm, in append order
    async fn for_swarm(&self, swarm_id: &str) -> EngineResult<Vec<HistoryRecord>>;
}

/// History kept in memory, mostly for tests
#[derive(Debug, Default)]
pub struct InMemoryHistoryLog {
    records: RwLock<Vec<HistoryRecord>>,
}

impl InMemoryHistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<HistoryRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl HistoryLog for InMemoryHistoryLog {
    async fn append(&self, record: HistoryRecord) -> EngineResult<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn for_swarm(&self, swarm_id: &str) -> EngineResult<Vec<HistoryRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.swarm_id() == swarm_id)
            .cloned()
            .collect())
    }
}

/// History appended to a JSON-lines file
pub struct FileHistoryLog {
    path: PathBuf,
    // Serialises appends so lines never interleave
    write_lock: Mutex<()>,
}

impl FileHistoryLog {
    pub async fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!("Run history at {:?}", path);
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryLog for FileHistoryLog {
    async fn append(&self, record: HistoryRecord) -> EngineResult<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!("Appended {} record for swarm {}", kind_of(&record), record.swarm_id());
        Ok(())
    }

    async fn for_swarm(&self, swarm_id: &str) -> EngineResult<Vec<HistoryRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: HistoryRecord = serde_json::from_str(line).map_err(|e| {
                EngineError::Serialization(format!(
                    "{:?} line {}: {}",
                    self.path,
                    number + 1,
                    e
                ))
            })?;
            if record.swarm_id() == swarm_id {
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn kind_of(record: &HistoryRecord) -> &'static str {
    match record {
        HistoryRecord::Step(_) => "step",
        HistoryRecord::Run(_) => "run",
        HistoryRecord::Review(_) => "review",
    }
}
