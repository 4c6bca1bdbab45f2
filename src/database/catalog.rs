//! Routine lookup

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::core::error::{EngineError, EngineResult};
use crate::navigation::{NavigatorRegistry, Routine};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
}

impl From<&Routine> for RoutineSummary {
    fn from(routine: &Routine) -> Self {
        Self {
            id: routine.id.clone(),
            name: routine.name.clone(),
            version: routine.version.clone(),
            description: routine.description.clone(),
        }
    }
}

#[async_trait]
pub trait RoutineCatalog: Send + Sync {
    /// Unknown ids are `NotFound`
    async fn get(&self, routine_id: &str) -> EngineResult<Routine>;

    /// Sorted by id
    async fn list(&self) -> EngineResult<Vec<RoutineSummary>>;
}

#[derive(Debug, Default)]
pub struct InMemoryRoutineCatalog {
    routines: RwLock<HashMap<String, Routine>>,
}

impl InMemoryRoutineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routines(routines: impl IntoIterator<Item = Routine>) -> Self {
        Self {
            routines: RwLock::new(routines.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }

    pub async fn insert(&self, routine: Routine) {
        self.routines.write().await.insert(routine.id.clone(), routine);
    }
}

fn summaries(routines: &HashMap<String, Routine>) -> Vec<RoutineSummary> {
    let mut list: Vec<RoutineSummary> = routines.values().map(RoutineSummary::from).collect();
    list.sort_by(|a, b| a.id.cmp(&b.id));
    list
}

#[async_trait]
impl RoutineCatalog for InMemoryRoutineCatalog {
    async fn get(&self, routine_id: &str) -> EngineResult<Routine> {
        self.routines
            .read()
            .await
            .get(routine_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("routine '{}'", routine_id)))
    }

    async fn list(&self) -> EngineResult<Vec<RoutineSummary>> {
        Ok(summaries(&*self.routines.read().await))
    }
}

/// Routines read from `*.json` and `*.toml` files in one directory
pub struct FileRoutineCatalog {
    dir: PathBuf,
    routines: RwLock<HashMap<String, Routine>>,
}

impl FileRoutineCatalog {
    pub async fn load(dir: impl AsRef<Path>) -> EngineResult<Self> {
        let catalog = Self {
            dir: dir.as_ref().to_path_buf(),
            routines: RwLock::new(HashMap::new()),
        };
        catalog.reload().await?;
        Ok(catalog)
    }

    /// Parse one routine file
    pub async fn read_file(path: &Path) -> EngineResult<Routine> {
        let content = tokio::fs::read_to_string(path).await?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        match extension {
            "json" => Ok(serde_json::from_str(&content)?),
            "toml" => toml::from_str(&content).map_err(|e| {
                EngineError::Serialization(format!("{}: {}", path.display(), e))
            }),
            other => Err(EngineError::Configuration(format!(
                "unsupported routine file type '{}' ({})",
                other,
                path.display()
            ))),
        }
    }

    /// Re-read the directory. Files that do not parse, or whose graph no
    /// navigator can run, are skipped with a warning.
    pub async fn reload(&self) -> EngineResult<usize> {
        if !self.dir.exists() {
            debug!("Routine directory {:?} not found, catalog is empty", self.dir);
            self.routines.write().await.clear();
            return Ok(0);
        }

        let navigators = NavigatorRegistry::default();
        let mut loaded = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let supported = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("json") | Some("toml")
            );
            if !supported {
                continue;
            }
            let routine = Self::read_file(&path).await.and_then(|routine| {
                navigators.validate(&routine)?;
                Ok(routine)
            });
            match routine {
                Ok(routine) => {
                    if loaded.contains_key(&routine.id) {
                        warn!("Duplicate routine id '{}' in {:?}, keeping the first", routine.id, path);
                        continue;
                    }
                    loaded.insert(routine.id.clone(), routine);
                }
                Err(e) => warn!("Skipping routine file {:?}: {}", path, e),
            }
        }

        let count = loaded.len();
        *self.routines.write().await = loaded;
        info!("Loaded {} routines from {:?}", count, self.dir);
        Ok(count)
    }
}

#[async_trait]
impl RoutineCatalog for FileRoutineCatalog {
    async fn get(&self, routine_id: &str) -> EngineResult<Routine> {
        self.routines
            .read()
            .await
            .get(routine_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("routine '{}'", routine_id)))
    }

    async fn list(&self) -> EngineResult<Vec<RoutineSummary>> {
        Ok(summaries(&*self.routines.read().await))
    }
}
