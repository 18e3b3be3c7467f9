//! Result references and the records handed back to callers

use crate::digest::{Digest, Index};
use crate::error::KeygraphResult;
use crate::key::{CacheKey, ManagerToken};
use crate::storage::SharedArtifact;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Reference to an artifact in result storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheResult {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl CacheResult {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
        }
    }
}

/// A result stored under a key, as returned by one manager
#[derive(Debug, Clone)]
pub struct CacheRecord {
    /// Result ID
    pub id: String,
    /// When the result was created
    pub created_at: DateTime<Utc>,
    key: Arc<CacheKey>,
    manager_id: String,
    token: ManagerToken,
}

impl CacheRecord {
    pub(crate) fn new(
        result: &CacheResult,
        key: Arc<CacheKey>,
        manager_id: &str,
        token: ManagerToken,
    ) -> Self {
        Self {
            id: result.id.clone(),
            created_at: result.created_at,
            key,
            manager_id: manager_id.to_string(),
            token,
        }
    }

    /// Key the result was stored under
    pub fn key(&self) -> &Arc<CacheKey> {
        &self.key
    }

    /// ID of the manager that produced this record
    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    pub(crate) fn token(&self) -> ManagerToken {
        self.token
    }

    /// Compact description for log events
    pub fn describe(&self) -> String {
        format!("{}@{}", self.id, self.key.describe())
    }
}

/// Artifact loaded together with the key and result it came from
#[derive(Debug, Clone)]
pub struct LoadedResult {
    pub result: SharedArtifact,
    pub cache_result: CacheResult,
    pub cache_key: Arc<CacheKey>,
}

impl LoadedResult {
    pub fn describe(&self) -> String {
        format!(
            "{} ({}) for {}",
            self.result.id(),
            self.cache_result.id,
            self.cache_key.describe()
        )
    }
}

/// Key returned from a save, bundled with the means to export it
#[derive(Debug, Clone)]
pub struct ExportableCacheKey {
    pub key: Arc<CacheKey>,
    pub exporter: Exporter,
}

/// Exports the association created by a save
#[derive(Debug, Clone)]
pub struct Exporter {
    key: Arc<CacheKey>,
    record: CacheRecord,
}

impl Exporter {
    pub(crate) fn new(key: Arc<CacheKey>, record: CacheRecord) -> Self {
        Self { key, record }
    }

    pub fn record(&self) -> &CacheRecord {
        &self.record
    }

    /// Serializable description of the saved key and its derivation graph
    pub fn export(&self) -> ExportedKey {
        let mut exported = ExportedKey::from_key(&self.key);
        exported.result = Some(CacheResult::new(
            self.record.id.clone(),
            self.record.created_at,
        ));
        exported
    }

    /// [`Exporter::export`] as pretty JSON
    pub fn to_json(&self) -> KeygraphResult<String> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }
}

/// Exported form of a key; only the saved key carries a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedKey {
    pub digest: Digest,
    pub output: Index,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CacheResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<Vec<ExportedDep>>,
}

/// Exported parent of a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedDep {
    pub selector: String,
    pub key: ExportedKey,
}

impl ExportedKey {
    fn from_key(key: &CacheKey) -> Self {
        Self {
            digest: key.digest().clone(),
            output: key.output(),
            result: None,
            deps: key
                .deps()
                .iter()
                .map(|group| {
                    group
                        .iter()
                        .map(|dep| ExportedDep {
                            selector: dep.selector.clone(),
                            key: Self::from_key(&dep.key),
                        })
                        .collect()
                })
                .collect(),
        }
    }
}
