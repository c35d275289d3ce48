use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::models::{
    AnswerSheet, CachedLeaderboard, Submission, UserRecord, Week, WeeklyDocument,
    GLOBAL_CACHE_DOC,
};

/// Collections the quiz reads and writes. Weekly submissions and the cached
/// leaderboard share one collection; the cache lives under [`GLOBAL_CACHE_DOC`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Every weekly submissions document except the cache sentinel.
    async fn weekly_documents(&self) -> Result<Vec<WeeklyDocument>, StoreError>;

    /// Appends one graded submission to the document for its week.
    async fn append_submission(
        &self,
        week_no: i64,
        submission: &Submission,
    ) -> Result<(), StoreError>;

    async fn top_users_by_score(&self, limit: usize) -> Result<Vec<UserRecord>, StoreError>;

    /// Creates the user if needed and adds `delta` to the denormalized score.
    async fn add_user_score(&self, email: &str, name: &str, delta: f64)
        -> Result<(), StoreError>;

    async fn write_cached_leaderboard(&self, cache: &CachedLeaderboard)
        -> Result<(), StoreError>;

    async fn cached_leaderboard(&self) -> Result<Option<CachedLeaderboard>, StoreError>;

    /// All weeks ordered by week number.
    async fn weeks(&self) -> Result<Vec<Week>, StoreError>;

    async fn count_weeks(&self) -> Result<usize, StoreError>;

    async fn insert_week(&self, week: &Week) -> Result<(), StoreError>;

    /// Returns false when the week does not exist.
    async fn set_week_visibility(&self, week_no: i64, visible: bool) -> Result<bool, StoreError>;

    async fn record_answers(&self, sheet: &AnswerSheet) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub weekly_submissions: BTreeMap<String, Value>,
    #[serde(default)]
    pub users: Vec<UserRecord>,
    #[serde(default)]
    pub weeks: Vec<Week>,
    #[serde(default)]
    pub answer_sheets: Vec<AnswerSheet>,
}

/// Document store held in memory, optionally loaded from and saved back to a
/// JSON snapshot file after every write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<Snapshot>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    #[cfg(test)]
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
            path: None,
        }
    }

    /// Opens a snapshot file. A missing file starts an empty store that will
    /// be created on the first write.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let snapshot = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                StoreError::SnapshotFormat {
                    path: path.display().to_string(),
                    source,
                }
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "snapshot not found, starting empty");
                Snapshot::default()
            }
            Err(source) => {
                return Err(StoreError::Snapshot {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        Ok(Self {
            state: RwLock::new(snapshot),
            path: Some(path.to_path_buf()),
        })
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let bytes = serde_json::to_vec_pretty(snapshot).map_err(|source| {
            StoreError::SnapshotFormat {
                path: path.display().to_string(),
                source,
            }
        })?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|source| StoreError::Snapshot {
                path: path.display().to_string(),
                source,
            })
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn weekly_documents(&self) -> Result<Vec<WeeklyDocument>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .weekly_submissions
            .iter()
            .filter(|(doc_id, _)| doc_id.as_str() != GLOBAL_CACHE_DOC)
            .map(|(doc_id, body)| WeeklyDocument::from_body(doc_id.as_str(), body))
            .collect())
    }

    async fn append_submission(
        &self,
        week_no: i64,
        submission: &Submission,
    ) -> Result<(), StoreError> {
        let doc_id = WeeklyDocument::doc_id_for_week(week_no);
        let entry = serde_json::to_value(submission).map_err(|source| StoreError::Decode {
            doc_id: doc_id.clone(),
            source,
        })?;

        let mut state = self.state.write().await;
        let body = state
            .weekly_submissions
            .entry(doc_id)
            .or_insert_with(|| json!({ "users": [] }));
        if !body.is_object() {
            *body = json!({ "users": [] });
        }
        match body.get_mut("users").and_then(Value::as_array_mut) {
            Some(users) => users.push(entry),
            None => body["users"] = json!([entry]),
        }
        self.persist(&state).await
    }

    async fn top_users_by_score(&self, limit: usize) -> Result<Vec<UserRecord>, StoreError> {
        let state = self.state.read().await;
        let mut users = state.users.clone();
        users.sort_by(|a, b| b.score.total_cmp(&a.score));
        users.truncate(limit);
        Ok(users)
    }

    async fn add_user_score(
        &self,
        email: &str,
        name: &str,
        delta: f64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        match state.users.iter_mut().find(|user| user.email == email) {
            Some(user) => {
                user.score += delta;
                if !name.is_empty() {
                    user.name = name.to_string();
                }
            }
            None => state.users.push(UserRecord {
                email: email.to_string(),
                name: name.to_string(),
                score: delta,
            }),
        }
        self.persist(&state).await
    }

    async fn write_cached_leaderboard(
        &self,
        cache: &CachedLeaderboard,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_value(cache).map_err(|source| StoreError::Decode {
            doc_id: GLOBAL_CACHE_DOC.to_string(),
            source,
        })?;
        let mut state = self.state.write().await;
        state
            .weekly_submissions
            .insert(GLOBAL_CACHE_DOC.to_string(), body);
        self.persist(&state).await
    }

    async fn cached_leaderboard(&self) -> Result<Option<CachedLeaderboard>, StoreError> {
        let state = self.state.read().await;
        state
            .weekly_submissions
            .get(GLOBAL_CACHE_DOC)
            .map(|body| {
                CachedLeaderboard::deserialize(body).map_err(|source| StoreError::Decode {
                    doc_id: GLOBAL_CACHE_DOC.to_string(),
                    source,
                })
            })
            .transpose()
    }

    async fn weeks(&self) -> Result<Vec<Week>, StoreError> {
        let state = self.state.read().await;
        let mut weeks = state.weeks.clone();
        weeks.sort_by_key(|week| week.week_no);
        Ok(weeks)
    }

    async fn count_weeks(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().await.weeks.len())
    }

    async fn insert_week(&self, week: &Week) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.weeks.retain(|existing| existing.week_no != week.week_no);
        state.weeks.push(week.clone());
        self.persist(&state).await
    }

    async fn set_week_visibility(&self, week_no: i64, visible: bool) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let Some(week) = state.weeks.iter_mut().find(|week| week.week_no == week_no) else {
            return Ok(false);
        };
        week.visible = visible;
        self.persist(&state).await?;
        Ok(true)
    }

    async fn record_answers(&self, sheet: &AnswerSheet) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.answer_sheets.push(sheet.clone());
        self.persist(&state).await
    }
}
