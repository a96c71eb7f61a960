//! In-process score store used by the fallback host, by tests, and by nodes started without a
//! database. Nothing survives a restart.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ScoreStore, leaderboard_order};
use crate::dao::{
    models::{ChangeLogEntity, GameMode, NaturalKey, ReplicationLogEntity, SaveOutcome, ScoreEntity},
    storage::StorageResult,
};

#[derive(Clone, Default)]
pub struct MemoryScoreStore {
    inner: Arc<RwLock<MemoryTables>>,
}

#[derive(Default)]
struct MemoryTables {
    scores: HashMap<GameMode, Vec<ScoreEntity>>,
    keys: HashMap<GameMode, HashSet<NaturalKey>>,
    outbox: Vec<ReplicationLogEntity>,
    changes: Vec<ChangeLogEntity>,
}

impl MemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored scores across every mode.
    pub async fn len(&self) -> usize {
        let guard = self.inner.read().await;
        guard.scores.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl ScoreStore for MemoryScoreStore {
    fn save_score(&self, record: ScoreEntity) -> BoxFuture<'static, StorageResult<SaveOutcome>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.write().await;
            let tables = &mut *guard;
            let keys = tables.keys.entry(record.mode).or_default();
            if !keys.insert(record.natural_key()) {
                return Ok(SaveOutcome::DuplicateIgnored);
            }
            tables.scores.entry(record.mode).or_default().push(record);
            Ok(SaveOutcome::Saved)
        })
    }

    fn top_scores(
        &self,
        mode: GameMode,
        limit: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<ScoreEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let guard = inner.read().await;
            let mut rows = guard.scores.get(&mode).cloned().unwrap_or_default();
            rows.sort_by(leaderboard_order);
            rows.truncate(limit);
            Ok(rows)
        })
    }

    fn all_scores(&self) -> BoxFuture<'static, StorageResult<Vec<ScoreEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let guard = inner.read().await;
            Ok(GameMode::ALL
                .iter()
                .filter_map(|mode| guard.scores.get(mode))
                .flatten()
                .cloned()
                .collect())
        })
    }

    fn append_outbox(&self, entry: ReplicationLogEntity) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.write().await.outbox.push(entry);
            Ok(())
        })
    }

    fn pending_outbox(
        &self,
        origin_node_id: String,
    ) -> BoxFuture<'static, StorageResult<Vec<ReplicationLogEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let guard = inner.read().await;
            Ok(guard
                .outbox
                .iter()
                .filter(|entry| !entry.synced && entry.origin_node_id == origin_node_id)
                .cloned()
                .collect())
        })
    }

    fn mark_outbox_synced(&self, id: Uuid) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.write().await;
            if let Some(entry) = guard.outbox.iter_mut().find(|entry| entry.id == id) {
                entry.synced = true;
            }
            Ok(())
        })
    }

    fn append_change(&self, entry: ChangeLogEntity) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.write().await.changes.push(entry);
            Ok(())
        })
    }

    fn changes_since(
        &self,
        origin_node_id: String,
        after_ms: i64,
    ) -> BoxFuture<'static, StorageResult<Vec<ChangeLogEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let guard = inner.read().await;
            let mut rows: Vec<ChangeLogEntity> = guard
                .changes
                .iter()
                .filter(|entry| entry.origin_node_id == origin_node_id && entry.timestamp_ms > after_ms)
                .cloned()
                .collect();
            rows.sort_by_key(|entry| entry.timestamp_ms);
            Ok(rows)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::models::{ChangeAction, ScorePayload};

    fn payload(level: i64, score: i64, time: f64) -> ScorePayload {
        ScorePayload { level, score, time }
    }

    #[tokio::test]
    async fn duplicate_natural_key_is_ignored() {
        let store = MemoryScoreStore::new();
        let first = ScoreEntity::new(GameMode::Single, payload(1, 1500, 120.5));
        let replay = ScoreEntity::new(GameMode::Single, payload(1, 1500, 120.5));

        assert_eq!(store.save_score(first).await.unwrap(), SaveOutcome::Saved);
        assert_eq!(
            store.save_score(replay).await.unwrap(),
            SaveOutcome::DuplicateIgnored
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn same_key_in_other_mode_is_distinct() {
        let store = MemoryScoreStore::new();
        store
            .save_score(ScoreEntity::new(GameMode::Single, payload(2, 300, 45.0)))
            .await
            .unwrap();
        let outcome = store
            .save_score(ScoreEntity::new(GameMode::Coop, payload(2, 300, 45.0)))
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Saved);
    }

    #[tokio::test]
    async fn top_scores_are_ordered_and_limited() {
        let store = MemoryScoreStore::new();
        for (level, score, time) in [(1, 100, 10.0), (3, 900, 50.0), (2, 900, 40.0), (1, 500, 9.0)] {
            store
                .save_score(ScoreEntity::new(GameMode::Single, payload(level, score, time)))
                .await
                .unwrap();
        }

        let top = store.top_scores(GameMode::Single, 3).await.unwrap();
        let scores: Vec<(i64, i64)> = top.iter().map(|row| (row.score, row.level)).collect();
        assert_eq!(scores, vec![(900, 3), (900, 2), (500, 1)]);
        assert!(store.top_scores(GameMode::Coop, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outbox_filters_by_origin_and_sync_flag() {
        let store = MemoryScoreStore::new();
        let entry = |origin: &str| ReplicationLogEntity {
            id: Uuid::new_v4(),
            table_name: GameMode::Single.table_name().into(),
            record_id: Uuid::new_v4(),
            action: ChangeAction::Insert,
            payload: payload(1, 10, 1.0),
            origin_node_id: origin.into(),
            synced: false,
            created_at_ms: 1,
        };
        let mine = entry("node-a");
        store.append_outbox(mine.clone()).await.unwrap();
        store.append_outbox(entry("node-b")).await.unwrap();

        let pending = store.pending_outbox("node-a".into()).await.unwrap();
        assert_eq!(pending, vec![mine.clone()]);

        store.mark_outbox_synced(mine.id).await.unwrap();
        assert!(store.pending_outbox("node-a".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn changes_since_is_exclusive_and_sorted() {
        let store = MemoryScoreStore::new();
        for ts in [30, 10, 20] {
            store
                .append_change(ChangeLogEntity {
                    id: Uuid::new_v4(),
                    table_name: GameMode::Coop.table_name().into(),
                    record_id: Uuid::new_v4(),
                    action: ChangeAction::Insert,
                    new_data: payload(1, ts, 1.0),
                    timestamp_ms: ts,
                    origin_node_id: "node-a".into(),
                })
                .await
                .unwrap();
        }

        let rows = store.changes_since("node-a".into(), 10).await.unwrap();
        let stamps: Vec<i64> = rows.iter().map(|row| row.timestamp_ms).collect();
        assert_eq!(stamps, vec![20, 30]);
        assert!(store.changes_since("node-b".into(), 0).await.unwrap().is_empty());
    }
}
