pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::dao::models::{
    ChangeLogEntity, GameMode, ReplicationLogEntity, SaveOutcome, ScoreEntity,
};
use crate::dao::storage::StorageResult;

pub use memory::MemoryScoreStore;

/// Default number of rows returned by [`ScoreStore::top_scores`].
pub const DEFAULT_TOP_N: usize = 10;

/// Abstraction over the persistence layer for scores, the replication outbox and the change log.
///
/// Scores are append-only. `save_score` must check the natural key before inserting so that
/// replayed or concurrently replicated writes are dropped instead of stored twice.
pub trait ScoreStore: Send + Sync {
    fn save_score(&self, record: ScoreEntity) -> BoxFuture<'static, StorageResult<SaveOutcome>>;
    /// Best scores of a mode ordered by score desc, level desc, time asc.
    fn top_scores(
        &self,
        mode: GameMode,
        limit: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<ScoreEntity>>>;
    /// Every stored score, grouped by nothing; callers partition by mode.
    fn all_scores(&self) -> BoxFuture<'static, StorageResult<Vec<ScoreEntity>>>;
    fn append_outbox(&self, entry: ReplicationLogEntity) -> BoxFuture<'static, StorageResult<()>>;
    /// Unsynced outbox entries written by `origin_node_id`, oldest first.
    fn pending_outbox(
        &self,
        origin_node_id: String,
    ) -> BoxFuture<'static, StorageResult<Vec<ReplicationLogEntity>>>;
    fn mark_outbox_synced(&self, id: Uuid) -> BoxFuture<'static, StorageResult<()>>;
    fn append_change(&self, entry: ChangeLogEntity) -> BoxFuture<'static, StorageResult<()>>;
    /// Change log entries of `origin_node_id` strictly newer than `after_ms`, oldest first.
    fn changes_since(
        &self,
        origin_node_id: String,
        after_ms: i64,
    ) -> BoxFuture<'static, StorageResult<Vec<ChangeLogEntity>>>;
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Order used by every backend for leaderboards.
pub(crate) fn leaderboard_order(a: &ScoreEntity, b: &ScoreEntity) -> std::cmp::Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| b.level.cmp(&a.level))
        .then_with(|| a.time.total_cmp(&b.time))
}
