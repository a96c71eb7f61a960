use std::sync::Arc;

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{Client, Collection, Database, IndexModel, bson::doc, options::IndexOptions};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    error::{MongoDaoError, MongoResult, is_duplicate_key},
    models::{
        CHANGE_COLLECTION_NAME, MongoChangeDocument, MongoOutboxDocument, MongoScoreDocument,
        OUTBOX_COLLECTION_NAME,
    },
};
use crate::dao::{
    models::{ChangeLogEntity, GameMode, ReplicationLogEntity, SaveOutcome, ScoreEntity},
    score_store::ScoreStore,
    storage::StorageResult,
};

#[derive(Clone)]
pub struct MongoScoreStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    // Kept so the driver's connection pool lives as long as the database handle.
    #[allow(dead_code)]
    client: Client,
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) = self.config.open().await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        Ok(())
    }
}

impl MongoScoreStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) = config.open().await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { client, database }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let database = self.database().await;

        for mode in GameMode::ALL {
            let collection = database.collection::<mongodb::bson::Document>(mode.table_name());
            let index = IndexModel::builder()
                .keys(doc! {"level": 1, "score": 1, "time": 1})
                .options(
                    IndexOptions::builder()
                        .name(Some("score_natural_key_idx".to_owned()))
                        .unique(Some(true))
                        .build(),
                )
                .build();
            collection
                .create_index(index)
                .await
                .map_err(|source| MongoDaoError::EnsureIndex {
                    collection: mode.table_name(),
                    index: "level,score,time",
                    source,
                })?;
        }

        let outbox = database.collection::<mongodb::bson::Document>(OUTBOX_COLLECTION_NAME);
        let outbox_index = IndexModel::builder()
            .keys(doc! {"origin_node_id": 1, "synced": 1, "created_at_ms": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("outbox_pending_idx".to_owned()))
                    .build(),
            )
            .build();
        outbox
            .create_index(outbox_index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: OUTBOX_COLLECTION_NAME,
                index: "origin_node_id,synced,created_at_ms",
                source,
            })?;

        let changes = database.collection::<mongodb::bson::Document>(CHANGE_COLLECTION_NAME);
        let change_index = IndexModel::builder()
            .keys(doc! {"origin_node_id": 1, "timestamp_ms": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("change_watermark_idx".to_owned()))
                    .build(),
            )
            .build();
        changes
            .create_index(change_index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: CHANGE_COLLECTION_NAME,
                index: "origin_node_id,timestamp_ms",
                source,
            })?;

        Ok(())
    }

    async fn database(&self) -> Database {
        let guard = self.inner.state.read().await;
        guard.database.clone()
    }

    async fn score_collection(&self, mode: GameMode) -> Collection<MongoScoreDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoScoreDocument>(mode.table_name())
    }

    async fn outbox_collection(&self) -> Collection<MongoOutboxDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoOutboxDocument>(OUTBOX_COLLECTION_NAME)
    }

    async fn change_collection(&self) -> Collection<MongoChangeDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoChangeDocument>(CHANGE_COLLECTION_NAME)
    }

    async fn save_score(&self, record: ScoreEntity) -> MongoResult<SaveOutcome> {
        let table = record.mode.table_name();
        let collection = self.score_collection(record.mode).await;
        let key = doc! {"level": record.level, "score": record.score, "time": record.time};

        let existing = collection
            .find_one(key)
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: table,
                source,
            })?;
        if existing.is_some() {
            return Ok(SaveOutcome::DuplicateIgnored);
        }

        let document: MongoScoreDocument = record.into();
        match collection.insert_one(&document).await {
            Ok(_) => Ok(SaveOutcome::Saved),
            // Lost the race against a concurrent replica of the same row.
            Err(err) if is_duplicate_key(&err) => {
                debug!(collection = table, "unique index rejected concurrent duplicate");
                Ok(SaveOutcome::DuplicateIgnored)
            }
            Err(source) => Err(MongoDaoError::SaveScore {
                collection: table,
                source,
            }),
        }
    }

    async fn top_scores(&self, mode: GameMode, limit: usize) -> MongoResult<Vec<ScoreEntity>> {
        let collection = self.score_collection(mode).await;

        let documents: Vec<MongoScoreDocument> = collection
            .find(doc! {})
            .sort(doc! {"score": -1, "level": -1, "time": 1})
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: mode.table_name(),
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: mode.table_name(),
                source,
            })?;

        documents
            .into_iter()
            .map(|document| document.into_entity(mode))
            .collect()
    }

    async fn all_scores(&self) -> MongoResult<Vec<ScoreEntity>> {
        let mut rows = Vec::new();
        for mode in GameMode::ALL {
            let collection = self.score_collection(mode).await;
            let documents: Vec<MongoScoreDocument> = collection
                .find(doc! {})
                .await
                .map_err(|source| MongoDaoError::Query {
                    collection: mode.table_name(),
                    source,
                })?
                .try_collect()
                .await
                .map_err(|source| MongoDaoError::Query {
                    collection: mode.table_name(),
                    source,
                })?;
            for document in documents {
                rows.push(document.into_entity(mode)?);
            }
        }
        Ok(rows)
    }

    async fn append_outbox(&self, entry: ReplicationLogEntity) -> MongoResult<()> {
        let document: MongoOutboxDocument = entry.into();
        self.outbox_collection()
            .await
            .insert_one(&document)
            .await
            .map_err(|source| MongoDaoError::AppendOutbox { source })?;
        Ok(())
    }

    async fn pending_outbox(&self, origin_node_id: String) -> MongoResult<Vec<ReplicationLogEntity>> {
        let documents: Vec<MongoOutboxDocument> = self
            .outbox_collection()
            .await
            .find(doc! {"origin_node_id": origin_node_id, "synced": false})
            .sort(doc! {"created_at_ms": 1})
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: OUTBOX_COLLECTION_NAME,
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: OUTBOX_COLLECTION_NAME,
                source,
            })?;

        documents.into_iter().map(TryInto::try_into).collect()
    }

    async fn mark_outbox_synced(&self, id: Uuid) -> MongoResult<()> {
        self.outbox_collection()
            .await
            .update_one(
                doc! {"_id": id.to_string()},
                doc! {"$set": {"synced": true}},
            )
            .await
            .map_err(|source| MongoDaoError::MarkSynced { id, source })?;
        Ok(())
    }

    async fn append_change(&self, entry: ChangeLogEntity) -> MongoResult<()> {
        let document: MongoChangeDocument = entry.into();
        self.change_collection()
            .await
            .insert_one(&document)
            .await
            .map_err(|source| MongoDaoError::AppendChange { source })?;
        Ok(())
    }

    async fn changes_since(
        &self,
        origin_node_id: String,
        after_ms: i64,
    ) -> MongoResult<Vec<ChangeLogEntity>> {
        let documents: Vec<MongoChangeDocument> = self
            .change_collection()
            .await
            .find(doc! {"origin_node_id": origin_node_id, "timestamp_ms": {"$gt": after_ms}})
            .sort(doc! {"timestamp_ms": 1})
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: CHANGE_COLLECTION_NAME,
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: CHANGE_COLLECTION_NAME,
                source,
            })?;

        documents.into_iter().map(TryInto::try_into).collect()
    }
}

impl ScoreStore for MongoScoreStore {
    fn save_score(&self, record: ScoreEntity) -> BoxFuture<'static, StorageResult<SaveOutcome>> {
        let store = self.clone();
        Box::pin(async move { store.save_score(record).await.map_err(Into::into) })
    }

    fn top_scores(
        &self,
        mode: GameMode,
        limit: usize,
    ) -> BoxFuture<'static, StorageResult<Vec<ScoreEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.top_scores(mode, limit).await.map_err(Into::into) })
    }

    fn all_scores(&self) -> BoxFuture<'static, StorageResult<Vec<ScoreEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.all_scores().await.map_err(Into::into) })
    }

    fn append_outbox(&self, entry: ReplicationLogEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.append_outbox(entry).await.map_err(Into::into) })
    }

    fn pending_outbox(
        &self,
        origin_node_id: String,
    ) -> BoxFuture<'static, StorageResult<Vec<ReplicationLogEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .pending_outbox(origin_node_id)
                .await
                .map_err(Into::into)
        })
    }

    fn mark_outbox_synced(&self, id: Uuid) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.mark_outbox_synced(id).await.map_err(Into::into) })
    }

    fn append_change(&self, entry: ChangeLogEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.append_change(entry).await.map_err(Into::into) })
    }

    fn changes_since(
        &self,
        origin_node_id: String,
        after_ms: i64,
    ) -> BoxFuture<'static, StorageResult<Vec<ChangeLogEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .changes_since(origin_node_id, after_ms)
                .await
                .map_err(Into::into)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
