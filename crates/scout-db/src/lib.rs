//! Persisted entity store: the session contract consumed by the pipeline,
//! with an in-memory implementation for tests and local runs and a
//! PostgreSQL implementation for deployments.
//!
//! Sessions buffer every write. Queries always read the committed state;
//! inserts, in-place updates, deferred deletes, and run record upserts stay
//! invisible until the single [`StoreSession::save_changes`] flush lands them
//! together.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use scout_core::{Organisation, RunRecord, RunStatus};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-db";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("encoding stored value: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Opens reconciliation sessions against the persisted entity set.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn open_session(&self) -> StoreResult<Box<dyn StoreSession>>;
}

/// One unit of reconciliation work.
///
/// Entities handed to `bulk_insert` and `queue_update` must already carry
/// assigned ids; identity generation belongs to the caller.
#[async_trait]
pub trait StoreSession: Send + Sync {
    async fn find_in_progress_run(&self) -> StoreResult<Option<RunRecord>>;
    async fn latest_completed_run(&self) -> StoreResult<Option<RunRecord>>;

    /// Lazy stream over the committed organisation set.
    fn stream_organisations(&self) -> BoxStream<'_, StoreResult<Organisation>>;

    async fn bulk_insert(&self, batch: Vec<Organisation>) -> StoreResult<()>;
    async fn queue_update(&self, organisation: Organisation) -> StoreResult<()>;
    async fn defer_delete(&self, id: Uuid) -> StoreResult<()>;
    async fn store_run(&self, run: &RunRecord) -> StoreResult<()>;

    /// Flush all buffered writes in one atomic step.
    async fn save_changes(&self) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct PendingWrites {
    inserts: Vec<Organisation>,
    updates: Vec<Organisation>,
    deletes: Vec<Uuid>,
    runs: Vec<RunRecord>,
}

fn require_ids(batch: &[Organisation]) -> StoreResult<()> {
    if batch.iter().any(|organisation| organisation.id.is_none()) {
        return Err(StoreError::Invalid(
            "bulk insert requires organisations with assigned ids".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryState {
    organisations: HashMap<Uuid, Organisation>,
    runs: HashMap<Uuid, RunRecord>,
}

/// In-memory store. Committed state is shared across sessions, so it behaves
/// like the real store for everything the pipeline observes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed organisations, sorted by name.
    pub fn organisations(&self) -> Vec<Organisation> {
        let state = self.state.read().expect("state lock poisoned");
        let mut all: Vec<Organisation> = state.organisations.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Committed run records, most recently started first.
    pub fn runs(&self) -> Vec<RunRecord> {
        let state = self.state.read().expect("state lock poisoned");
        let mut all: Vec<RunRecord> = state.runs.values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn open_session(&self) -> StoreResult<Box<dyn StoreSession>> {
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            pending: Mutex::new(PendingWrites::default()),
        }))
    }
}

struct MemorySession {
    state: Arc<RwLock<MemoryState>>,
    pending: Mutex<PendingWrites>,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn find_in_progress_run(&self) -> StoreResult<Option<RunRecord>> {
        let state = self.state.read().expect("state lock poisoned");
        Ok(state
            .runs
            .values()
            .find(|run| run.status == RunStatus::InProgress)
            .cloned())
    }

    async fn latest_completed_run(&self) -> StoreResult<Option<RunRecord>> {
        let state = self.state.read().expect("state lock poisoned");
        Ok(state
            .runs
            .values()
            .filter(|run| run.status == RunStatus::Completed)
            .max_by_key(|run| run.finished_at)
            .cloned())
    }

    fn stream_organisations(&self) -> BoxStream<'_, StoreResult<Organisation>> {
        let organisations: Vec<Organisation> = {
            let state = self.state.read().expect("state lock poisoned");
            state.organisations.values().cloned().collect()
        };
        stream::iter(organisations.into_iter().map(Ok)).boxed()
    }

    async fn bulk_insert(&self, batch: Vec<Organisation>) -> StoreResult<()> {
        require_ids(&batch)?;
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .inserts
            .extend(batch);
        Ok(())
    }

    async fn queue_update(&self, organisation: Organisation) -> StoreResult<()> {
        require_ids(std::slice::from_ref(&organisation))?;
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .updates
            .push(organisation);
        Ok(())
    }

    async fn defer_delete(&self, id: Uuid) -> StoreResult<()> {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .deletes
            .push(id);
        Ok(())
    }

    async fn store_run(&self, run: &RunRecord) -> StoreResult<()> {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .runs
            .push(run.clone());
        Ok(())
    }

    async fn save_changes(&self) -> StoreResult<()> {
        let pending = {
            let mut guard = self.pending.lock().expect("pending lock poisoned");
            std::mem::take(&mut *guard)
        };
        debug!(
            inserts = pending.inserts.len(),
            updates = pending.updates.len(),
            deletes = pending.deletes.len(),
            runs = pending.runs.len(),
            "flushing session writes"
        );

        let mut state = self.state.write().expect("state lock poisoned");
        for id in pending.deletes {
            state.organisations.remove(&id);
        }
        for organisation in pending.inserts.into_iter().chain(pending.updates) {
            let id = organisation.id.expect("ids validated when queued");
            state.organisations.insert(id, organisation);
        }
        for run in pending.runs {
            state.runs.insert(run.id, run);
        }
        Ok(())
    }
}

/// PostgreSQL store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn open_session(&self) -> StoreResult<Box<dyn StoreSession>> {
        Ok(Box::new(PgSession {
            pool: self.pool.clone(),
            pending: Mutex::new(PendingWrites::default()),
        }))
    }
}

struct PgSession {
    pool: PgPool,
    pending: Mutex<PendingWrites>,
}

fn organisation_from_row(row: &PgRow) -> StoreResult<Organisation> {
    Ok(Organisation {
        id: Some(row.try_get("id")?),
        name: row.try_get("name")?,
        county: row.try_get("county")?,
        town_cities: row.try_get("town_cities")?,
        type_and_ratings: row.try_get("type_and_ratings")?,
        routes: row.try_get("routes")?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<RunRecord> {
    let status_text: String = row.try_get("status")?;
    let status =
        RunStatus::from_str(&status_text).map_err(|err| StoreError::Invalid(err.to_string()))?;
    let total: i64 = row.try_get("total_records_processed")?;
    let added: serde_json::Value = row.try_get("added")?;
    let updated: serde_json::Value = row.try_get("updated")?;
    let deleted: serde_json::Value = row.try_get("deleted")?;
    let errors: serde_json::Value = row.try_get("errors")?;

    Ok(RunRecord {
        id: row.try_get("id")?,
        status,
        file_name: row.try_get("file_name")?,
        source_last_update: row.try_get("source_last_update")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        total_records_processed: total.max(0) as usize,
        added: serde_json::from_value(added)?,
        updated: serde_json::from_value(updated)?,
        deleted: serde_json::from_value(deleted)?,
        errors: serde_json::from_value(errors)?,
    })
}

const RUN_COLUMNS: &str = "id, status, file_name, source_last_update, started_at, finished_at, \
                           total_records_processed, added, updated, deleted, errors";

#[async_trait]
impl StoreSession for PgSession {
    async fn find_in_progress_run(&self) -> StoreResult<Option<RunRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM run_records WHERE status = $1 LIMIT 1"
        ))
        .bind(RunStatus::InProgress.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn latest_completed_run(&self) -> StoreResult<Option<RunRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM run_records WHERE status = $1 \
             ORDER BY finished_at DESC NULLS LAST LIMIT 1"
        ))
        .bind(RunStatus::Completed.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    fn stream_organisations(&self) -> BoxStream<'_, StoreResult<Organisation>> {
        sqlx::query(
            r#"
            SELECT id, name, county, town_cities, type_and_ratings, routes
              FROM organisations
            "#,
        )
        .fetch(&self.pool)
        .map(|row| match row {
            Ok(row) => organisation_from_row(&row),
            Err(err) => Err(StoreError::Database(err)),
        })
        .boxed()
    }

    async fn bulk_insert(&self, batch: Vec<Organisation>) -> StoreResult<()> {
        require_ids(&batch)?;
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .inserts
            .extend(batch);
        Ok(())
    }

    async fn queue_update(&self, organisation: Organisation) -> StoreResult<()> {
        require_ids(std::slice::from_ref(&organisation))?;
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .updates
            .push(organisation);
        Ok(())
    }

    async fn defer_delete(&self, id: Uuid) -> StoreResult<()> {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .deletes
            .push(id);
        Ok(())
    }

    async fn store_run(&self, run: &RunRecord) -> StoreResult<()> {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .runs
            .push(run.clone());
        Ok(())
    }

    async fn save_changes(&self) -> StoreResult<()> {
        let pending = {
            let mut guard = self.pending.lock().expect("pending lock poisoned");
            std::mem::take(&mut *guard)
        };
        debug!(
            inserts = pending.inserts.len(),
            updates = pending.updates.len(),
            deletes = pending.deletes.len(),
            runs = pending.runs.len(),
            "flushing session writes"
        );

        let mut tx = self.pool.begin().await?;

        if !pending.deletes.is_empty() {
            sqlx::query("DELETE FROM organisations WHERE id = ANY($1)")
                .bind(&pending.deletes)
                .execute(&mut *tx)
                .await?;
        }

        for organisation in &pending.inserts {
            sqlx::query(
                r#"
                INSERT INTO organisations (id, name, county, town_cities, type_and_ratings, routes)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(organisation.id)
            .bind(&organisation.name)
            .bind(&organisation.county)
            .bind(&organisation.town_cities)
            .bind(&organisation.type_and_ratings)
            .bind(&organisation.routes)
            .execute(&mut *tx)
            .await?;
        }

        for organisation in &pending.updates {
            sqlx::query(
                r#"
                UPDATE organisations
                   SET county = $2,
                       town_cities = $3,
                       type_and_ratings = $4,
                       routes = $5
                 WHERE id = $1
                "#,
            )
            .bind(organisation.id)
            .bind(&organisation.county)
            .bind(&organisation.town_cities)
            .bind(&organisation.type_and_ratings)
            .bind(&organisation.routes)
            .execute(&mut *tx)
            .await?;
        }

        for run in &pending.runs {
            sqlx::query(
                r#"
                INSERT INTO run_records (id, status, file_name, source_last_update, started_at,
                                         finished_at, total_records_processed, added, updated,
                                         deleted, errors)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (id) DO UPDATE
                   SET status = EXCLUDED.status,
                       file_name = EXCLUDED.file_name,
                       source_last_update = EXCLUDED.source_last_update,
                       started_at = EXCLUDED.started_at,
                       finished_at = EXCLUDED.finished_at,
                       total_records_processed = EXCLUDED.total_records_processed,
                       added = EXCLUDED.added,
                       updated = EXCLUDED.updated,
                       deleted = EXCLUDED.deleted,
                       errors = EXCLUDED.errors
                "#,
            )
            .bind(run.id)
            .bind(run.status.as_str())
            .bind(&run.file_name)
            .bind(run.source_last_update)
            .bind(run.started_at)
            .bind(run.finished_at)
            .bind(run.total_records_processed as i64)
            .bind(serde_json::to_value(&run.added)?)
            .bind(serde_json::to_value(&run.updated)?)
            .bind(serde_json::to_value(&run.deleted)?)
            .bind(serde_json::to_value(&run.errors)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use futures::TryStreamExt;

    fn organisation(name: &str, id: Option<Uuid>) -> Organisation {
        let mut organisation = Organisation::new(name);
        organisation.id = id;
        organisation.county = "Kent".to_string();
        organisation.town_cities = vec!["Dover".to_string()];
        organisation.type_and_ratings = vec!["Worker (A rating)".to_string()];
        organisation.routes = vec!["Skilled Worker".to_string()];
        organisation
    }

    #[tokio::test]
    async fn pending_work_is_invisible_until_save_changes() {
        let store = MemoryStore::new();
        let session = store.open_session().await.expect("session");

        session
            .bulk_insert(vec![organisation("Acme Ltd", Some(Uuid::new_v4()))])
            .await
            .expect("insert");

        let before: Vec<Organisation> = session
            .stream_organisations()
            .try_collect()
            .await
            .expect("stream");
        assert!(before.is_empty());

        session.save_changes().await.expect("save");

        let after: Vec<Organisation> = session
            .stream_organisations()
            .try_collect()
            .await
            .expect("stream");
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].name, "Acme Ltd");
    }

    #[tokio::test]
    async fn save_changes_applies_inserts_updates_and_deletes_together() {
        let store = MemoryStore::new();
        let keep_id = Uuid::new_v4();
        let drop_id = Uuid::new_v4();

        let seed = store.open_session().await.expect("session");
        seed.bulk_insert(vec![
            organisation("Keep Ltd", Some(keep_id)),
            organisation("Drop Ltd", Some(drop_id)),
        ])
        .await
        .expect("seed insert");
        seed.save_changes().await.expect("seed save");

        let session = store.open_session().await.expect("session");
        let mut changed = organisation("Keep Ltd", Some(keep_id));
        changed.county = "Essex".to_string();
        session.queue_update(changed).await.expect("update");
        session.defer_delete(drop_id).await.expect("delete");
        session
            .bulk_insert(vec![organisation("New Ltd", Some(Uuid::new_v4()))])
            .await
            .expect("insert");

        assert_eq!(store.organisations().len(), 2);
        session.save_changes().await.expect("save");

        let all = store.organisations();
        let names: Vec<&str> = all.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["Keep Ltd", "New Ltd"]);
        assert_eq!(all[0].county, "Essex");
    }

    #[tokio::test]
    async fn bulk_insert_rejects_unassigned_ids() {
        let store = MemoryStore::new();
        let session = store.open_session().await.expect("session");

        let err = session
            .bulk_insert(vec![organisation("Acme Ltd", None)])
            .await
            .expect_err("must reject");
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn run_records_round_trip_through_the_session() {
        let store = MemoryStore::new();
        let session = store.open_session().await.expect("session");

        assert!(session
            .find_in_progress_run()
            .await
            .expect("query")
            .is_none());

        let run = RunRecord::begin();
        session.store_run(&run).await.expect("store run");
        session.save_changes().await.expect("save");

        let found = session
            .find_in_progress_run()
            .await
            .expect("query")
            .expect("present");
        assert_eq!(found.id, run.id);
        assert_eq!(found.status, RunStatus::InProgress);
    }

    #[tokio::test]
    async fn latest_completed_run_picks_the_newest_finish_time() {
        let store = MemoryStore::new();
        let session = store.open_session().await.expect("session");

        let mut older = RunRecord::begin();
        older.status = RunStatus::Completed;
        older.finished_at = Some(Utc::now() - Duration::hours(2));
        let mut newer = RunRecord::begin();
        newer.status = RunStatus::Completed;
        newer.finished_at = Some(Utc::now());
        let mut failed = RunRecord::begin();
        failed.status = RunStatus::Failed;
        failed.finished_at = Some(Utc::now() + Duration::hours(1));

        session.store_run(&older).await.expect("store");
        session.store_run(&newer).await.expect("store");
        session.store_run(&failed).await.expect("store");
        session.save_changes().await.expect("save");

        let latest = session
            .latest_completed_run()
            .await
            .expect("query")
            .expect("present");
        assert_eq!(latest.id, newer.id);
    }

    #[tokio::test]
    async fn runs_never_stored_leave_no_trace() {
        let store = MemoryStore::new();
        let session = store.open_session().await.expect("session");

        // A record that is never handed to store_run is simply dropped.
        let _discarded = RunRecord::begin();
        session.save_changes().await.expect("save");

        assert!(store.runs().is_empty());
    }
}
