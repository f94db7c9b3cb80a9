//! Postgres-backed event store implementation.
//!
//! ## Schema
//!
//! One table, created by [`PostgresEventStore::migrate`]:
//!
//! - `global_position BIGSERIAL PRIMARY KEY`: store-wide order
//! - `UNIQUE (aggregate_id, sequence_number)`: the last line of defence for
//!   optimistic concurrency
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `Concurrency` | A concurrent append won the race for a sequence number |
//! | Database (check constraint violation) | `23514` | `Storage` | Invalid data (e.g. sequence_number <= 0) |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! ## Global order
//!
//! `BIGSERIAL` values are handed out at insert time, not at commit time. To
//! keep `read_all` gap-free for tailing readers, every append takes the
//! transaction-scoped advisory lock [`APPEND_LOCK_KEY`] before it reads the
//! stream version, so appends commit one at a time and positions become
//! visible in ascending order. Writers that insert into the table without
//! taking the lock void that guarantee.
//!
//! ## Timestamps
//!
//! `TIMESTAMPTZ` stores microseconds; sub-microsecond precision of
//! `recorded_at` is truncated on the way in.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{Span, debug, instrument, warn};

use chronicle_core::{AggregateId, ExpectedVersion};
use chronicle_events::{EventEnvelope, RecordedEvent};

use super::cursor::{CursorKey, PagedCursor};
use super::r#trait::{
    ConcurrencyConflict, EventStore, EventStoreError, EventStream, NewEvent, empty_stream,
};
use crate::config::{MissingStreamPolicy, StoreConfig};

/// Advisory lock key serializing appends to `chronicle_events`.
pub const APPEND_LOCK_KEY: i64 = 0x6368_726f_6e69_636c;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chronicle_events (
    global_position BIGSERIAL PRIMARY KEY,
    aggregate_id    TEXT        NOT NULL,
    sequence_number BIGINT      NOT NULL CHECK (sequence_number > 0),
    event_type      TEXT        NOT NULL,
    recorded_at     TIMESTAMPTZ NOT NULL,
    payload         JSONB       NOT NULL,
    committed_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (aggregate_id, sequence_number)
)
"#;

/// Postgres-backed append-only event store.
///
/// ## Sync and async use
///
/// The async inherent methods (`append_events`, `load_stream_page`, ...) can be
/// awaited directly. The [`EventStore`] impl drives them on the runtime
/// `Handle` given at construction, so it must be called from a thread that is
/// not itself running async tasks (e.g. inside `spawn_blocking` or a plain
/// worker thread).
///
/// ## Optimistic Concurrency
///
/// `append_events` runs one transaction:
/// 1. take the append advisory lock
/// 2. read `MAX(sequence_number)` for the aggregate
/// 3. compare with `expected_version`
/// 4. insert the batch with consecutive sequence numbers
///
/// If a writer that skips the lock commits between 2 and 4, the unique
/// constraint on `(aggregate_id, sequence_number)` fails the insert, the
/// batch is rolled back, and the conflict reports the stream version read
/// after the rollback.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    runtime: Handle,
    config: StoreConfig,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self::with_config(pool, runtime, StoreConfig::default())
    }

    pub fn with_config(pool: PgPool, runtime: Handle, config: StoreConfig) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
            config: config.normalized(),
        }
    }

    /// Connect using `config.database_url`.
    pub async fn connect(config: StoreConfig) -> Result<Self, EventStoreError> {
        let url = config
            .database_url
            .clone()
            .ok_or_else(|| EventStoreError::storage("DATABASE_URL is not configured"))?;
        let pool = PgPool::connect(&url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::with_config(pool, Handle::current(), config))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the events table if it does not exist.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Append events to a stream with optimistic concurrency control.
    #[instrument(
        skip(self, events),
        fields(
            aggregate_id = %aggregate_id,
            event_count = events.len(),
            expected_version = %expected_version,
            committed_version = tracing::field::Empty
        ),
        err(level = "warn")
    )]
    pub async fn append_events(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        if events.is_empty() {
            return Err(EventStoreError::EmptyAppend);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("append_lock", e))?;

        let current = current_version(&mut tx, aggregate_id).await?;
        if !expected_version.matches(current) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            warn!(actual = current, "append rejected: concurrency conflict");
            return Err(ConcurrencyConflict {
                aggregate_id: aggregate_id.clone(),
                expected: expected_version,
                actual: current,
            }
            .into());
        }

        let mut committed = Vec::with_capacity(events.len());
        let mut sequence = current;

        for event in events {
            sequence += 1;
            let inserted = sqlx::query(
                r#"
                INSERT INTO chronicle_events (
                    aggregate_id,
                    sequence_number,
                    event_type,
                    recorded_at,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5)
                RETURNING global_position
                "#,
            )
            .bind(aggregate_id.as_str())
            .bind(to_db(sequence)?)
            .bind(&event.event_type)
            .bind(event.recorded_at)
            .bind(JsonValue::Object(event.payload.clone()))
            .fetch_one(&mut *tx)
            .await;

            let row = match inserted {
                Ok(row) => row,
                Err(e) if is_unique_violation(&e) => {
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    let actual = self.load_stream_version(aggregate_id).await?.unwrap_or(0);
                    warn!(actual, "append rejected: concurrent insert");
                    return Err(ConcurrencyConflict {
                        aggregate_id: aggregate_id.clone(),
                        expected: expected_version,
                        actual,
                    }
                    .into());
                }
                Err(e) => return Err(map_sqlx_error("insert_event", e)),
            };

            let position: i64 = row
                .try_get("global_position")
                .map_err(|e| map_sqlx_error("read_global_position", e))?;

            committed.push(EventEnvelope::new(
                aggregate_id.clone(),
                sequence,
                from_db(position)?,
                event.event_type,
                event.recorded_at,
                event.payload,
            ));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed_version", sequence);
        debug!(version = sequence, "appended events");
        Ok(committed)
    }

    /// Up to `limit` envelopes of one aggregate with `sequence_number > after`.
    pub async fn load_stream_page(
        &self,
        aggregate_id: &AggregateId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT global_position, aggregate_id, sequence_number, event_type, recorded_at, payload
            FROM chronicle_events
            WHERE aggregate_id = $1 AND sequence_number > $2
            ORDER BY sequence_number ASC
            LIMIT $3
            "#,
        )
        .bind(aggregate_id.as_str())
        .bind(to_db(after)?)
        .bind(to_db(limit as u64)?)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream_page", e))?;

        rows.iter().map(envelope_from_row).collect()
    }

    /// Up to `limit` envelopes with `global_position > after`.
    pub async fn load_all_page(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT global_position, aggregate_id, sequence_number, event_type, recorded_at, payload
            FROM chronicle_events
            WHERE global_position > $1
            ORDER BY global_position ASC
            LIMIT $2
            "#,
        )
        .bind(to_db(after)?)
        .bind(to_db(limit as u64)?)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_all_page", e))?;

        rows.iter().map(envelope_from_row).collect()
    }

    /// Current stream version, `None` if the aggregate has no events.
    pub async fn load_stream_version(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Option<u64>, EventStoreError> {
        let row = sqlx::query(
            "SELECT MAX(sequence_number) AS version FROM chronicle_events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream_version", e))?;

        let version: Option<i64> = row
            .try_get("version")
            .map_err(|e| map_sqlx_error("load_stream_version", e))?;
        version.map(from_db).transpose()
    }

    /// Highest global position committed so far (0 when empty).
    pub async fn load_head_position(&self) -> Result<u64, EventStoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(global_position), 0) AS head FROM chronicle_events")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_head_position", e))?;
        let head: i64 = row
            .try_get("head")
            .map_err(|e| map_sqlx_error("load_head_position", e))?;
        from_db(head)
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        self.runtime
            .block_on(self.append_events(aggregate_id, expected_version, events))
    }

    fn read_stream(
        &self,
        aggregate_id: &AggregateId,
        from_version: u64,
    ) -> Result<EventStream<'_>, EventStoreError> {
        let version = match self.runtime.block_on(self.load_stream_version(aggregate_id))? {
            Some(v) => v,
            None => {
                return match self.config.missing_streams {
                    MissingStreamPolicy::Error => Err(EventStoreError::StreamNotFound(aggregate_id.clone())),
                    MissingStreamPolicy::Empty => Ok(empty_stream()),
                };
            }
        };

        let aggregate_id = aggregate_id.clone();
        let cursor = PagedCursor::new(
            CursorKey::Sequence,
            from_version,
            version,
            self.config.page_size,
            move |after, limit| {
                self.runtime
                    .block_on(self.load_stream_page(&aggregate_id, after, limit))
            },
        );
        Ok(Box::new(cursor))
    }

    fn read_all(&self, from_position: u64) -> Result<EventStream<'_>, EventStoreError> {
        let head = self.runtime.block_on(self.load_head_position())?;
        let cursor = PagedCursor::new(
            CursorKey::Global,
            from_position,
            head,
            self.config.page_size,
            move |after, limit| self.runtime.block_on(self.load_all_page(after, limit)),
        );
        Ok(Box::new(cursor))
    }

    fn stream_version(&self, aggregate_id: &AggregateId) -> Result<Option<u64>, EventStoreError> {
        self.runtime.block_on(self.load_stream_version(aggregate_id))
    }
}

async fn current_version(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: &AggregateId,
) -> Result<u64, EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(sequence_number), 0) AS current_version
        FROM chronicle_events
        WHERE aggregate_id = $1
        "#,
    )
    .bind(aggregate_id.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("current_version", e))?;

    let version: i64 = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("current_version", e))?;
    from_db(version)
}

fn envelope_from_row(row: &sqlx::postgres::PgRow) -> Result<RecordedEvent, EventStoreError> {
    let read = |e: sqlx::Error| map_sqlx_error("decode_row", e);

    let position: i64 = row.try_get("global_position").map_err(read)?;
    let aggregate_id: String = row.try_get("aggregate_id").map_err(read)?;
    let sequence: i64 = row.try_get("sequence_number").map_err(read)?;
    let event_type: String = row.try_get("event_type").map_err(read)?;
    let recorded_at: DateTime<Utc> = row.try_get("recorded_at").map_err(read)?;
    let payload: JsonValue = row.try_get("payload").map_err(read)?;

    let JsonValue::Object(payload) = payload else {
        return Err(EventStoreError::storage(format!(
            "payload at global position {position} is not a JSON object"
        )));
    };
    let aggregate_id = AggregateId::parse(aggregate_id)
        .map_err(|e| EventStoreError::storage(format!("bad aggregate_id in row: {e}")))?;

    Ok(EventEnvelope::new(
        aggregate_id,
        from_db(sequence)?,
        from_db(position)?,
        event_type,
        recorded_at,
        payload,
    ))
}

fn to_db(value: u64) -> Result<i64, EventStoreError> {
    i64::try_from(value).map_err(|_| EventStoreError::storage(format!("{value} exceeds BIGINT")))
}

fn from_db(value: i64) -> Result<u64, EventStoreError> {
    u64::try_from(value).map_err(|_| EventStoreError::storage(format!("negative position {value}")))
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            EventStoreError::storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::storage(format!("connection pool closed in {operation}"))
        }
        other => EventStoreError::storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    //! Run with a disposable database:
    //! `DATABASE_URL=postgres://... cargo test -p chronicle-infra -- --ignored`

    use chronicle_events::Payload;
    use serde_json::json;

    use super::*;

    async fn store() -> PostgresEventStore {
        let config = StoreConfig::from_env().with_page_size(2);
        let store = PostgresEventStore::connect(config).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn event(n: u64) -> NewEvent {
        let mut payload = Payload::new();
        payload.insert("n".into(), json!(n));
        NewEvent::new("pg.tested", Utc::now(), payload)
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn append_and_page_through_stream() {
        let store = store().await;
        let a = AggregateId::new();

        let committed = store
            .append_events(&a, ExpectedVersion::Exact(0), vec![event(1), event(2), event(3)])
            .await
            .unwrap();
        assert_eq!(committed.last().unwrap().sequence_number(), 3);

        let first = store.load_stream_page(&a, 0, 2).await.unwrap();
        let second = store.load_stream_page(&a, 2, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload()["n"], json!(3));
        assert_eq!(store.load_stream_version(&a).await.unwrap(), Some(3));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn stale_version_conflicts() {
        let store = store().await;
        let a = AggregateId::new();
        store
            .append_events(&a, ExpectedVersion::Exact(0), vec![event(1)])
            .await
            .unwrap();

        let err = store
            .append_events(&a, ExpectedVersion::Exact(0), vec![event(2)])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.load_stream_version(&a).await.unwrap(), Some(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires DATABASE_URL"]
    async fn concurrent_appends_become_visible_in_position_order() {
        let store = store().await;
        let head = store.load_head_position().await.unwrap();

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let a = AggregateId::new();
                    for n in 0..5 {
                        store
                            .append_events(&a, ExpectedVersion::Exact(n), vec![event(n)])
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();

        // Every page read while the writers run must extend the previous one
        // without skipping a position.
        let mut after = head;
        let mut seen = 0;
        while seen < 40 {
            for envelope in store.load_all_page(after, 16).await.unwrap() {
                assert_eq!(envelope.global_position(), after + 1);
                after = envelope.global_position();
                seen += 1;
            }
            tokio::task::yield_now().await;
        }
        for writer in writers {
            writer.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires DATABASE_URL"]
    async fn unlocked_writer_race_reports_the_committed_version() {
        let store = store().await;
        let a = AggregateId::new();

        // A writer that skips the append lock holds sequence 1 and 2 open.
        let mut rogue = store.pool().begin().await.unwrap();
        for seq in 1..=2i64 {
            sqlx::query(
                "INSERT INTO chronicle_events (aggregate_id, sequence_number, event_type, recorded_at, payload) \
                 VALUES ($1, $2, 'pg.rogue', now(), '{}'::jsonb)",
            )
            .bind(a.as_str())
            .bind(seq)
            .execute(&mut *rogue)
            .await
            .unwrap();
        }

        let append = {
            let store = store.clone();
            let a = a.clone();
            tokio::spawn(async move {
                store
                    .append_events(&a, ExpectedVersion::Exact(0), vec![event(1)])
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        rogue.commit().await.unwrap();

        match append.await.unwrap().unwrap_err() {
            EventStoreError::Concurrency(conflict) => assert_eq!(conflict.actual, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires DATABASE_URL"]
    async fn sync_trait_reads_from_blocking_context() {
        let store = store().await;
        let a = AggregateId::new();
        store
            .append_events(&a, ExpectedVersion::Exact(0), vec![event(1), event(2), event(3)])
            .await
            .unwrap();

        let seqs = tokio::task::spawn_blocking(move || {
            super::super::collect_stream(store.read_stream(&a, 1).unwrap())
                .unwrap()
                .iter()
                .map(|e| e.sequence_number())
                .collect::<Vec<_>>()
        })
        .await
        .unwrap();
        assert_eq!(seqs, vec![2, 3]);
    }
}
