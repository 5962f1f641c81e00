//! `PostgreSQL` event store for the MedTour reservation core.
//!
//! [`PostgresEventStore`] implements the `EventStore` trait from `medtour-core`
//! on a single `events` table:
//!
//! - Optimistic concurrency on `(aggregate_id, sequence_number)`
//! - Atomic batch appends inside one transaction
//! - A global commit order exposed through `global_position`
//! - Connection pooling through sqlx
//!
//! # Commit order
//!
//! Appends take a transaction-scoped advisory lock before allocating
//! positions, so positions become visible in increasing order and a reader
//! resuming from the last position it saw never skips a late commit.
//!
//! # Example
//!
//! ```ignore
//! use medtour_postgres::PostgresEventStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let event_store = PostgresEventStore::from_url("postgres://localhost/medtour", 10).await?;
//!     event_store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use medtour_core::event::{DomainEvent, StoredEvent};
use medtour_core::event_store::{EventStore, EventStoreError, validate_batch};
use medtour_core::stream::{AggregateId, GlobalPosition, Version};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;

/// Advisory lock key serializing appends ("MTEV").
const APPEND_LOCK_KEY: i64 = 0x4D54_4556;

/// `PostgreSQL`-backed event store.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the connection fails.
    pub async fn from_url(database_url: &str, max_connections: u32) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Create the `events` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Check that the database answers.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the probe query fails.
    pub async fn ping(&self) -> Result<(), EventStoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn append(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<DomainEvent>,
    ) -> Result<Version, EventStoreError> {
        validate_batch(&aggregate_id, expected_version, &events)?;

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        let current: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;
        let current = to_version(current)?;

        if current != expected_version {
            tracing::debug!(
                aggregate_id = %aggregate_id,
                expected = %expected_version,
                actual = %current,
                "Append rejected by version check"
            );
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual: current,
            });
        }

        let mut new_version = expected_version;
        for event in &events {
            sqlx::query(
                r"
                INSERT INTO events (aggregate_id, sequence_number, event_type, payload, occurred_at)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(event.aggregate_id.as_str())
            .bind(to_db(event.sequence_number.value())?)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(event.occurred_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db_err) = &e {
                    if db_err.is_unique_violation() {
                        return EventStoreError::ConcurrencyConflict {
                            aggregate_id: aggregate_id.clone(),
                            expected: expected_version,
                            actual: event.sequence_number,
                        };
                    }
                }
                db_error(e)
            })?;
            new_version = event.sequence_number;
        }

        tx.commit().await.map_err(db_error)?;

        tracing::debug!(
            aggregate_id = %aggregate_id,
            count = events.len(),
            version = %new_version,
            "Events appended"
        );
        Ok(new_version)
    }

    async fn load(
        &self,
        aggregate_id: AggregateId,
        from_version: Option<Version>,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let from = to_db(from_version.map_or(0, Version::value))?;
        let rows = sqlx::query(
            r"
            SELECT aggregate_id, sequence_number, event_type, payload, occurred_at
            FROM events
            WHERE aggregate_id = $1 AND sequence_number >= $2
            ORDER BY sequence_number ASC
            ",
        )
        .bind(aggregate_id.as_str())
        .bind(from)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_event).collect()
    }

    async fn page(
        &self,
        after: GlobalPosition,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r"
            SELECT global_position, aggregate_id, sequence_number, event_type, payload, occurred_at
            FROM events
            WHERE global_position > $1
            ORDER BY global_position ASC
            LIMIT $2
            ",
        )
        .bind(to_db(after.value())?)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                let position: i64 = row.try_get("global_position").map_err(db_error)?;
                Ok(StoredEvent {
                    position: GlobalPosition::new(from_db(position)?),
                    event: row_to_event(row)?,
                })
            })
            .collect()
    }
}

fn row_to_event(row: &PgRow) -> Result<DomainEvent, EventStoreError> {
    let aggregate_id: String = row.try_get("aggregate_id").map_err(db_error)?;
    let sequence_number: i64 = row.try_get("sequence_number").map_err(db_error)?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(db_error)?;
    Ok(DomainEvent {
        aggregate_id: AggregateId::new(aggregate_id),
        sequence_number: to_version(sequence_number)?,
        event_type: row.try_get("event_type").map_err(db_error)?,
        payload: row.try_get("payload").map_err(db_error)?,
        occurred_at,
    })
}

fn db_error(e: sqlx::Error) -> EventStoreError {
    EventStoreError::DatabaseError(e.to_string())
}

fn to_db(value: u64) -> Result<i64, EventStoreError> {
    i64::try_from(value)
        .map_err(|_| EventStoreError::SerializationError(format!("{value} does not fit in BIGINT")))
}

fn from_db(value: i64) -> Result<u64, EventStoreError> {
    u64::try_from(value)
        .map_err(|_| EventStoreError::SerializationError(format!("negative value {value} in events table")))
}

fn to_version(value: i64) -> Result<Version, EventStoreError> {
    from_db(value).map(Version::new)
}

impl EventStore for PostgresEventStore {
    fn append_events(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<DomainEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, EventStoreError>> + Send + '_>> {
        Box::pin(self.append(aggregate_id, expected_version, events))
    }

    fn load_events(
        &self,
        aggregate_id: AggregateId,
        from_version: Option<Version>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DomainEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(self.load(aggregate_id, from_version))
    }

    fn read_all(
        &self,
        after: GlobalPosition,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(self.page(after, limit))
    }
}
