//! PostgreSQL mirror store.
//!
//! The mirror record is stored as JSONB next to a `version` column; the
//! compare-and-swap is a single `UPDATE ... WHERE version = $expected`.
//! Lifecycle events go to an append-only table with a BIGSERIAL sequence.
//!
//! This module uses dynamic queries (sqlx::query) instead of compile-time
//! checked macros (sqlx::query!) to allow compilation without DATABASE_URL.

use crate::error::StoreError;
use crate::repository::{EventRepository, MirrorRepository, Store};
use async_trait::async_trait;
use chrono::Utc;
use escrow_domain::{AgreementId, AppStatus, LifecycleEvent, MirrorRecord};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::debug;

/// Schema applied by [`PgStore::migrate`]
pub const MIGRATION_SQL: &str = include_str!("../migrations/0001_mirror.sql");

/// PostgreSQL-backed store
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    /// Create a new PostgreSQL store over an existing pool
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and build a store
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// Apply the schema (idempotent)
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION_SQL).execute(self.pool.as_ref()).await?;
        Ok(())
    }

    /// Get a reference to the underlying pool (for testing).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn version_to_db(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Serialization(format!("version {} out of range", version)))
}

fn parse_record(row: &sqlx::postgres::PgRow) -> Result<MirrorRecord, StoreError> {
    let body: serde_json::Value = row.try_get("record")?;
    let version: i64 = row.try_get("version")?;

    let mut record: MirrorRecord = serde_json::from_value(body)?;
    record.version = u64::try_from(version)
        .map_err(|_| StoreError::Serialization(format!("negative version {}", version)))?;
    Ok(record)
}

#[async_trait]
impl MirrorRepository for PgStore {
    async fn insert(&self, record: &MirrorRecord) -> Result<(), StoreError> {
        let body = serde_json::to_value(record)?;

        sqlx::query(
            r#"
            INSERT INTO agreement_mirror (agreement_id, app_status, in_flight, record, version, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.agreement_id.as_str())
        .bind(record.app_status.name())
        .bind(record.in_flight.is_some())
        .bind(body)
        .bind(version_to_db(record.version)?)
        .bind(record.updated_at)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Duplicate { .. } => StoreError::duplicate("mirror", record.agreement_id.as_str()),
            other => other,
        })?;

        Ok(())
    }

    async fn find_by_id(&self, id: &AgreementId) -> Result<Option<MirrorRecord>, StoreError> {
        let row = sqlx::query("SELECT record, version FROM agreement_mirror WHERE agreement_id = $1")
            .bind(id.as_str())
            .fetch_optional(self.pool.as_ref())
            .await?;

        row.as_ref().map(parse_record).transpose()
    }

    async fn update(
        &self,
        record: &MirrorRecord,
        expected_version: u64,
    ) -> Result<MirrorRecord, StoreError> {
        let mut next = record.clone();
        next.version = expected_version + 1;
        next.updated_at = Utc::now();
        let body = serde_json::to_value(&next)?;

        let result = sqlx::query(
            r#"
            UPDATE agreement_mirror
            SET app_status = $2, in_flight = $3, record = $4, version = $5, updated_at = $6
            WHERE agreement_id = $1 AND version = $7
            "#,
        )
        .bind(next.agreement_id.as_str())
        .bind(next.app_status.name())
        .bind(next.in_flight.is_some())
        .bind(body)
        .bind(version_to_db(next.version)?)
        .bind(next.updated_at)
        .bind(version_to_db(expected_version)?)
        .execute(self.pool.as_ref())
        .await?;

        if result.rows_affected() == 1 {
            return Ok(next);
        }

        // Lost the swap: tell NotFound apart from a moved version
        let actual = sqlx::query("SELECT version FROM agreement_mirror WHERE agreement_id = $1")
            .bind(record.agreement_id.as_str())
            .fetch_optional(self.pool.as_ref())
            .await?;

        match actual {
            None => Err(StoreError::not_found("mirror", record.agreement_id.as_str())),
            Some(row) => {
                let actual: i64 = row.try_get("version")?;
                debug!(agreement_id = %record.agreement_id, expected_version, actual, "CAS conflict");
                Err(StoreError::VersionConflict {
                    id: record.agreement_id.to_string(),
                    expected: expected_version,
                    actual: u64::try_from(actual).unwrap_or_default(),
                })
            },
        }
    }

    async fn find_in_flight(&self) -> Result<Vec<MirrorRecord>, StoreError> {
        let rows = sqlx::query("SELECT record, version FROM agreement_mirror WHERE in_flight")
            .fetch_all(self.pool.as_ref())
            .await?;

        rows.iter().map(parse_record).collect()
    }

    async fn find_by_status(&self, status: AppStatus) -> Result<Vec<MirrorRecord>, StoreError> {
        let rows = sqlx::query("SELECT record, version FROM agreement_mirror WHERE app_status = $1")
            .bind(status.name())
            .fetch_all(self.pool.as_ref())
            .await?;

        rows.iter().map(parse_record).collect()
    }
}

#[async_trait]
impl EventRepository for PgStore {
    async fn append(&self, event: &LifecycleEvent) -> Result<i64, StoreError> {
        let payload = serde_json::to_value(event)?;

        let row = sqlx::query(
            r#"
            INSERT INTO agreement_events (agreement_id, event_type, payload, occurred_at)
            VALUES ($1, $2, $3, $4)
            RETURNING seq
            "#,
        )
        .bind(event.agreement_id().as_str())
        .bind(event.event_type())
        .bind(payload)
        .bind(event.timestamp())
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(row.try_get("seq")?)
    }

    async fn find_by_agreement(&self, id: &AgreementId) -> Result<Vec<LifecycleEvent>, StoreError> {
        let rows = sqlx::query("SELECT payload FROM agreement_events WHERE agreement_id = $1 ORDER BY seq")
            .bind(id.as_str())
            .fetch_all(self.pool.as_ref())
            .await?;

        rows.iter()
            .map(|row| -> Result<LifecycleEvent, StoreError> {
                let payload: serde_json::Value = row.try_get("payload")?;
                Ok(serde_json::from_value(payload)?)
            })
            .collect()
    }

    async fn get_latest_seq(&self, id: &AgreementId) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT MAX(seq) AS seq FROM agreement_events WHERE agreement_id = $1")
            .bind(id.as_str())
            .fetch_one(self.pool.as_ref())
            .await?;

        Ok(row.try_get::<Option<i64>, _>("seq")?)
    }
}

impl Store for PgStore {
    fn mirrors(&self) -> &dyn MirrorRepository {
        self
    }

    fn events(&self) -> &dyn EventRepository {
        self
    }
}
