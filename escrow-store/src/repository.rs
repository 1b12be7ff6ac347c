//! Repository trait definitions (Ports)
//!
//! These traits define the storage interface for the mirror store.
//! Implementations can be PostgreSQL, in-memory, or mock for testing.

use crate::error::StoreError;
use async_trait::async_trait;
use escrow_domain::{AgreementId, AppStatus, LifecycleEvent, MirrorRecord};

/// Repository for mirror records
///
/// Every write after the initial insert goes through [`MirrorRepository::update`],
/// a compare-and-swap keyed by agreement id and record version.
#[async_trait]
pub trait MirrorRepository: Send + Sync {
    /// Insert a new record (version must be 0)
    ///
    /// Fails with `StoreError::Duplicate` if the agreement already exists.
    async fn insert(&self, record: &MirrorRecord) -> Result<(), StoreError>;

    /// Find a record by agreement id
    async fn find_by_id(&self, id: &AgreementId) -> Result<Option<MirrorRecord>, StoreError>;

    /// Compare-and-swap: write `record` only if the stored version equals
    /// `expected_version`. Returns the stored record with its bumped version.
    ///
    /// Fails with `StoreError::VersionConflict` when the version moved on and
    /// `StoreError::NotFound` when the record does not exist.
    async fn update(
        &self,
        record: &MirrorRecord,
        expected_version: u64,
    ) -> Result<MirrorRecord, StoreError>;

    /// All records that carry an in-flight marker
    async fn find_in_flight(&self) -> Result<Vec<MirrorRecord>, StoreError>;

    /// All records with the given status
    async fn find_by_status(&self, status: AppStatus) -> Result<Vec<MirrorRecord>, StoreError>;
}

/// Repository for lifecycle events (append-only)
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Append an event to the log, returning its sequence number
    async fn append(&self, event: &LifecycleEvent) -> Result<i64, StoreError>;

    /// Load all events for an agreement (in order)
    async fn find_by_agreement(&self, id: &AgreementId) -> Result<Vec<LifecycleEvent>, StoreError>;

    /// Get the latest event sequence number for an agreement
    async fn get_latest_seq(&self, id: &AgreementId) -> Result<Option<i64>, StoreError>;
}

/// Combined store interface
pub trait Store: Send + Sync {
    /// Get mirror repository
    fn mirrors(&self) -> &dyn MirrorRepository;

    /// Get event repository
    fn events(&self) -> &dyn EventRepository;
}
