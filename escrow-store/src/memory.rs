//! In-memory store implementation
//!
//! Used for testing and development without a database.
//! Thread-safe using RwLock for concurrent access; the compare-and-swap runs
//! under the write lock so concurrent writers serialize on it.

use crate::error::StoreError;
use crate::repository::{EventRepository, MirrorRepository, Store};
use async_trait::async_trait;
use chrono::Utc;
use escrow_domain::{AgreementId, AppStatus, LifecycleEvent, MirrorRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-memory store for testing
pub struct MemoryStore {
    mirrors: RwLock<HashMap<AgreementId, MirrorRecord>>,
    events: RwLock<Vec<StoredEvent>>,
    event_seq: AtomicI64,
}

/// Event with sequence number
struct StoredEvent {
    seq: i64,
    event: LifecycleEvent,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Database("in-memory store lock poisoned".to_string())
}

impl MemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            mirrors: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            event_seq: AtomicI64::new(0),
        }
    }

    fn read_mirrors(
        &self,
    ) -> Result<RwLockReadGuard<'_, HashMap<AgreementId, MirrorRecord>>, StoreError> {
        self.mirrors.read().map_err(poisoned)
    }

    fn write_mirrors(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<AgreementId, MirrorRecord>>, StoreError> {
        self.mirrors.write().map_err(poisoned)
    }

    /// Get the number of mirror records
    pub fn mirror_count(&self) -> usize {
        self.mirrors.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Get the number of events
    pub fn event_count(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Mirror Repository
// =============================================================================

#[async_trait]
impl MirrorRepository for MemoryStore {
    async fn insert(&self, record: &MirrorRecord) -> Result<(), StoreError> {
        let mut mirrors = self.write_mirrors()?;
        if mirrors.contains_key(&record.agreement_id) {
            return Err(StoreError::duplicate("mirror", record.agreement_id.as_str()));
        }
        mirrors.insert(record.agreement_id.clone(), record.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &AgreementId) -> Result<Option<MirrorRecord>, StoreError> {
        Ok(self.read_mirrors()?.get(id).cloned())
    }

    async fn update(
        &self,
        record: &MirrorRecord,
        expected_version: u64,
    ) -> Result<MirrorRecord, StoreError> {
        let mut mirrors = self.write_mirrors()?;
        let stored = mirrors
            .get_mut(&record.agreement_id)
            .ok_or_else(|| StoreError::not_found("mirror", record.agreement_id.as_str()))?;

        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: record.agreement_id.to_string(),
                expected: expected_version,
                actual: stored.version,
            });
        }

        let mut next = record.clone();
        next.version = expected_version + 1;
        next.updated_at = Utc::now();
        *stored = next.clone();

        Ok(next)
    }

    async fn find_in_flight(&self) -> Result<Vec<MirrorRecord>, StoreError> {
        Ok(self
            .read_mirrors()?
            .values()
            .filter(|r| r.in_flight.is_some())
            .cloned()
            .collect())
    }

    async fn find_by_status(&self, status: AppStatus) -> Result<Vec<MirrorRecord>, StoreError> {
        Ok(self
            .read_mirrors()?
            .values()
            .filter(|r| r.app_status == status)
            .cloned()
            .collect())
    }
}

// =============================================================================
// Event Repository
// =============================================================================

#[async_trait]
impl EventRepository for MemoryStore {
    async fn append(&self, event: &LifecycleEvent) -> Result<i64, StoreError> {
        let mut events = self.events.write().map_err(poisoned)?;
        let seq = self.event_seq.fetch_add(1, Ordering::SeqCst) + 1;
        events.push(StoredEvent {
            seq,
            event: event.clone(),
        });
        Ok(seq)
    }

    async fn find_by_agreement(&self, id: &AgreementId) -> Result<Vec<LifecycleEvent>, StoreError> {
        let events = self.events.read().map_err(poisoned)?;
        Ok(events
            .iter()
            .filter(|e| e.event.agreement_id() == id)
            .map(|e| e.event.clone())
            .collect())
    }

    async fn get_latest_seq(&self, id: &AgreementId) -> Result<Option<i64>, StoreError> {
        let events = self.events.read().map_err(poisoned)?;
        Ok(events
            .iter()
            .filter(|e| e.event.agreement_id() == id)
            .map(|e| e.seq)
            .max())
    }
}

impl Store for MemoryStore {
    fn mirrors(&self) -> &dyn MirrorRepository {
        self
    }

    fn events(&self) -> &dyn EventRepository {
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
