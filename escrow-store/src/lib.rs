//! Escrow Storage Layer
//!
//! Provides persistence for agreement mirror records and lifecycle events.
//!
//! # Architecture
//!
//! - **Repository traits**: Define the storage interface (ports)
//! - **In-memory store**: Fast implementation for testing
//! - **PostgreSQL store**: Production implementation (feature `postgres`)
//!
//! All mirror writes after the initial insert are compare-and-swap on the
//! record version, so at most one writer wins per version.
//!
//! # Usage
//!
//! ```rust
//! use escrow_store::{MemoryStore, MirrorRepository, Store};
//! use escrow_domain::{AgreementDraft, AgreementId, EscrowAmount, MirrorRecord};
//! use rust_decimal_macros::dec;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!
//!     let record = MirrorRecord::open(AgreementDraft {
//!         agreement_id: AgreementId::new("A1").unwrap(),
//!         needer: Uuid::now_v7(),
//!         provider: Uuid::now_v7(),
//!         escrow_amount: EscrowAmount::new(dec!(500)).unwrap(),
//!         requirements: "Landing page".to_string(),
//!         terms: "Two revisions".to_string(),
//!     });
//!     store.mirrors().insert(&record).await.unwrap();
//!
//!     // Claim the record: succeeds once per version
//!     let stored = store.mirrors().update(&record, 0).await.unwrap();
//!     assert_eq!(stored.version, 1);
//!     assert!(store.mirrors().update(&record, 0).await.is_err());
//! }
//! ```

#![warn(clippy::all)]

// Modules
mod error;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod repository;

// Re-exports
pub use error::StoreError;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::{PgStore, MIGRATION_SQL};
pub use repository::{EventRepository, MirrorRepository, Store};
