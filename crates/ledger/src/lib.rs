//! Server-side idempotency ledger.
//!
//! Turns at-least-once HTTP delivery into effectively-once execution: each
//! `(tenant, idempotency key)` owns one ledger row, created atomically in
//! `processing` state by whichever request gets there first. Later requests
//! with the same key replay the recorded response, wait for the in-flight one,
//! or are rejected as conflicts when the body differs.

pub mod fingerprint;
pub mod in_memory;
pub mod ledger;
pub mod postgres;
pub mod record;
pub mod store;
pub mod sweeper;

pub use fingerprint::body_hash;
pub use in_memory::InMemoryLedgerStore;
pub use ledger::{IdempotencyError, IdempotencyLedger, LedgerConfig, Outcome};
pub use postgres::PostgresLedgerStore;
pub use record::{IdempotencyRecord, NewClaim, RecordStatus, StoredResponse};
pub use store::{ClaimOutcome, LedgerError, LedgerStore};
pub use sweeper::spawn_expiry_sweeper;
