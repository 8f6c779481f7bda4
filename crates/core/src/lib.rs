//! `fieldsync-core`: shared building blocks of the offline sync protocol.
//!
//! This crate contains **pure** types only (no storage or transport):
//! identifiers, the domain error, and the submission wire contract used by
//! both `fieldsync-client` and `fieldsync-api`.

pub mod error;
pub mod id;
pub mod wire;

pub use error::DomainError;
pub use id::{ClientId, EntityId, IdempotencyKey, TenantId};
pub use wire::{AttachmentUploaded, ErrorBody, MutationEnvelope};
