//! Postgres persistence for the harvest worker.
//!
//! Sightings, attempts and job progress are written through a [`StoreTx`] so
//! one narrowing iteration lands atomically; error records go straight to the
//! pool so they survive the rollback of the iteration that failed.

pub mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::{HarvestStore, StoreTx, StoredAwsCredentials};
