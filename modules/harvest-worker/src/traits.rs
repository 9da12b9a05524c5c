// Trait seams between the worker and its collaborators.
//
// PageRenderer: turns a search URL into rendered page markup.
// JobSource: the subquery queue (receive / delete / send).
// Ledger: persistence; one LedgerTx per narrowing iteration.
// Provisioner: who am I, and launch a sibling like me.
//
// Production implementations live in `infra`; in-memory fakes in `testing`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use aws_client::InstanceIdentity;
use harvest_common::{Attempt, ErrorRecord, Progress, Sighting, Subquery};

// ---------------------------------------------------------------------------
// PageRenderer
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Load `url`, let lazy content materialize, and return the page markup.
    async fn render(&self, url: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// JobSource
// ---------------------------------------------------------------------------

/// A message taken off the queue but not yet acknowledged.
#[derive(Debug, Clone)]
pub struct ReceivedJob {
    pub body: String,
    pub receipt: String,
}

#[async_trait]
pub trait JobSource: Send + Sync {
    /// Zero or one message. Must not block indefinitely.
    async fn receive(&self) -> Result<Option<ReceivedJob>>;

    /// Acknowledge a received message so it is not redelivered.
    async fn delete(&self, receipt: &str) -> Result<()>;

    /// Enqueue a job body for another worker to pick up.
    async fn send(&self, body: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Open the transaction for one narrowing iteration.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    /// Last committed state of the subquery keyed by `(query_alias, since)`.
    async fn progress(&self, query_alias: &str, since: DateTime<Utc>) -> Result<Option<Progress>>;

    /// Append an error record outside any open iteration.
    async fn record_error(&self, record: &ErrorRecord) -> Result<()>;
}

/// Writes of a single iteration. Dropping without `commit` discards them all.
#[async_trait]
pub trait LedgerTx: Send {
    async fn record_attempt(&mut self, attempt: &Attempt) -> Result<()>;

    /// Returns how many sightings were new.
    async fn record_sightings(&mut self, sightings: &[Sighting]) -> Result<u64>;

    async fn save_progress(&mut self, job: &Subquery) -> Result<()>;

    /// Mark the subquery complete and advance its query if nothing else of it
    /// is open. Returns whether the query advanced.
    async fn complete(&mut self, job: &Subquery) -> Result<bool>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

/// The running worker as seen by the execution environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub instance: InstanceIdentity,
    /// Value of the instance's `generation` tag; 0 when untagged.
    pub generation: u32,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Fails when not running in the expected environment.
    async fn identity(&self) -> Result<WorkerIdentity>;

    /// Launch one instance configured like `instance`. Returns its id.
    async fn launch(&self, instance: &InstanceIdentity, tags: &[(String, String)]) -> Result<String>;
}
