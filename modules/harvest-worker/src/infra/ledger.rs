// Ledger over the Postgres store. Each narrowing iteration is one StoreTx.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use harvest_common::{Attempt, ErrorRecord, Progress, Sighting, Subquery};
use harvest_store::{HarvestStore, StoreTx};

use crate::traits::{Ledger, LedgerTx};

#[async_trait]
impl Ledger for HarvestStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(HarvestStore::begin(self).await?))
    }

    async fn progress(&self, query_alias: &str, since: DateTime<Utc>) -> Result<Option<Progress>> {
        Ok(HarvestStore::progress(self, query_alias, since).await?)
    }

    async fn record_error(&self, record: &ErrorRecord) -> Result<()> {
        Ok(HarvestStore::record_error(self, record).await?)
    }
}

#[async_trait]
impl LedgerTx for StoreTx {
    async fn record_attempt(&mut self, attempt: &Attempt) -> Result<()> {
        Ok(self.insert_attempt(attempt).await?)
    }

    async fn record_sightings(&mut self, sightings: &[Sighting]) -> Result<u64> {
        Ok(self.insert_sightings(sightings).await?)
    }

    async fn save_progress(&mut self, job: &Subquery) -> Result<()> {
        Ok(StoreTx::save_progress(self, job).await?)
    }

    async fn complete(&mut self, job: &Subquery) -> Result<bool> {
        self.mark_complete(job).await?;
        Ok(self.advance_query(&job.query_alias).await?)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(StoreTx::commit(*self).await?)
    }
}
