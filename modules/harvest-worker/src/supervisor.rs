use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use harvest_common::{ErrorRecord, Subquery};

use crate::healing::Healer;
use crate::narrowing::NarrowingEngine;
use crate::traits::{JobSource, Ledger};

/// Counters for one worker run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub jobs_completed: u64,
    /// Already complete when received.
    pub jobs_skipped: u64,
    /// Bodies that did not decode as a subquery.
    pub jobs_rejected: u64,
    pub iterations: u64,
    pub sightings_inserted: u64,
    pub queries_advanced: u64,
}

impl fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "jobs_completed={} jobs_skipped={} jobs_rejected={} iterations={} sightings_inserted={} queries_advanced={}",
            self.jobs_completed,
            self.jobs_skipped,
            self.jobs_rejected,
            self.iterations,
            self.sightings_inserted,
            self.queries_advanced,
        )
    }
}

/// Pulls subqueries off the queue one at a time and drains each to
/// completion. The first failed job ends the run: its last committed state
/// goes back on the queue, a replacement worker is requested, and the error
/// is returned.
pub struct Supervisor {
    queue: Arc<dyn JobSource>,
    ledger: Arc<dyn Ledger>,
    engine: NarrowingEngine,
    healer: Healer,
    module: String,
    worker_ip: String,
}

impl Supervisor {
    pub fn new(
        queue: Arc<dyn JobSource>,
        ledger: Arc<dyn Ledger>,
        engine: NarrowingEngine,
        healer: Healer,
        module: impl Into<String>,
        worker_ip: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            ledger,
            engine,
            healer,
            module: module.into(),
            worker_ip: worker_ip.into(),
        }
    }

    /// Work until the queue is empty.
    pub async fn run(&self) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();

        while let Some(received) = self.queue.receive().await.context("receiving job")? {
            // Acknowledge before processing; a crash from here on is recovered
            // by re-submission, not redelivery.
            self.queue
                .delete(&received.receipt)
                .await
                .context("acknowledging job")?;

            let job = match Subquery::from_json(&received.body) {
                Ok(job) => job,
                Err(e) => {
                    warn!(error = %e, body = %received.body, "Discarding undecodable job");
                    self.write_error(serde_json::from_str(&received.body).ok(), e.to_string())
                        .await;
                    stats.jobs_rejected += 1;
                    continue;
                }
            };

            info!(
                query_alias = %job.query_alias,
                since = %job.since,
                until = %job.until,
                "Job received"
            );

            let mut current = job;
            if let Err(err) = self.drive(&mut current, &mut stats).await {
                return Err(self.fail(&current, err).await);
            }
        }

        info!("Queue drained. {stats}");
        Ok(stats)
    }

    /// Narrow `job` until its window closes, then mark it complete. `job`
    /// always holds the last committed state, so on error it is what should be
    /// retried.
    async fn drive(&self, job: &mut Subquery, stats: &mut WorkerStats) -> Result<()> {
        if let Some(progress) = self
            .ledger
            .progress(&job.query_alias, job.since)
            .await
            .context("reading job progress")?
        {
            if progress.complete {
                info!(query_alias = %job.query_alias, since = %job.since, "Subquery already complete, skipping");
                stats.jobs_skipped += 1;
                return Ok(());
            }
            if let Some(until) = progress.current_until.filter(|u| *u < job.until) {
                info!(
                    query_alias = %job.query_alias,
                    from = %job.until,
                    to = %until,
                    "Resuming from committed progress"
                );
                *job = job.with_until(until);
            }
        }

        while job.is_open() {
            let step = self.engine.step(job).await?;
            stats.iterations += 1;
            stats.sightings_inserted += step.inserted;
            *job = step.job;
        }

        let mut tx = self.ledger.begin().await.context("opening completion")?;
        let advanced = tx.complete(job).await.context("marking subquery complete")?;
        tx.commit().await.context("committing completion")?;

        stats.jobs_completed += 1;
        if advanced {
            stats.queries_advanced += 1;
            info!(query_alias = %job.query_alias, "All subqueries harvested, query advanced");
        }
        info!(query_alias = %job.query_alias, since = %job.since, "Subquery complete");
        Ok(())
    }

    /// Record the failure, hand the job back to the queue and ask for a
    /// replacement. Returns the error the run ends with.
    async fn fail(&self, job: &Subquery, err: anyhow::Error) -> anyhow::Error {
        error!(
            query_alias = %job.query_alias,
            since = %job.since,
            until = %job.until,
            error = %format!("{err:#}"),
            "Job failed"
        );

        self.write_error(serde_json::to_value(job).ok(), format!("{err:?}"))
            .await;

        match job.to_json() {
            Ok(body) => match self.queue.send(&body).await {
                Ok(()) => info!(query_alias = %job.query_alias, until = %job.until, "Job re-submitted"),
                Err(e) => error!(error = %e, body = %body, "Failed to re-submit job"),
            },
            Err(e) => error!(error = %e, "Failed to encode job for re-submission"),
        }

        let replacement = self.healer.request_replacement().await;
        info!(%replacement, "Replacement request finished");

        err.context(format!("subquery {} since {} failed", job.query_alias, job.since))
    }

    async fn write_error(&self, job_snapshot: Option<serde_json::Value>, error_detail: String) {
        let record = ErrorRecord {
            job_snapshot,
            error_detail,
            module: self.module.clone(),
            worker_ip: self.worker_ip.clone(),
        };
        if let Err(e) = self.ledger.record_error(&record).await {
            error!(error = %e, "Failed to write error record");
        }
    }
}
