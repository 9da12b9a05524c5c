//! Adaptive time-window narrowing.
//!
//! The source answers a window query with one capped, newest-first page and
//! no cursor. To enumerate a window exhaustively we keep lowering its upper
//! bound: to just above the oldest in-window item of each page, or by the
//! job's tolerance when a page gives nothing usable. Every step commits its
//! attempt, sightings and new boundary in one transaction.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use harvest_common::{Attempt, Item, Sighting, Subquery};

use crate::extractor::extract_items;
use crate::search_url::search_url;
use crate::traits::{Ledger, PageRenderer};

/// How the boundary was chosen for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The page had no items; shrunk by tolerance.
    Empty,
    /// The oldest in-window item set the new boundary.
    Narrowed,
    /// Nothing new was recorded; stepped down one second.
    Stalled,
    /// The page had items but none inside the window; shrunk by tolerance.
    OutOfRange,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Narrowed => write!(f, "narrowed"),
            Self::Stalled => write!(f, "stalled"),
            Self::OutOfRange => write!(f, "out_of_range"),
        }
    }
}

/// Result of one committed iteration.
#[derive(Debug, Clone)]
pub struct Step {
    /// The job with its new, lower `until`.
    pub job: Subquery,
    pub outcome: Outcome,
    pub items_seen: usize,
    pub inserted: u64,
}

pub struct NarrowingEngine {
    renderer: Arc<dyn PageRenderer>,
    ledger: Arc<dyn Ledger>,
    search_base_url: String,
    worker_ip: String,
}

impl NarrowingEngine {
    pub fn new(
        renderer: Arc<dyn PageRenderer>,
        ledger: Arc<dyn Ledger>,
        search_base_url: impl Into<String>,
        worker_ip: impl Into<String>,
    ) -> Self {
        Self {
            renderer,
            ledger,
            search_base_url: search_base_url.into(),
            worker_ip: worker_ip.into(),
        }
    }

    /// Query `job`'s current window once and commit the outcome. The input is
    /// left untouched; the narrowed job comes back in the `Step`.
    ///
    /// On error nothing of this step has been committed.
    pub async fn step(&self, job: &Subquery) -> Result<Step> {
        let url = search_url(&self.search_base_url, job)
            .with_context(|| format!("invalid search base url {:?}", self.search_base_url))?;
        let html = self
            .renderer
            .render(&url)
            .await
            .with_context(|| format!("rendering {url}"))?;
        let items = extract_items(&html);
        let observed_at = Utc::now();

        let mut tx = self.ledger.begin().await.context("opening iteration")?;

        tx.record_attempt(&Attempt {
            query_alias: job.query_alias.clone(),
            since: job.since,
            until: job.until,
            source_url: url.clone(),
            worker_ip: self.worker_ip.clone(),
            empty: items.is_empty(),
        })
        .await
        .context("recording attempt")?;

        let sightings = sightings_for(job, &items, observed_at, &url);
        let inserted = tx
            .record_sightings(&sightings)
            .await
            .context("recording sightings")?;

        let (until, outcome) = next_until(job, &items, inserted);
        let next = job.with_until(until);

        tx.save_progress(&next).await.context("saving progress")?;
        tx.commit().await.context("committing iteration")?;

        info!(
            query_alias = %job.query_alias,
            since = %job.since,
            until = %job.until,
            next_until = %next.until,
            items = items.len(),
            inserted,
            %outcome,
            "Window step committed"
        );

        Ok(Step {
            job: next,
            outcome,
            items_seen: items.len(),
            inserted,
        })
    }
}

/// Sightings to record for a page: only items inside the current window.
/// Older items belong to a neighbouring subquery of the same alias, and newer
/// ones were already on an earlier page of this job or belong to the
/// neighbour above it.
fn sightings_for(
    job: &Subquery,
    items: &[Item],
    observed_at: DateTime<Utc>,
    source_url: &str,
) -> Vec<Sighting> {
    items
        .iter()
        .filter(|item| job.contains(item.published_at))
        .map(|item| Sighting {
            query_alias: job.query_alias.clone(),
            since: job.since,
            until: job.until,
            item_id: item.item_id.clone(),
            published_at: item.published_at,
            observed_at,
            source_url: source_url.to_string(),
        })
        .collect()
}

/// Pick the next upper bound. Always strictly below `job.until`.
///
/// `items` is in delivery order (newest first); `inserted` is how many of
/// them were new sightings.
pub fn next_until(job: &Subquery, items: &[Item], inserted: u64) -> (DateTime<Utc>, Outcome) {
    let one = Duration::seconds(1);

    if items.is_empty() {
        return (lowered(job, job.tolerance()), Outcome::Empty);
    }

    let oldest_in_window = items
        .iter()
        .rev()
        .find(|item| job.contains(item.published_at));

    match oldest_in_window {
        None => {
            debug!(query_alias = %job.query_alias, "page has no item inside the window");
            (lowered(job, job.tolerance()), Outcome::OutOfRange)
        }
        Some(_) if inserted == 0 => (lowered(job, one), Outcome::Stalled),
        // An item sitting exactly at `until` would not move the boundary.
        Some(item) => {
            let above = item.published_at.checked_add_signed(one).unwrap_or(job.until);
            (above.min(lowered(job, one)), Outcome::Narrowed)
        }
    }
}

/// `job.until - by`. When that falls off the representable range the
/// result is pinned just below `since`, which closes the window.
fn lowered(job: &Subquery, by: Duration) -> DateTime<Utc> {
    job.until.checked_sub_signed(by).unwrap_or_else(|| {
        job.since
            .checked_sub_signed(Duration::seconds(1))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    })
}
