// In-memory fakes for the worker's trait seams.
//
// - MockRenderer (PageRenderer): scripted pages, one per call, with faults
// - SimulatedSource (PageRenderer): a capped newest-first search over a
//   fixed set of items, answering whatever window the URL asks for
// - MemoryLedger (Ledger): buffered transactions, dedup on commit
// - MemoryQueue (JobSource): VecDeque of bodies
// - RecordingProvisioner (Provisioner): records launches

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use aws_client::InstanceIdentity;
use harvest_common::{Attempt, ErrorRecord, Item, Progress, QueryPhase, Sighting, Subquery};

use crate::traits::{
    JobSource, Ledger, LedgerTx, PageRenderer, Provisioner, ReceivedJob, WorkerIdentity,
};

/// Render `items` as result-page markup the extractor understands, in the
/// order given.
pub fn results_page(items: &[Item]) -> String {
    let mut html = String::from("<ol class=\"stream-items\">\n");
    for item in items {
        html.push_str(&format!(
            "<li><div class=\"tweet\" data-tweet-id=\"{}\">\
             <span class=\"_timestamp\" data-time=\"{}\"></span></div></li>\n",
            item.item_id,
            item.published_at.timestamp()
        ));
    }
    html.push_str("</ol>");
    html
}

// ---------------------------------------------------------------------------
// MockRenderer
// ---------------------------------------------------------------------------

enum Scripted {
    Page(String),
    Fail(String),
}

/// Answers calls from a script, in order. Once the script runs out every
/// call gets an empty page.
pub struct MockRenderer {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<String>>,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn then_page(self, html: impl Into<String>) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Page(html.into()));
        self
    }

    pub fn then_items(self, items: &[Item]) -> Self {
        self.then_page(results_page(items))
    }

    pub fn then_fail(self, message: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Fail(message.to_string()));
        self
    }

    /// Every URL requested so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageRenderer for MockRenderer {
    async fn render(&self, url: &str) -> Result<String> {
        self.requests.lock().unwrap().push(url.to_string());
        match self.script.lock().unwrap().pop_front() {
            Some(Scripted::Page(html)) => Ok(html),
            Some(Scripted::Fail(message)) => Err(anyhow!(message)),
            None => Ok(results_page(&[])),
        }
    }
}

// ---------------------------------------------------------------------------
// SimulatedSource
// ---------------------------------------------------------------------------

/// Behaves like the real search endpoint: reads `since:`/`until:` out of the
/// `q` parameter and returns at most `page_size` matching items, newest first.
pub struct SimulatedSource {
    items: Vec<Item>,
    page_size: usize,
    calls: Mutex<usize>,
}

impl SimulatedSource {
    pub fn new(mut items: Vec<Item>, page_size: usize) -> Self {
        items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        Self {
            items,
            page_size,
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl PageRenderer for SimulatedSource {
    async fn render(&self, url: &str) -> Result<String> {
        *self.calls.lock().unwrap() += 1;

        let url = url::Url::parse(url)?;
        let q = url
            .query_pairs()
            .find(|(k, _)| k == "q")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| anyhow!("no q parameter"))?;

        let bound = |name: &str| -> Result<i64> {
            let prefix = format!("{name}:");
            q.split_whitespace()
                .find_map(|t| t.strip_prefix(prefix.as_str()))
                .ok_or_else(|| anyhow!("no {name} in {q:?}"))?
                .parse()
                .map_err(Into::into)
        };
        let (since, until) = (bound("since")?, bound("until")?);

        let page: Vec<Item> = self
            .items
            .iter()
            .filter(|i| i.published_at.timestamp() >= since && i.published_at.timestamp() < until)
            .take(self.page_size)
            .cloned()
            .collect();
        Ok(results_page(&page))
    }
}

// ---------------------------------------------------------------------------
// MemoryLedger
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LedgerState {
    sightings: Vec<Sighting>,
    seen: HashSet<(String, String)>,
    attempts: Vec<Attempt>,
    progress: HashMap<(String, DateTime<Utc>), Progress>,
    queries: HashMap<String, QueryPhase>,
    errors: Vec<ErrorRecord>,
    /// Commits left before commits start failing. `None` never fails.
    commits_left: Option<usize>,
}

impl LedgerState {
    fn merge_progress(&mut self, job: &Subquery, complete: bool) {
        let entry = self
            .progress
            .entry((job.query_alias.clone(), job.since))
            .or_insert(Progress {
                current_until: Some(job.until),
                complete: false,
            });
        entry.current_until = Some(match entry.current_until {
            Some(current) => current.min(job.until),
            None => job.until,
        });
        entry.complete |= complete;
    }

    /// Whether completing `job` would leave its query with nothing open.
    fn would_advance(&self, job: &Subquery) -> bool {
        self.queries.get(&job.query_alias) == Some(&QueryPhase::Harvesting)
            && self
                .progress
                .iter()
                .filter(|((alias, since), _)| alias == &job.query_alias && *since != job.since)
                .all(|(_, p)| p.complete)
    }
}

/// Ledger held in memory. Transactions buffer their writes and apply them on
/// commit; dropped transactions leave no trace.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query in the harvesting phase.
    pub fn with_query(self, query_alias: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .queries
            .insert(query_alias.to_string(), QueryPhase::Harvesting);
        self
    }

    /// Track a subquery as already known, e.g. seeded by the partitioner.
    pub fn with_subquery(self, job: &Subquery) -> Self {
        self.state.lock().unwrap().merge_progress(job, false);
        self
    }

    /// Let `n` more commits succeed, then fail every one after.
    pub fn fail_commits_after(&self, n: usize) {
        self.state.lock().unwrap().commits_left = Some(n);
    }

    pub fn sightings(&self) -> Vec<Sighting> {
        self.state.lock().unwrap().sightings.clone()
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.state.lock().unwrap().errors.clone()
    }

    pub fn query_phase(&self, query_alias: &str) -> Option<QueryPhase> {
        self.state.lock().unwrap().queries.get(query_alias).copied()
    }

    pub fn progress_of(&self, query_alias: &str, since: DateTime<Utc>) -> Option<Progress> {
        self.state
            .lock()
            .unwrap()
            .progress
            .get(&(query_alias.to_string(), since))
            .cloned()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(MemoryTx {
            state: self.state.clone(),
            ops: Vec::new(),
            pending_ids: HashSet::new(),
        }))
    }

    async fn progress(&self, query_alias: &str, since: DateTime<Utc>) -> Result<Option<Progress>> {
        Ok(self.progress_of(query_alias, since))
    }

    async fn record_error(&self, record: &ErrorRecord) -> Result<()> {
        self.state.lock().unwrap().errors.push(record.clone());
        Ok(())
    }
}

enum Op {
    Attempt(Attempt),
    Sightings(Vec<Sighting>),
    Progress(Subquery),
    Complete { job: Subquery, advance: bool },
}

struct MemoryTx {
    state: Arc<Mutex<LedgerState>>,
    ops: Vec<Op>,
    pending_ids: HashSet<(String, String)>,
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn record_attempt(&mut self, attempt: &Attempt) -> Result<()> {
        self.ops.push(Op::Attempt(attempt.clone()));
        Ok(())
    }

    async fn record_sightings(&mut self, sightings: &[Sighting]) -> Result<u64> {
        let state = self.state.lock().unwrap();
        let mut fresh = Vec::new();
        for s in sightings {
            let key = (s.query_alias.clone(), s.item_id.clone());
            if !state.seen.contains(&key) && self.pending_ids.insert(key) {
                fresh.push(s.clone());
            }
        }
        drop(state);

        let inserted = fresh.len() as u64;
        self.ops.push(Op::Sightings(fresh));
        Ok(inserted)
    }

    async fn save_progress(&mut self, job: &Subquery) -> Result<()> {
        self.ops.push(Op::Progress(job.clone()));
        Ok(())
    }

    async fn complete(&mut self, job: &Subquery) -> Result<bool> {
        let advance = self.state.lock().unwrap().would_advance(job);
        self.ops.push(Op::Complete {
            job: job.clone(),
            advance,
        });
        Ok(advance)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx {
            state: shared, ops, ..
        } = *self;
        let mut state = shared.lock().unwrap();
        if let Some(left) = state.commits_left.as_mut() {
            if *left == 0 {
                bail!("simulated commit failure");
            }
            *left -= 1;
        }

        for op in ops {
            match op {
                Op::Attempt(a) => state.attempts.push(a),
                Op::Sightings(batch) => {
                    for s in batch {
                        if state.seen.insert((s.query_alias.clone(), s.item_id.clone())) {
                            state.sightings.push(s);
                        }
                    }
                }
                Op::Progress(job) => state.merge_progress(&job, false),
                Op::Complete { job, advance } => {
                    state.merge_progress(&job, true);
                    if advance {
                        state
                            .queries
                            .insert(job.query_alias.clone(), QueryPhase::Harvested);
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

/// FIFO queue. Re-submitted bodies go to the back of the queue and are also
/// kept in `sent()`.
#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<VecDeque<String>>,
    deleted: Mutex<Vec<String>>,
    sent: Mutex<Vec<String>>,
    receipts: Mutex<u64>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(self, job: &Subquery) -> Self {
        self.with_body(&job.to_json().unwrap())
    }

    pub fn with_body(self, body: &str) -> Self {
        self.messages.lock().unwrap().push_back(body.to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobSource for MemoryQueue {
    async fn receive(&self) -> Result<Option<ReceivedJob>> {
        let Some(body) = self.messages.lock().unwrap().pop_front() else {
            return Ok(None);
        };
        let mut n = self.receipts.lock().unwrap();
        *n += 1;
        Ok(Some(ReceivedJob {
            body,
            receipt: format!("receipt-{n}"),
        }))
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(receipt.to_string());
        Ok(())
    }

    async fn send(&self, body: &str) -> Result<()> {
        self.sent.lock().unwrap().push(body.to_string());
        self.messages.lock().unwrap().push_back(body.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingProvisioner
// ---------------------------------------------------------------------------

pub fn test_instance() -> InstanceIdentity {
    InstanceIdentity {
        instance_id: "i-0123456789abcdef0".into(),
        image_id: "ami-0harvest".into(),
        instance_type: "t3.medium".into(),
        availability_zone: "us-east-1a".into(),
        region: "us-east-1".into(),
        private_ip: Some("10.0.1.17".into()),
        subnet_id: Some("subnet-1".into()),
        security_group_ids: vec!["sg-1".into()],
        instance_profile_arn: None,
        user_data: Some("#!/bin/sh\nexec harvest-worker\n".into()),
    }
}

/// Records every launch instead of calling a cloud API.
pub struct RecordingProvisioner {
    identity: Option<WorkerIdentity>,
    fail_launches: bool,
    launches: Mutex<Vec<(InstanceIdentity, Vec<(String, String)>)>>,
}

impl RecordingProvisioner {
    pub fn on_instance(instance: InstanceIdentity, generation: u32) -> Self {
        Self {
            identity: Some(WorkerIdentity {
                instance,
                generation,
            }),
            fail_launches: false,
            launches: Mutex::new(Vec::new()),
        }
    }

    /// Not running on a cloud instance; identity lookups fail.
    pub fn off_instance() -> Self {
        Self {
            identity: None,
            fail_launches: false,
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_launches(mut self) -> Self {
        self.fail_launches = true;
        self
    }

    pub fn launches(&self) -> Vec<(InstanceIdentity, Vec<(String, String)>)> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn identity(&self) -> Result<WorkerIdentity> {
        self.identity
            .clone()
            .ok_or_else(|| anyhow!("instance metadata endpoint unreachable"))
    }

    async fn launch(&self, instance: &InstanceIdentity, tags: &[(String, String)]) -> Result<String> {
        if self.fail_launches {
            bail!("RunInstances: UnauthorizedOperation");
        }
        let mut launches = self.launches.lock().unwrap();
        launches.push((instance.clone(), tags.to_vec()));
        Ok(format!("i-replacement-{}", launches.len()))
    }
}
