//! Window narrowing against in-memory collaborators.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use harvest_common::{Item, Subquery};
use harvest_worker::narrowing::{NarrowingEngine, Outcome, Step};
use harvest_worker::testing::{MemoryLedger, MockRenderer, SimulatedSource};
use harvest_worker::traits::PageRenderer;

const BASE_URL: &str = "https://search.example/search";

fn t1() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2018, 3, 1, 12, 0, 0).unwrap()
}

fn job() -> Subquery {
    Subquery {
        query_alias: "floods".into(),
        search_terms: "flood".into(),
        language: Some("pt".into()),
        since: t1() - Duration::hours(2),
        until: t1(),
        tolerance_seconds: 300,
    }
}

fn item(id: &str, published_at: DateTime<Utc>) -> Item {
    Item {
        item_id: id.into(),
        published_at,
    }
}

fn secs(n: i64) -> Duration {
    Duration::seconds(n)
}

fn engine(renderer: Arc<dyn PageRenderer>, ledger: &MemoryLedger) -> NarrowingEngine {
    NarrowingEngine::new(renderer, Arc::new(ledger.clone()), BASE_URL, "10.0.0.5")
}

/// Step until the window closes, returning every step taken.
async fn drain(engine: &NarrowingEngine, job: &Subquery) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut current = job.clone();
    while current.is_open() {
        let step = engine.step(&current).await.unwrap();
        current = step.job.clone();
        steps.push(step);
    }
    steps
}

#[tokio::test]
async fn empty_page_shrinks_by_tolerance_and_logs_empty_attempt() {
    let ledger = MemoryLedger::new();
    let renderer = Arc::new(MockRenderer::new().then_items(&[]));
    let engine = engine(renderer.clone(), &ledger);

    let step = engine.step(&job()).await.unwrap();

    assert_eq!(step.outcome, Outcome::Empty);
    assert_eq!(step.job.since, job().since);
    assert_eq!(step.job.until, t1() - secs(300));

    let attempts = ledger.attempts();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].empty);
    assert_eq!(attempts[0].until, t1());
    assert_eq!(attempts[0].worker_ip, "10.0.0.5");
    assert_eq!(attempts[0].source_url, renderer.requests()[0]);
    assert!(ledger.sightings().is_empty());

    let progress = ledger.progress_of("floods", job().since).unwrap();
    assert_eq!(progress.current_until, Some(t1() - secs(300)));
}

#[tokio::test]
async fn oldest_in_window_item_sets_next_boundary() {
    let ledger = MemoryLedger::new();
    let page = [
        item("c", t1() - secs(10)),
        item("b", t1() - secs(50)),
        item("a", t1() - secs(90)),
    ];
    let renderer = Arc::new(MockRenderer::new().then_items(&page));
    let engine = engine(renderer.clone(), &ledger);

    let step = engine.step(&job()).await.unwrap();

    assert_eq!(step.outcome, Outcome::Narrowed);
    assert_eq!(step.job.until, t1() - secs(89));
    assert_eq!(step.inserted, 3);
    assert_eq!(ledger.sightings().len(), 3);
    assert!(!ledger.attempts()[0].empty);

    let url = &renderer.requests()[0];
    assert!(url.contains(&format!("since%3A{}", job().since.timestamp())));
    assert!(url.contains(&format!("until%3A{}", t1().timestamp() + 1)));
    assert!(url.contains("l=pt"));
}

#[tokio::test]
async fn repeated_page_with_nothing_new_trips_stall_guard() {
    let ledger = MemoryLedger::new();
    let page = [
        item("c", t1() - secs(10)),
        item("b", t1() - secs(50)),
        item("a", t1() - secs(90)),
    ];
    let renderer = Arc::new(MockRenderer::new().then_items(&page).then_items(&page));
    let engine = engine(renderer, &ledger);

    let first = engine.step(&job()).await.unwrap();
    let second = engine.step(&first.job).await.unwrap();

    assert_eq!(second.inserted, 0);
    assert_eq!(second.outcome, Outcome::Stalled);
    assert_eq!(second.job.until, first.job.until - secs(1));
    assert_eq!(ledger.sightings().len(), 3);
    assert_eq!(ledger.attempts().len(), 2);
}

#[tokio::test]
async fn render_failure_commits_nothing() {
    let ledger = MemoryLedger::new();
    let renderer = Arc::new(MockRenderer::new().then_fail("browser crashed"));
    let engine = engine(renderer, &ledger);

    let err = engine.step(&job()).await.unwrap_err();

    assert!(format!("{err:#}").contains("browser crashed"));
    assert!(ledger.attempts().is_empty());
    assert_eq!(ledger.progress_of("floods", job().since), None);
}

#[tokio::test]
async fn commit_failure_discards_the_whole_iteration() {
    let ledger = MemoryLedger::new();
    ledger.fail_commits_after(0);
    let renderer = Arc::new(MockRenderer::new().then_items(&[item("a", t1() - secs(5))]));
    let engine = engine(renderer, &ledger);

    assert!(engine.step(&job()).await.is_err());
    assert!(ledger.sightings().is_empty());
    assert!(ledger.attempts().is_empty());
    assert_eq!(ledger.progress_of("floods", job().since), None);
}

/// Items every 7 seconds across the job's window, plus a few just outside it.
fn corpus() -> Vec<Item> {
    let j = job();
    let mut items = Vec::new();
    let mut ts = j.since;
    let mut n = 0;
    while ts <= j.until {
        items.push(item(&format!("in-{n}"), ts));
        ts += secs(7);
        n += 1;
    }
    items.push(item("before", j.since - secs(30)));
    items.push(item("after", j.until + secs(30)));
    items
}

fn in_window_ids() -> HashSet<String> {
    let j = job();
    corpus()
        .into_iter()
        .filter(|i| j.contains(i.published_at))
        .map(|i| i.item_id)
        .collect()
}

#[tokio::test]
async fn until_strictly_decreases_and_loop_terminates() {
    let ledger = MemoryLedger::new();
    let source = Arc::new(SimulatedSource::new(corpus(), 20));
    let engine = engine(source.clone(), &ledger);
    let j = job();

    let steps = drain(&engine, &j).await;

    let mut previous = j.until;
    for step in &steps {
        assert!(step.job.until < previous, "until must strictly decrease");
        previous = step.job.until;
    }
    assert!(previous < j.since);

    let bound = (j.until - j.since).num_seconds() as usize + 1;
    assert!(steps.len() <= bound);
    assert_eq!(source.calls(), steps.len());
}

#[tokio::test]
async fn drained_window_records_every_item_exactly_once() {
    let ledger = MemoryLedger::new();
    let source = Arc::new(SimulatedSource::new(corpus(), 20));
    let engine = engine(source, &ledger);

    drain(&engine, &job()).await;

    let sightings = ledger.sightings();
    let ids: Vec<String> = sightings.iter().map(|s| s.item_id.clone()).collect();
    let unique: HashSet<String> = ids.iter().cloned().collect();
    assert_eq!(ids.len(), unique.len(), "no item recorded twice");
    assert_eq!(unique, in_window_ids());
}

#[tokio::test]
async fn reprocessing_a_window_changes_nothing() {
    let ledger = MemoryLedger::new();
    let source = Arc::new(SimulatedSource::new(corpus(), 20));
    let engine = engine(source, &ledger);

    drain(&engine, &job()).await;
    let first: HashSet<String> = ledger.sightings().into_iter().map(|s| s.item_id).collect();

    let replay = drain(&engine, &job()).await;
    let second: HashSet<String> = ledger.sightings().into_iter().map(|s| s.item_id).collect();

    assert_eq!(first, second);
    assert_eq!(replay.iter().map(|s| s.inserted).sum::<u64>(), 0);
}
