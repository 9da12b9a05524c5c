//! Worker lifecycle: draining the queue, completion, crash recovery and
//! self-healing.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use harvest_common::{Item, QueryPhase, Subquery};
use harvest_worker::healing::Healer;
use harvest_worker::narrowing::NarrowingEngine;
use harvest_worker::supervisor::Supervisor;
use harvest_worker::testing::{
    test_instance, MemoryLedger, MemoryQueue, MockRenderer, RecordingProvisioner,
};
use harvest_worker::traits::{Ledger, PageRenderer};

fn t1() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2018, 3, 1, 12, 0, 0).unwrap()
}

fn job() -> Subquery {
    Subquery {
        query_alias: "floods".into(),
        search_terms: "flood".into(),
        language: None,
        since: t1() - Duration::hours(1),
        until: t1(),
        tolerance_seconds: 600,
    }
}

fn item(id: &str, secs_before_t1: i64) -> Item {
    Item {
        item_id: id.into(),
        published_at: t1() - Duration::seconds(secs_before_t1),
    }
}

fn page() -> Vec<Item> {
    vec![item("c", 10), item("b", 50), item("a", 90)]
}

fn worker(
    renderer: Arc<dyn PageRenderer>,
    ledger: &MemoryLedger,
    queue: &Arc<MemoryQueue>,
    provisioner: &Arc<RecordingProvisioner>,
) -> Supervisor {
    let ledger: Arc<dyn Ledger> = Arc::new(ledger.clone());
    let engine = NarrowingEngine::new(
        renderer,
        ledger.clone(),
        "https://search.example/search",
        "10.0.0.5",
    );
    let healer = Healer::new(provisioner.clone(), "harvest-worker");
    Supervisor::new(
        queue.clone(),
        ledger,
        engine,
        healer,
        "harvest-worker",
        "10.0.0.5",
    )
}

fn on_instance() -> Arc<RecordingProvisioner> {
    Arc::new(RecordingProvisioner::on_instance(test_instance(), 1))
}

#[tokio::test]
async fn drains_queue_and_advances_query() {
    let ledger = MemoryLedger::new().with_query("floods");
    let queue = Arc::new(MemoryQueue::new().with_job(&job()));
    let provisioner = on_instance();
    let renderer = Arc::new(MockRenderer::new().then_items(&page()));

    let stats = worker(renderer, &ledger, &queue, &provisioner)
        .run()
        .await
        .unwrap();

    assert_eq!(stats.jobs_completed, 1);
    assert_eq!(stats.queries_advanced, 1);
    assert_eq!(stats.sightings_inserted, 3);
    assert_eq!(queue.deleted(), vec!["receipt-1"]);
    assert!(queue.sent().is_empty());
    assert!(queue.is_empty());
    assert!(provisioner.launches().is_empty());
    assert!(ledger.errors().is_empty());

    assert!(ledger.progress_of("floods", job().since).unwrap().complete);
    assert_eq!(ledger.query_phase("floods"), Some(QueryPhase::Harvested));
}

#[tokio::test]
async fn query_waits_for_its_other_subqueries() {
    let sibling = Subquery {
        since: t1(),
        until: t1() + Duration::hours(1),
        ..job()
    };
    let ledger = MemoryLedger::new()
        .with_query("floods")
        .with_subquery(&sibling);
    let queue = Arc::new(MemoryQueue::new().with_job(&job()));
    let provisioner = on_instance();

    let stats = worker(Arc::new(MockRenderer::new()), &ledger, &queue, &provisioner)
        .run()
        .await
        .unwrap();

    assert_eq!(stats.jobs_completed, 1);
    assert_eq!(stats.queries_advanced, 0);
    assert_eq!(ledger.query_phase("floods"), Some(QueryPhase::Harvesting));
}

#[tokio::test]
async fn failure_resubmits_last_committed_state_and_requests_replacement() {
    let ledger = MemoryLedger::new().with_query("floods");
    let queue = Arc::new(MemoryQueue::new().with_job(&job()));
    let provisioner = on_instance();
    let renderer = Arc::new(
        MockRenderer::new()
            .then_items(&page())
            .then_fail("browser crashed"),
    );

    let err = worker(renderer, &ledger, &queue, &provisioner)
        .run()
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("browser crashed"));

    // Iteration 1 committed: three sightings, boundary just above the oldest.
    let committed_until = t1() - Duration::seconds(89);
    assert_eq!(ledger.sightings().len(), 3);

    let sent = queue.sent();
    assert_eq!(sent.len(), 1);
    let resubmitted = Subquery::from_json(&sent[0]).unwrap();
    assert_eq!(resubmitted, job().with_until(committed_until));

    let errors = ledger.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].error_detail.contains("browser crashed"));
    assert_eq!(errors[0].module, "harvest-worker");
    let snapshot = errors[0].job_snapshot.as_ref().unwrap();
    assert_eq!(snapshot["query_alias"], "floods");
    assert_eq!(
        Subquery::from_json(&snapshot.to_string()).unwrap().until,
        committed_until
    );

    let launches = provisioner.launches();
    assert_eq!(launches.len(), 1);
    assert!(launches[0]
        .1
        .contains(&("generation".to_string(), "2".to_string())));

    assert_eq!(ledger.query_phase("floods"), Some(QueryPhase::Harvesting));
}

#[tokio::test]
async fn restarted_worker_resumes_and_records_nothing_twice() {
    let ledger = MemoryLedger::new().with_query("floods");
    let queue = Arc::new(MemoryQueue::new().with_job(&job()));
    let provisioner = on_instance();

    let crashing = Arc::new(
        MockRenderer::new()
            .then_items(&page())
            .then_fail("network unreachable"),
    );
    assert!(worker(crashing, &ledger, &queue, &provisioner)
        .run()
        .await
        .is_err());
    let committed_until = t1() - Duration::seconds(89);

    // The replacement sees the same oldest item again, then nothing.
    let replacement = Arc::new(MockRenderer::new().then_items(&[item("a", 90)]));
    let stats = worker(replacement.clone(), &ledger, &queue, &provisioner)
        .run()
        .await
        .unwrap();

    assert_eq!(stats.jobs_completed, 1);
    let first_request = &replacement.requests()[0];
    assert!(first_request.contains(&format!(
        "until%3A{}",
        committed_until.timestamp() + 1
    )));

    let ids: Vec<String> = ledger.sightings().into_iter().map(|s| s.item_id).collect();
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(unique.len(), 3);
    assert_eq!(ledger.query_phase("floods"), Some(QueryPhase::Harvested));
}

#[tokio::test]
async fn commit_failure_resubmits_previous_boundary() {
    let ledger = MemoryLedger::new();
    ledger.fail_commits_after(1);
    let queue = Arc::new(MemoryQueue::new().with_job(&job()));
    let provisioner = on_instance();

    assert!(worker(Arc::new(MockRenderer::new()), &ledger, &queue, &provisioner)
        .run()
        .await
        .is_err());

    // First empty page committed a tolerance shrink; the second never landed.
    let resubmitted = Subquery::from_json(&queue.sent()[0]).unwrap();
    assert_eq!(resubmitted.until, t1() - Duration::seconds(600));
    assert_eq!(ledger.attempts().len(), 1);
}

#[tokio::test]
async fn resumes_from_committed_progress() {
    let narrowed = job().with_until(t1() - Duration::minutes(40));
    let ledger = MemoryLedger::new().with_subquery(&narrowed);
    let queue = Arc::new(MemoryQueue::new().with_job(&job()));
    let renderer = Arc::new(MockRenderer::new());

    worker(renderer.clone(), &ledger, &queue, &on_instance())
        .run()
        .await
        .unwrap();

    assert!(renderer.requests()[0].contains(&format!(
        "until%3A{}",
        narrowed.until.timestamp() + 1
    )));
    // 20 minutes left at 10 minutes of tolerance per empty page.
    assert_eq!(renderer.requests().len(), 3);
}

#[tokio::test]
async fn completed_subquery_is_acknowledged_and_skipped() {
    let ledger = MemoryLedger::new();
    let mut tx = ledger.begin().await.unwrap();
    tx.complete(&job()).await.unwrap();
    tx.commit().await.unwrap();

    let queue = Arc::new(MemoryQueue::new().with_job(&job()));
    let renderer = Arc::new(MockRenderer::new());

    let stats = worker(renderer.clone(), &ledger, &queue, &on_instance())
        .run()
        .await
        .unwrap();

    assert_eq!(stats.jobs_skipped, 1);
    assert_eq!(stats.jobs_completed, 0);
    assert_eq!(queue.deleted().len(), 1);
    assert!(renderer.requests().is_empty());
}

#[tokio::test]
async fn undecodable_job_is_recorded_and_skipped() {
    let ledger = MemoryLedger::new();
    let queue = Arc::new(
        MemoryQueue::new()
            .with_body("{\"query_alias\": \"floods\"")
            .with_job(&job()),
    );

    let stats = worker(Arc::new(MockRenderer::new()), &ledger, &queue, &on_instance())
        .run()
        .await
        .unwrap();

    assert_eq!(stats.jobs_rejected, 1);
    assert_eq!(stats.jobs_completed, 1);
    assert_eq!(queue.deleted().len(), 2);
    let errors = ledger.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].job_snapshot.is_none());
}

#[tokio::test]
async fn failure_off_instance_still_resubmits() {
    let ledger = MemoryLedger::new();
    let queue = Arc::new(MemoryQueue::new().with_job(&job()));
    let provisioner = Arc::new(RecordingProvisioner::off_instance());
    let renderer = Arc::new(MockRenderer::new().then_fail("browser crashed"));

    assert!(worker(renderer, &ledger, &queue, &provisioner)
        .run()
        .await
        .is_err());

    assert_eq!(queue.sent().len(), 1);
    assert_eq!(Subquery::from_json(&queue.sent()[0]).unwrap(), job());
    assert!(provisioner.launches().is_empty());
    assert_eq!(ledger.errors().len(), 1);
}

#[tokio::test]
async fn huge_tolerance_job_completes_without_panicking() {
    let body = job()
        .to_json()
        .unwrap()
        .replace("\"seconds_of_tolerance\":600", "\"seconds_of_tolerance\":10000000000000");
    assert_eq!(
        Subquery::from_json(&body).unwrap().tolerance_seconds,
        10_000_000_000_000
    );
    let ledger = MemoryLedger::new().with_query("floods");
    let queue = Arc::new(MemoryQueue::new().with_body(&body));
    let provisioner = on_instance();
    let renderer = Arc::new(MockRenderer::new());

    let stats = worker(renderer.clone(), &ledger, &queue, &provisioner)
        .run()
        .await
        .unwrap();

    // One empty page pushes the boundary below `since`.
    assert_eq!(renderer.requests().len(), 1);
    assert_eq!(stats.jobs_completed, 1);
    assert!(ledger.errors().is_empty());
    assert!(provisioner.launches().is_empty());
    assert_eq!(ledger.query_phase("floods"), Some(QueryPhase::Harvested));
}
