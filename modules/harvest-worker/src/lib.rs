//! Harvest worker: drains subquery jobs from the queue, narrowing each job's
//! time window until every item in it has been recorded.

pub mod extractor;
pub mod healing;
pub mod infra;
pub mod narrowing;
pub mod search_url;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
