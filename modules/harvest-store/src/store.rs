use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::debug;

use harvest_common::{Attempt, ErrorRecord, Progress, QueryPhase, Sighting, Subquery};

use crate::error::Result;

/// Row of the `aws_credentials` table.
#[derive(Clone, sqlx::FromRow)]
pub struct StoredAwsCredentials {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub region_name: Option<String>,
}

impl std::fmt::Debug for StoredAwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredAwsCredentials")
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field("region_name", &self.region_name)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct HarvestStore {
    pool: PgPool,
}

impl HarvestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A worker owns exactly one connection for its lifetime.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<StoreTx> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }

    /// Last committed narrowing state of a subquery, if it is tracked.
    pub async fn progress(&self, query_alias: &str, since: DateTime<Utc>) -> Result<Option<Progress>> {
        let row = sqlx::query_as::<_, (Option<DateTime<Utc>>, bool)>(
            r#"
            SELECT current_until, complete
            FROM subquery
            WHERE query_alias = $1 AND since = $2
            "#,
        )
        .bind(query_alias)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(current_until, complete)| Progress {
            current_until,
            complete,
        }))
    }

    /// Append an error record in its own (implicit) transaction.
    pub async fn record_error(&self, record: &ErrorRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO error (job_snapshot, error_detail, module, worker_ip)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&record.job_snapshot)
        .bind(&record.error_detail)
        .bind(&record.module)
        .bind(&record.worker_ip)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn aws_credentials(&self) -> Result<Option<StoredAwsCredentials>> {
        let row = sqlx::query_as::<_, StoredAwsCredentials>(
            "SELECT aws_access_key_id, aws_secret_access_key, region_name FROM aws_credentials LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// All sightings for a query, oldest first.
    pub async fn sightings(&self, query_alias: &str) -> Result<Vec<Sighting>> {
        let rows = sqlx::query_as::<
            _,
            (
                String,
                DateTime<Utc>,
                DateTime<Utc>,
                String,
                DateTime<Utc>,
                DateTime<Utc>,
                String,
            ),
        >(
            r#"
            SELECT query_alias, since, until, item_id, published_at, observed_at, source_url
            FROM sighting
            WHERE query_alias = $1
            ORDER BY published_at ASC, item_id ASC
            "#,
        )
        .bind(query_alias)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(query_alias, since, until, item_id, published_at, observed_at, source_url)| {
                    Sighting {
                        query_alias,
                        since,
                        until,
                        item_id,
                        published_at,
                        observed_at,
                        source_url,
                    }
                },
            )
            .collect())
    }

    pub async fn attempt_count(&self, query_alias: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM attempt WHERE query_alias = $1")
            .bind(query_alias)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn query_status(&self, query_alias: &str) -> Result<Option<String>> {
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM query WHERE query_alias = $1")
            .bind(query_alias)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status)
    }
}

/// One narrowing iteration's writes. Dropping it without `commit` rolls the
/// whole iteration back.
pub struct StoreTx {
    tx: Transaction<'static, Postgres>,
}

impl StoreTx {
    pub async fn insert_attempt(&mut self, attempt: &Attempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO attempt (query_alias, since, until, source_url, worker_ip, empty)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&attempt.query_alias)
        .bind(attempt.since)
        .bind(attempt.until)
        .bind(&attempt.source_url)
        .bind(&attempt.worker_ip)
        .bind(attempt.empty)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Insert sightings, silently skipping `(query_alias, item_id)` pairs that
    /// already exist. Returns how many rows were new.
    pub async fn insert_sightings(&mut self, sightings: &[Sighting]) -> Result<u64> {
        if sightings.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO sighting (query_alias, item_id, since, until, published_at, observed_at, source_url) ",
        );
        qb.push_values(sightings, |mut b, s| {
            b.push_bind(&s.query_alias)
                .push_bind(&s.item_id)
                .push_bind(s.since)
                .push_bind(s.until)
                .push_bind(s.published_at)
                .push_bind(s.observed_at)
                .push_bind(&s.source_url);
        });
        qb.push(" ON CONFLICT (query_alias, item_id) DO NOTHING");

        let result = qb.build().execute(&mut *self.tx).await?;
        debug!(
            offered = sightings.len(),
            inserted = result.rows_affected(),
            "sightings written"
        );
        Ok(result.rows_affected())
    }

    /// Record `job.until` as the subquery's committed boundary. The stored
    /// boundary never moves up, even if a stale copy of the job is replayed.
    pub async fn save_progress(&mut self, job: &Subquery) -> Result<()> {
        self.upsert_subquery(job, false).await
    }

    /// Mark the subquery complete.
    pub async fn mark_complete(&mut self, job: &Subquery) -> Result<()> {
        self.upsert_subquery(job, true).await
    }

    async fn upsert_subquery(&mut self, job: &Subquery, complete: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subquery
                (query_alias, since, until, search_terms, language,
                 seconds_of_tolerance, current_until, complete)
            VALUES ($1, $2, $3, $4, $5, $6, $3, $7)
            ON CONFLICT (query_alias, since) DO UPDATE SET
                current_until = LEAST(subquery.current_until, EXCLUDED.current_until),
                complete      = subquery.complete OR EXCLUDED.complete,
                updated_at    = now()
            "#,
        )
        .bind(&job.query_alias)
        .bind(job.since)
        .bind(job.until)
        .bind(&job.search_terms)
        .bind(&job.language)
        .bind(job.tolerance_seconds)
        .bind(complete)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Advance the parent query to its next phase if no subquery of it is
    /// still incomplete. Returns whether the status changed.
    pub async fn advance_query(&mut self, query_alias: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE query
            SET status = $2
            WHERE query_alias = $1
              AND status = $3
              AND NOT EXISTS (
                  SELECT 1 FROM subquery s
                  WHERE s.query_alias = query.query_alias AND NOT s.complete
              )
            "#,
        )
        .bind(query_alias)
        .bind(QueryPhase::Harvested.as_str())
        .bind(QueryPhase::Harvesting.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
