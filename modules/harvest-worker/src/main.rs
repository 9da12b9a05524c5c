use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aws_client::{AwsCredentials, Ec2Client, InstanceMetadata, SqsClient};
use browserless_client::{BrowserlessClient, ScrollOptions};
use harvest_common::{Config, QueueLocation};
use harvest_store::HarvestStore;
use harvest_worker::healing::Healer;
use harvest_worker::infra::{Ec2Provisioner, ScrollingRenderer, SqsJobSource};
use harvest_worker::narrowing::NarrowingEngine;
use harvest_worker::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::from_default_env().add_directive("harvest=info".parse()?);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Harvest worker starting...");

    let config = Config::from_env()?;
    config.log_redacted();

    // Postgres: one connection for the life of the worker
    let store = HarvestStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;

    let (credentials, region) = aws_credentials(&config, &store).await?;

    // Job queue
    let sqs = SqsClient::new(credentials.clone(), &region)?;
    let queue = match &config.queue {
        QueueLocation::Url(url) => SqsJobSource::new(sqs, url.clone()),
        QueueLocation::Name(name) => SqsJobSource::by_name(sqs, name).await?,
    };

    // Renderer
    let browserless = BrowserlessClient::new(
        &config.browserless_url,
        config.browserless_token.as_deref(),
    )?;
    let renderer = ScrollingRenderer::new(
        browserless,
        ScrollOptions {
            cycles: config.scroll_cycles,
            settle: config.scroll_settle,
        },
    );

    let worker_ip = match InstanceMetadata::new()?.local_ipv4().await {
        Ok(ip) => ip,
        Err(e) => {
            warn!(error = %e, "Instance metadata unavailable, worker ip unknown");
            "unknown".to_string()
        }
    };
    info!(%worker_ip, module = %config.worker_module, "Worker identity");

    let provisioner = Ec2Provisioner::new(
        InstanceMetadata::new()?,
        Ec2Client::new(credentials, &region)?,
    );
    let healer = Healer::new(Arc::new(provisioner), config.worker_module.clone())
        .with_max_generation(config.max_generation);

    let ledger = Arc::new(store);
    let engine = NarrowingEngine::new(
        Arc::new(renderer),
        ledger.clone(),
        config.search_base_url.clone(),
        worker_ip.clone(),
    );
    let supervisor = Supervisor::new(
        Arc::new(queue),
        ledger,
        engine,
        healer,
        config.worker_module.clone(),
        worker_ip,
    );

    let stats = supervisor.run().await?;

    info!("Harvest worker finished. {stats}");
    Ok(())
}

/// Keys from the environment, or else the first row of `aws_credentials`.
async fn aws_credentials(config: &Config, store: &HarvestStore) -> Result<(AwsCredentials, String)> {
    if let Some(keys) = &config.aws_keys {
        let mut credentials =
            AwsCredentials::new(keys.access_key_id.clone(), keys.secret_access_key.clone());
        if let Some(token) = &keys.session_token {
            credentials = credentials.with_session_token(token.clone());
        }
        return Ok((credentials, config.aws_region.clone()));
    }

    let stored = store
        .aws_credentials()
        .await?
        .context("no AWS keys in the environment and no row in aws_credentials")?;
    info!("Using AWS credentials from the database");

    let region = stored
        .region_name
        .clone()
        .unwrap_or_else(|| config.aws_region.clone());
    Ok((
        AwsCredentials::new(stored.aws_access_key_id, stored.aws_secret_access_key),
        region,
    ))
}
