use anyhow::Result;
use async_trait::async_trait;

use aws_client::SqsClient;

use crate::traits::{JobSource, ReceivedJob};

/// How long `receive` long-polls before concluding the queue is empty.
const RECEIVE_WAIT_SECONDS: u32 = 5;

/// The subquery queue on SQS. The queue URL is resolved once up front.
pub struct SqsJobSource {
    client: SqsClient,
    queue_url: String,
    wait_seconds: u32,
}

impl SqsJobSource {
    pub fn new(client: SqsClient, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            wait_seconds: RECEIVE_WAIT_SECONDS,
        }
    }

    /// Resolve `queue_name` and bind to it.
    pub async fn by_name(client: SqsClient, queue_name: &str) -> Result<Self> {
        let queue_url = client.queue_url(queue_name).await?;
        tracing::info!(queue = queue_name, %queue_url, "Resolved job queue");
        Ok(Self::new(client, queue_url))
    }

    pub fn with_wait_seconds(mut self, wait_seconds: u32) -> Self {
        self.wait_seconds = wait_seconds;
        self
    }
}

#[async_trait]
impl JobSource for SqsJobSource {
    async fn receive(&self) -> Result<Option<ReceivedJob>> {
        let message = self
            .client
            .receive_message(&self.queue_url, self.wait_seconds)
            .await?;
        Ok(message.map(|m| ReceivedJob {
            body: m.body,
            receipt: m.receipt_handle,
        }))
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        Ok(self.client.delete_message(&self.queue_url, receipt).await?)
    }

    async fn send(&self, body: &str) -> Result<()> {
        let message_id = self.client.send_message(&self.queue_url, body).await?;
        tracing::debug!(%message_id, "Job enqueued");
        Ok(())
    }
}
