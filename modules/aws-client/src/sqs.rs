//! Amazon SQS over the Query API.
//!
//! Covers the four calls a queue consumer needs: resolve a queue URL by name,
//! receive at most one message, delete it by receipt handle, and send a new
//! message body.

use serde::Deserialize;
use url::Url;

use crate::credentials::AwsCredentials;
use crate::error::{AwsError, Result};
use crate::query::QueryApi;

const SQS_VERSION: &str = "2012-11-05";

/// A received message. `receipt_handle` is what `delete_message` needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SqsMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageResponse {
    #[serde(default)]
    receive_message_result: ReceiveMessageResult,
}

#[derive(Debug, Default, Deserialize)]
struct ReceiveMessageResult {
    #[serde(rename = "Message", default)]
    messages: Vec<SqsMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueueUrlResponse {
    get_queue_url_result: GetQueueUrlResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueueUrlResult {
    queue_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendMessageResponse {
    send_message_result: SendMessageResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendMessageResult {
    message_id: String,
}

pub struct SqsClient {
    api: QueryApi,
    endpoint: Url,
}

impl SqsClient {
    pub fn new(credentials: AwsCredentials, region: &str) -> Result<Self> {
        let api = QueryApi::new(credentials, region, "sqs", SQS_VERSION)?;
        let endpoint = api.default_endpoint()?;
        Ok(Self { api, endpoint })
    }

    /// Point the client at a different endpoint (LocalStack, ElasticMQ, tests).
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self> {
        self.endpoint = Url::parse(endpoint)?;
        Ok(self)
    }

    /// Resolve a queue name to its URL.
    pub async fn queue_url(&self, queue_name: &str) -> Result<String> {
        let xml = self
            .api
            .call(
                &self.endpoint,
                "GetQueueUrl",
                &[("QueueName".to_string(), queue_name.to_string())],
            )
            .await?;
        let resp: GetQueueUrlResponse = quick_xml::de::from_str(&xml)?;
        Ok(resp.get_queue_url_result.queue_url)
    }

    /// Receive at most one message, long-polling for up to `wait_seconds`.
    pub async fn receive_message(
        &self,
        queue_url: &str,
        wait_seconds: u32,
    ) -> Result<Option<SqsMessage>> {
        let xml = self
            .api
            .call(
                &Url::parse(queue_url)?,
                "ReceiveMessage",
                &[
                    ("MaxNumberOfMessages".to_string(), "1".to_string()),
                    ("WaitTimeSeconds".to_string(), wait_seconds.min(20).to_string()),
                ],
            )
            .await?;
        let resp: ReceiveMessageResponse = quick_xml::de::from_str(&xml)?;
        Ok(resp.receive_message_result.messages.into_iter().next())
    }

    pub async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        self.api
            .call(
                &Url::parse(queue_url)?,
                "DeleteMessage",
                &[("ReceiptHandle".to_string(), receipt_handle.to_string())],
            )
            .await?;
        Ok(())
    }

    /// Enqueue `body`. Returns the new message id.
    pub async fn send_message(&self, queue_url: &str, body: &str) -> Result<String> {
        if body.is_empty() {
            return Err(AwsError::Parse("SQS message body must not be empty".into()));
        }
        let xml = self
            .api
            .call(
                &Url::parse(queue_url)?,
                "SendMessage",
                &[("MessageBody".to_string(), body.to_string())],
            )
            .await?;
        let resp: SendMessageResponse = quick_xml::de::from_str(&xml)?;
        Ok(resp.send_message_result.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_received_message_with_escaped_body() {
        let xml = r#"<ReceiveMessageResponse xmlns="http://queue.amazonaws.com/doc/2012-11-05/">
  <ReceiveMessageResult>
    <Message>
      <MessageId>5fea7756-0ea4-451a-a703-a558b933e274</MessageId>
      <ReceiptHandle>MbZj6wDWli+JvwwJaBV+3dcjk2YW2vA3+STFFljT</ReceiptHandle>
      <MD5OfBody>fafb00f5732ab283681e124bf8747ed1</MD5OfBody>
      <Body>{&quot;query_alias&quot;:&quot;floods&quot;}</Body>
    </Message>
  </ReceiveMessageResult>
  <ResponseMetadata><RequestId>b6633655-283d-45b4-aee4-4e84e0ae6afa</RequestId></ResponseMetadata>
</ReceiveMessageResponse>"#;

        let resp: ReceiveMessageResponse = quick_xml::de::from_str(xml).unwrap();
        let msg = &resp.receive_message_result.messages[0];
        assert_eq!(msg.receipt_handle, "MbZj6wDWli+JvwwJaBV+3dcjk2YW2vA3+STFFljT");
        assert_eq!(msg.body, r#"{"query_alias":"floods"}"#);
    }

    #[test]
    fn parses_empty_receive() {
        let xml = r#"<ReceiveMessageResponse>
  <ReceiveMessageResult></ReceiveMessageResult>
  <ResponseMetadata><RequestId>x</RequestId></ResponseMetadata>
</ReceiveMessageResponse>"#;

        let resp: ReceiveMessageResponse = quick_xml::de::from_str(xml).unwrap();
        assert!(resp.receive_message_result.messages.is_empty());
    }
}
