// Shared caller for AWS Query-protocol APIs (SQS, EC2): form-encoded POST,
// SigV4-signed, XML response body.

use std::time::Duration;

use chrono::Utc;
use url::Url;

use crate::credentials::AwsCredentials;
use crate::error::{AwsError, Result};
use crate::sigv4::{self, SigningParams};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

pub(crate) struct QueryApi {
    http: reqwest::Client,
    credentials: AwsCredentials,
    region: String,
    service: &'static str,
    version: &'static str,
}

impl QueryApi {
    pub(crate) fn new(
        credentials: AwsCredentials,
        region: &str,
        service: &'static str,
        version: &'static str,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AwsError::Setup(e.to_string()))?;

        Ok(Self {
            http,
            credentials,
            region: region.to_string(),
            service,
            version,
        })
    }

    /// The public regional endpoint, e.g. `https://sqs.us-east-1.amazonaws.com/`.
    pub(crate) fn default_endpoint(&self) -> Result<Url> {
        Ok(Url::parse(&format!(
            "https://{}.{}.amazonaws.com/",
            self.service, self.region
        ))?)
    }

    /// POST `Action` + `params` to `endpoint` and return the raw XML body.
    pub(crate) async fn call(
        &self,
        endpoint: &Url,
        action: &str,
        params: &[(String, String)],
    ) -> Result<String> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("Action", action)
            .append_pair("Version", self.version)
            .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();

        let signing = SigningParams {
            credentials: &self.credentials,
            region: &self.region,
            service: self.service,
            time: Utc::now(),
        };
        let auth_headers = sigv4::sign(
            "POST",
            endpoint,
            &[("content-type", FORM_CONTENT_TYPE)],
            body.as_bytes(),
            &signing,
        );

        let mut req = self
            .http
            .post(endpoint.clone())
            .header("content-type", FORM_CONTENT_TYPE)
            .body(body);
        for (name, value) in auth_headers {
            req = req.header(name, value);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            tracing::debug!(service = self.service, action, %status, "AWS call failed");
            return Err(AwsError::Api {
                status: status.as_u16(),
                message: text.chars().take(500).collect(),
            });
        }

        Ok(text)
    }
}
