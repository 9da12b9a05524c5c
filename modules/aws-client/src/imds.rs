//! EC2 instance metadata (IMDSv2).
//!
//! Answers "who am I" for a running instance: the image, type, placement and
//! networking needed to launch an identical sibling. Off EC2 the link-local
//! endpoint does not answer and every call fails fast with
//! [`AwsError::Metadata`].

use std::time::Duration;

use serde::Deserialize;

use crate::error::{AwsError, Result};

const DEFAULT_BASE_URL: &str = "http://169.254.169.254";
const TOKEN_TTL_SECONDS: &str = "21600";

/// Everything needed to launch a replacement with the same configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub instance_id: String,
    pub image_id: String,
    pub instance_type: String,
    pub availability_zone: String,
    pub region: String,
    pub private_ip: Option<String>,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub instance_profile_arn: Option<String>,
    /// Raw (not base64) user data the instance booted with.
    pub user_data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IamInfo {
    instance_profile_arn: Option<String>,
}

pub struct InstanceMetadata {
    http: reqwest::Client,
    base_url: String,
}

impl InstanceMetadata {
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| AwsError::Setup(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn token(&self) -> Result<String> {
        let resp = self
            .http
            .put(format!("{}/latest/api/token", self.base_url))
            .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECONDS)
            .send()
            .await
            .map_err(|e| AwsError::Metadata(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AwsError::Metadata(format!(
                "token request returned {}",
                resp.status()
            )));
        }
        Ok(resp.text().await?)
    }

    /// GET a metadata path. `Ok(None)` on 404 (the category doesn't exist for
    /// this instance, e.g. no IAM role or no user data).
    async fn get(&self, token: &str, path: &str) -> Result<Option<String>> {
        let resp = self
            .http
            .get(format!("{}/latest/{}", self.base_url, path))
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .await
            .map_err(|e| AwsError::Metadata(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(AwsError::Metadata(format!("{path} returned {status}")));
        }
        Ok(Some(resp.text().await?.trim().to_string()))
    }

    async fn require(&self, token: &str, path: &str) -> Result<String> {
        self.get(token, path)
            .await?
            .ok_or_else(|| AwsError::Metadata(format!("{path} not present")))
    }

    /// Just the private IPv4 address.
    pub async fn local_ipv4(&self) -> Result<String> {
        let token = self.token().await?;
        self.require(&token, "meta-data/local-ipv4").await
    }

    pub async fn identity(&self) -> Result<InstanceIdentity> {
        let token = self.token().await?;

        let instance_id = self.require(&token, "meta-data/instance-id").await?;
        let image_id = self.require(&token, "meta-data/ami-id").await?;
        let instance_type = self.require(&token, "meta-data/instance-type").await?;
        let availability_zone = self
            .require(&token, "meta-data/placement/availability-zone")
            .await?;
        let region = match self.get(&token, "meta-data/placement/region").await? {
            Some(region) => region,
            None => region_from_zone(&availability_zone),
        };
        let private_ip = self.get(&token, "meta-data/local-ipv4").await?;

        let (subnet_id, security_group_ids) = match self.get(&token, "meta-data/mac").await? {
            Some(mac) => {
                let base = format!("meta-data/network/interfaces/macs/{mac}");
                let subnet = self.get(&token, &format!("{base}/subnet-id")).await?;
                let groups = self
                    .get(&token, &format!("{base}/security-group-ids"))
                    .await?
                    .map(|s| split_lines(&s))
                    .unwrap_or_default();
                (subnet, groups)
            }
            None => (None, Vec::new()),
        };

        let instance_profile_arn = match self.get(&token, "meta-data/iam/info").await? {
            Some(json) => serde_json::from_str::<IamInfo>(&json)
                .map_err(|e| AwsError::Parse(e.to_string()))?
                .instance_profile_arn,
            None => None,
        };

        let user_data = self.get(&token, "user-data").await?;

        Ok(InstanceIdentity {
            instance_id,
            image_id,
            instance_type,
            availability_zone,
            region,
            private_ip,
            subnet_id,
            security_group_ids,
            instance_profile_arn,
            user_data,
        })
    }
}

fn split_lines(s: &str) -> Vec<String> {
    s.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// `us-east-1a` -> `us-east-1`. Local Zones (`us-west-2-lax-1a`) are not
/// handled; IMDS reports `placement/region` on every current instance anyway.
fn region_from_zone(zone: &str) -> String {
    zone.trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .to_string()
}
