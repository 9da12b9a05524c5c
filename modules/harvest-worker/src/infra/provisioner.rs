use anyhow::{Context, Result};
use async_trait::async_trait;

use aws_client::{Ec2Client, InstanceIdentity, InstanceMetadata};

use crate::traits::{Provisioner, WorkerIdentity};

const GENERATION_TAG: &str = "generation";

/// Identity from instance metadata, generation from the instance's own tags,
/// launches through EC2 RunInstances.
pub struct Ec2Provisioner {
    metadata: InstanceMetadata,
    ec2: Ec2Client,
}

impl Ec2Provisioner {
    pub fn new(metadata: InstanceMetadata, ec2: Ec2Client) -> Self {
        Self { metadata, ec2 }
    }
}

#[async_trait]
impl Provisioner for Ec2Provisioner {
    async fn identity(&self) -> Result<WorkerIdentity> {
        let instance = self
            .metadata
            .identity()
            .await
            .context("querying instance metadata")?;
        let tags = self
            .ec2
            .instance_tags(&instance.instance_id)
            .await
            .context("reading instance tags")?;

        Ok(WorkerIdentity {
            generation: parse_generation(tags.get(GENERATION_TAG).map(String::as_str)),
            instance,
        })
    }

    async fn launch(&self, instance: &InstanceIdentity, tags: &[(String, String)]) -> Result<String> {
        Ok(self.ec2.run_instance(instance, tags).await?)
    }
}

/// Untagged or garbled instances count as generation 0.
fn parse_generation(tag: Option<&str>) -> u32 {
    tag.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}
