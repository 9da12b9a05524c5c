//! Amazon EC2 over the Query API: read an instance's tags and launch a
//! sibling instance from an [`InstanceIdentity`].

use std::collections::HashMap;

use base64::Engine;
use serde::Deserialize;
use url::Url;

use crate::credentials::AwsCredentials;
use crate::error::{AwsError, Result};
use crate::imds::InstanceIdentity;
use crate::query::QueryApi;

const EC2_VERSION: &str = "2016-11-15";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeTagsResponse {
    #[serde(default)]
    tag_set: ItemSet<TagItem>,
}

#[derive(Debug, Deserialize)]
struct ItemSet<T> {
    #[serde(rename = "item", default = "Vec::new")]
    items: Vec<T>,
}

impl<T> Default for ItemSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
struct TagItem {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunInstancesResponse {
    #[serde(default)]
    instances_set: ItemSet<LaunchedInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchedInstance {
    instance_id: String,
}

pub struct Ec2Client {
    api: QueryApi,
    endpoint: Url,
}

impl Ec2Client {
    pub fn new(credentials: AwsCredentials, region: &str) -> Result<Self> {
        let api = QueryApi::new(credentials, region, "ec2", EC2_VERSION)?;
        let endpoint = api.default_endpoint()?;
        Ok(Self { api, endpoint })
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self> {
        self.endpoint = Url::parse(endpoint)?;
        Ok(self)
    }

    /// All tags on `instance_id` as a key → value map.
    pub async fn instance_tags(&self, instance_id: &str) -> Result<HashMap<String, String>> {
        let params = vec![
            ("Filter.1.Name".to_string(), "resource-id".to_string()),
            ("Filter.1.Value.1".to_string(), instance_id.to_string()),
        ];
        let xml = self.api.call(&self.endpoint, "DescribeTags", &params).await?;
        let resp: DescribeTagsResponse = quick_xml::de::from_str(&xml)?;

        Ok(resp
            .tag_set
            .items
            .into_iter()
            .map(|t| (t.key, t.value))
            .collect())
    }

    /// Launch one instance configured like `identity`, tagged with `tags`.
    /// Returns the new instance id.
    pub async fn run_instance(
        &self,
        identity: &InstanceIdentity,
        tags: &[(String, String)],
    ) -> Result<String> {
        let params = run_instances_params(identity, tags);
        let xml = self.api.call(&self.endpoint, "RunInstances", &params).await?;
        let resp: RunInstancesResponse = quick_xml::de::from_str(&xml)?;

        resp.instances_set
            .items
            .into_iter()
            .next()
            .map(|i| i.instance_id)
            .ok_or_else(|| AwsError::Parse("RunInstances returned no instances".into()))
    }
}

fn run_instances_params(
    identity: &InstanceIdentity,
    tags: &[(String, String)],
) -> Vec<(String, String)> {
    let mut params = vec![
        ("ImageId".to_string(), identity.image_id.clone()),
        ("InstanceType".to_string(), identity.instance_type.clone()),
        ("MinCount".to_string(), "1".to_string()),
        ("MaxCount".to_string(), "1".to_string()),
        (
            "Placement.AvailabilityZone".to_string(),
            identity.availability_zone.clone(),
        ),
    ];

    if let Some(ref subnet) = identity.subnet_id {
        params.push(("SubnetId".to_string(), subnet.clone()));
    }
    for (i, group) in identity.security_group_ids.iter().enumerate() {
        params.push((format!("SecurityGroupId.{}", i + 1), group.clone()));
    }
    if let Some(ref arn) = identity.instance_profile_arn {
        params.push(("IamInstanceProfile.Arn".to_string(), arn.clone()));
    }
    if let Some(ref user_data) = identity.user_data {
        params.push((
            "UserData".to_string(),
            base64::engine::general_purpose::STANDARD.encode(user_data),
        ));
    }

    if !tags.is_empty() {
        params.push((
            "TagSpecification.1.ResourceType".to_string(),
            "instance".to_string(),
        ));
        for (i, (key, value)) in tags.iter().enumerate() {
            params.push((format!("TagSpecification.1.Tag.{}.Key", i + 1), key.clone()));
            params.push((format!("TagSpecification.1.Tag.{}.Value", i + 1), value.clone()));
        }
    }

    params
}
