//! Thin AWS clients for the pieces a harvest worker touches: SQS for the job
//! queue, EC2 + instance metadata for launching replacements.
//!
//! Requests are signed in-crate with SigV4; there is no AWS SDK dependency.

pub mod credentials;
pub mod ec2;
pub mod error;
pub mod imds;
mod query;
pub mod sigv4;
pub mod sqs;

pub use credentials::AwsCredentials;
pub use ec2::Ec2Client;
pub use error::{AwsError, Result};
pub use imds::{InstanceIdentity, InstanceMetadata};
pub use sqs::{SqsClient, SqsMessage};
