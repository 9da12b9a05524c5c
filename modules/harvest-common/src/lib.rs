pub mod config;
pub mod error;
pub mod types;

pub use config::{AwsKeys, Config, QueueLocation};
pub use error::HarvestError;
pub use types::*;
