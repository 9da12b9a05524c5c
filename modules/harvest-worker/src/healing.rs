//! Self-healing: a failing worker launches its own replacement before it
//! exits, so fleet capacity comes back without an outside orchestrator.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::traits::Provisioner;

/// What happened to a replacement request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replacement {
    Launched { instance_id: String, generation: u32 },
    /// The environment could not tell us who we are.
    Unavailable,
    /// The next generation would exceed the configured cap.
    CapReached { generation: u32, cap: u32 },
    LaunchFailed,
}

impl fmt::Display for Replacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launched {
                instance_id,
                generation,
            } => write!(f, "launched {instance_id} (generation {generation})"),
            Self::Unavailable => write!(f, "skipped (environment unavailable)"),
            Self::CapReached { generation, cap } => {
                write!(f, "skipped (generation {generation} exceeds cap {cap})")
            }
            Self::LaunchFailed => write!(f, "launch failed"),
        }
    }
}

pub struct Healer {
    provisioner: Arc<dyn Provisioner>,
    module: String,
    max_generation: Option<u32>,
}

impl Healer {
    pub fn new(provisioner: Arc<dyn Provisioner>, module: impl Into<String>) -> Self {
        Self {
            provisioner,
            module: module.into(),
            max_generation: None,
        }
    }

    /// Refuse to launch generations above `cap`.
    pub fn with_max_generation(mut self, cap: Option<u32>) -> Self {
        self.max_generation = cap;
        self
    }

    /// Launch one sibling configured like this instance, tagged one generation
    /// up. Never fails; problems are logged and reported in the outcome.
    pub async fn request_replacement(&self) -> Replacement {
        let me = match self.provisioner.identity().await {
            Ok(me) => me,
            Err(e) => {
                warn!(error = %e, "Instance identity unavailable, not requesting a replacement");
                return Replacement::Unavailable;
            }
        };

        let generation = me.generation.saturating_add(1);
        if let Some(cap) = self.max_generation {
            if generation > cap {
                warn!(generation, cap, "Generation cap reached, not requesting a replacement");
                return Replacement::CapReached { generation, cap };
            }
        }

        let tags = vec![
            ("module".to_string(), self.module.clone()),
            ("generation".to_string(), generation.to_string()),
        ];

        match self.provisioner.launch(&me.instance, &tags).await {
            Ok(instance_id) => {
                info!(
                    replaces = %me.instance.instance_id,
                    %instance_id,
                    generation,
                    "Replacement worker launched"
                );
                Replacement::Launched {
                    instance_id,
                    generation,
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to launch replacement worker");
                Replacement::LaunchFailed
            }
        }
    }
}
