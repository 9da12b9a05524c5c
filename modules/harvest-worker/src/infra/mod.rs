//! Production implementations of the worker's trait seams.

mod ledger;
pub mod provisioner;
pub mod queue;
pub mod renderer;

pub use provisioner::Ec2Provisioner;
pub use queue::SqsJobSource;
pub use renderer::ScrollingRenderer;
