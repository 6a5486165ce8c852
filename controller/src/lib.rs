pub mod autoscaler;
pub mod bootstrap;
pub mod dependency;
pub mod drain;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod verification;
pub mod webhook;
pub mod workload;

#[cfg(test)]
mod test_support;

pub use crate::orchestrator::ClusterLifecycleOrchestrator;
