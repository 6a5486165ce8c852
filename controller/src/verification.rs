//! Post-restore verification of the instances backing a cluster's nodes, at three levels of
//! strictness. Every level includes the checks of the levels below it.
use crate::bootstrap::ClusterNode;
use crate::provider::{ControlPlaneApi, InstanceHealth};
use models::command::{args, ClusterCommandRunner, ResourceList};

use k8s_openapi::api::core::v1::Node;
use serde::Serialize;
use snafu::ResultExt;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{event, instrument, Level};

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, verification_error::Error>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
pub enum VerificationLevel {
    /// Instance running and node Ready.
    #[strum(serialize = "state")]
    State,
    /// Adds the EC2 system status check.
    #[strum(serialize = "system")]
    System,
    /// Adds the EC2 instance reachability check.
    #[strum(serialize = "full")]
    Full,
}

impl VerificationLevel {
    pub const ALL: [VerificationLevel; 3] = [
        VerificationLevel::State,
        VerificationLevel::System,
        VerificationLevel::Full,
    ];
}

impl FromStr for VerificationLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        for level in VerificationLevel::ALL.iter() {
            if level.to_string() == s {
                return Ok(*level);
            }
        }
        Err(format!(
            "unknown verification level '{}', expected state, system or full",
            s
        ))
    }
}

/// What was observed about one node in a single pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeObservation {
    pub node: String,
    pub instance_id: Option<String>,
    pub node_ready: bool,
    pub health: Option<InstanceHealth>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckDetail {
    pub node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub level: VerificationLevel,
    pub passed: bool,
    pub summary: String,
    pub checks: Vec<CheckDetail>,
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} verification: {}", self.level, self.summary)
    }
}

fn check_node(
    level: VerificationLevel,
    observation: &NodeObservation,
) -> std::result::Result<(), String> {
    let health = match (&observation.instance_id, &observation.health) {
        (None, _) => return Err("node has no EC2 provider id".to_string()),
        (Some(_), None) => return Err("no instance status reported".to_string()),
        (Some(_), Some(health)) => health,
    };
    if !health.running {
        return Err("instance is not running".to_string());
    }
    if !observation.node_ready {
        return Err("node is not Ready".to_string());
    }
    if level >= VerificationLevel::System && !health.system_status_ok {
        return Err("system status check failing".to_string());
    }
    if level >= VerificationLevel::Full && !health.instance_status_ok {
        return Err("instance reachability check failing".to_string());
    }
    Ok(())
}

/// Judges the observations at the given level. A cluster without nodes never passes.
pub fn evaluate(level: VerificationLevel, observations: &[NodeObservation]) -> VerificationResult {
    let checks: Vec<CheckDetail> = observations
        .iter()
        .map(|observation| {
            let outcome = check_node(level, observation);
            CheckDetail {
                node: observation.node.clone(),
                instance_id: observation.instance_id.clone(),
                passed: outcome.is_ok(),
                reason: outcome.err(),
            }
        })
        .collect();

    let failed = checks.iter().filter(|check| !check.passed).count();
    let passed = !checks.is_empty() && failed == 0;
    let summary = if checks.is_empty() {
        "no nodes found".to_string()
    } else {
        format!("{} of {} nodes passed", checks.len() - failed, checks.len())
    };
    VerificationResult {
        level,
        passed,
        summary,
        checks,
    }
}

/// The EC2 instance id is the last path segment of `aws:///<az>/<instance-id>`.
fn instance_id_of(node: &Node) -> Option<String> {
    node.spec
        .as_ref()
        .and_then(|spec| spec.provider_id.as_ref())
        .filter(|provider_id| provider_id.starts_with("aws://"))
        .and_then(|provider_id| provider_id.rsplit('/').next())
        .filter(|instance_id| !instance_id.is_empty())
        .map(str::to_string)
}

pub struct Verifier<R: ClusterCommandRunner, P: ControlPlaneApi> {
    runner: R,
    provider: P,
}

impl<R: ClusterCommandRunner, P: ControlPlaneApi> Verifier<R, P> {
    pub fn new(runner: R, provider: P) -> Self {
        Verifier { runner, provider }
    }

    #[instrument(skip(self), err)]
    pub async fn observe(&self) -> Result<Vec<NodeObservation>> {
        let get_args = args(["get", "nodes", "-o", "json"]);
        let nodes: ResourceList<Node> = self
            .runner
            .kubectl(&get_args)
            .await
            .and_then(|output| output.ensure_success(&get_args))
            .and_then(|output| output.json())
            .context(verification_error::ListNodesSnafu)?;

        let instance_ids: Vec<String> = nodes.items.iter().filter_map(instance_id_of).collect();
        let mut health: HashMap<String, InstanceHealth> = if instance_ids.is_empty() {
            HashMap::new()
        } else {
            self.provider
                .instance_health(&instance_ids)
                .await
                .context(verification_error::InstanceHealthSnafu)?
                .into_iter()
                .map(|health| (health.instance_id.clone(), health))
                .collect()
        };

        Ok(nodes
            .items
            .iter()
            .map(|node| {
                let seen = ClusterNode::from_node(node);
                let instance_id = instance_id_of(node);
                NodeObservation {
                    node: seen.name,
                    node_ready: seen.ready,
                    health: instance_id.as_ref().and_then(|id| health.remove(id)),
                    instance_id,
                }
            })
            .collect())
    }

    pub async fn verify(&self, level: VerificationLevel) -> Result<VerificationResult> {
        let result = evaluate(level, &self.observe().await?);
        event!(
            Level::INFO,
            %level,
            passed = result.passed,
            summary = %result.summary,
            "Verified cluster instances."
        );
        Ok(result)
    }
}

pub mod verification_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to list cluster nodes: {}", source))]
        ListNodes {
            source: models::command::command_error::Error,
        },

        #[snafu(display("Unable to fetch instance health: {}", source))]
        InstanceHealth {
            source: crate::provider::provider_error::Error,
        },
    }
}
