//! Drains the nodes of a node group ahead of scale-down, much like `kubectl drain` on each node.
//!
//! A node is cordoned, then drained with a grace period and a timeout. Eviction honors
//! PodDisruptionBudgets. When kubectl refuses because some pods have no controller, the drain is
//! retried once with `--force`. Afterwards the node is polled until no evictable pods remain.
//!
//! Nodes within a group are drained concurrently, each against its own deadline, so a stuck node
//! cannot spend another node's budget.
use models::command::{args, ClusterCommandRunner, ResourceList};
use models::poll::{poll_until, PollOutcome};

use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use serde::Serialize;
use snafu::ResultExt;
use tokio::time::{Duration, Instant};
use tracing::{event, instrument, Level};

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, drain_error::Error>;

// Maximum number of nodes of one group drained at the same time.
const CONCURRENT_NODE_DRAINS: usize = 4;

// kubectl prints this when unmanaged pods block a drain.
const FORCE_REQUIRED_MARKER: &str = "use --force to override";

// kubectl gets this long past its own --timeout to report before the call is abandoned.
const DRAIN_CALL_HEADROOM: Duration = Duration::from_secs(30);

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

/// How a single `kubectl drain` ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DrainAttempt {
    Evicted,
    /// kubectl refused because some pods have no controller.
    NeedsForce,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeDrainOutcome {
    Drained,
    EvictionFailed { error: String },
    TerminationTimedOut { elapsed_secs: u64, remaining: usize },
    TerminationCheckFailed { error: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeDrain {
    pub node: String,
    pub forced: bool,
    pub outcome: NodeDrainOutcome,
}

/// Per-node detail of draining one node group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupDrain {
    pub node_group: String,
    pub nodes: Vec<NodeDrain>,
}

impl GroupDrain {
    /// True only when every node evicted and fully terminated its pods in time. Anything else is a
    /// partial drain.
    pub fn all_succeeded(&self) -> bool {
        self.nodes
            .iter()
            .all(|node| node.outcome == NodeDrainOutcome::Drained)
    }
}

#[derive(Clone)]
pub struct PodDrainer<R: ClusterCommandRunner> {
    runner: R,
    label_key: String,
    grace_period_secs: u64,
    drain_timeout: Duration,
    termination_poll: Duration,
}

impl<R: ClusterCommandRunner> PodDrainer<R> {
    pub fn new(
        runner: R,
        label_key: &str,
        grace_period_secs: u64,
        drain_timeout: Duration,
        termination_poll: Duration,
    ) -> Self {
        PodDrainer {
            runner,
            label_key: label_key.to_string(),
            grace_period_secs,
            drain_timeout,
            termination_poll,
        }
    }

    #[instrument(skip(self), err)]
    pub async fn nodes_in_group(&self, node_group: &str) -> Result<Vec<String>> {
        let selector = format!("{}={}", self.label_key, node_group);
        let get_args = args(["get", "nodes", "-l", selector.as_str(), "-o", "json"]);
        let nodes: ResourceList<Node> = self
            .runner
            .kubectl(&get_args)
            .await
            .and_then(|output| output.ensure_success(&get_args))
            .and_then(|output| output.json())
            .context(drain_error::ListNodesSnafu { node_group })?;
        Ok(nodes.items.iter().map(|node| node.name_any()).collect())
    }

    /// Pods on the node that a drain is expected to remove.
    #[instrument(skip(self), err)]
    pub async fn pods_on_node(&self, node_name: &str) -> Result<Vec<PodRef>> {
        let selector = format!("spec.nodeName={}", node_name);
        let get_args = args([
            "get",
            "pods",
            "--all-namespaces",
            "--field-selector",
            selector.as_str(),
            "-o",
            "json",
        ]);
        let pods: ResourceList<Pod> = self
            .runner
            .kubectl(&get_args)
            .await
            .and_then(|output| output.ensure_success(&get_args))
            .and_then(|output| output.json())
            .context(drain_error::ListPodsSnafu { node_name })?;

        Ok(filter_pods(pods.items.into_iter())
            .map(|pod| PodRef {
                namespace: pod.namespace().unwrap_or_default(),
                name: pod.name_any(),
            })
            .collect())
    }

    /// Marks the node unschedulable.
    #[instrument(skip(self), err)]
    pub async fn cordon(&self, node_name: &str) -> Result<()> {
        let cordon_args = args(["cordon", node_name]);
        self.runner
            .kubectl(&cordon_args)
            .await
            .and_then(|output| output.ensure_success(&cordon_args))
            .context(drain_error::CordonSnafu { node_name })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn uncordon(&self, node_name: &str) -> Result<()> {
        let uncordon_args = args(["uncordon", node_name]);
        self.runner
            .kubectl(&uncordon_args)
            .await
            .and_then(|output| output.ensure_success(&uncordon_args))
            .context(drain_error::UncordonSnafu { node_name })?;
        Ok(())
    }

    pub async fn drain_node(&self, node_name: &str, force: bool) -> Result<DrainAttempt> {
        let grace_period = format!("--grace-period={}", self.grace_period_secs);
        let timeout = format!("--timeout={}s", self.drain_timeout.as_secs());
        let mut drain_args = args([
            "drain",
            node_name,
            "--ignore-daemonsets",
            "--delete-emptydir-data",
            grace_period.as_str(),
            timeout.as_str(),
        ]);
        if force {
            drain_args.push("--force".to_string());
        }

        let output = self
            .runner
            .kubectl_with_timeout(&drain_args, self.drain_timeout + DRAIN_CALL_HEADROOM)
            .await
            .context(drain_error::DrainCommandSnafu { node_name })?;
        if output.success {
            return Ok(DrainAttempt::Evicted);
        }
        if !force && output.stderr.contains(FORCE_REQUIRED_MARKER) {
            return Ok(DrainAttempt::NeedsForce);
        }
        drain_error::DrainRefusedSnafu {
            node_name,
            stderr: output.stderr.trim().to_string(),
        }
        .fail()
    }

    /// Cordons and drains the node, forcing once if unmanaged pods block eviction. Returns whether
    /// force was needed.
    #[instrument(skip(self), err)]
    pub async fn evict(&self, node_name: &str) -> Result<bool> {
        self.cordon(node_name).await?;
        match self.drain_node(node_name, false).await? {
            DrainAttempt::Evicted => Ok(false),
            DrainAttempt::NeedsForce => {
                event!(
                    Level::WARN,
                    node_name,
                    "Node has pods without a controller, retrying drain with --force."
                );
                self.drain_node(node_name, true).await?;
                Ok(true)
            }
        }
    }

    /// Polls until no evictable pods remain on the node.
    #[instrument(skip(self))]
    pub async fn wait_for_termination(
        &self,
        node_name: &str,
        timeout: Duration,
    ) -> PollOutcome<(), drain_error::Error> {
        poll_until("pod termination", self.termination_poll, timeout, move || async move {
            let remaining = self.pods_on_node(node_name).await?;
            if remaining.is_empty() {
                Ok(Some(()))
            } else {
                event!(
                    Level::DEBUG,
                    node_name,
                    remaining = remaining.len(),
                    "Waiting for pods to terminate."
                );
                Ok(None)
            }
        })
        .await
    }

    async fn drain_one(&self, node_name: String) -> NodeDrain {
        let deadline = Instant::now() + self.drain_timeout;
        let forced = match self.evict(&node_name).await {
            Ok(forced) => forced,
            Err(err) => {
                return NodeDrain {
                    node: node_name,
                    forced: false,
                    outcome: NodeDrainOutcome::EvictionFailed {
                        error: err.to_string(),
                    },
                }
            }
        };

        let budget = deadline.saturating_duration_since(Instant::now());
        let outcome = match self.wait_for_termination(&node_name, budget).await {
            PollOutcome::Ready(()) => NodeDrainOutcome::Drained,
            PollOutcome::Timeout { elapsed } => NodeDrainOutcome::TerminationTimedOut {
                elapsed_secs: elapsed.as_secs(),
                remaining: self
                    .pods_on_node(&node_name)
                    .await
                    .map(|pods| pods.len())
                    .unwrap_or_default(),
            },
            PollOutcome::Error(err) => NodeDrainOutcome::TerminationCheckFailed {
                error: err.to_string(),
            },
        };
        NodeDrain {
            node: node_name,
            forced,
            outcome,
        }
    }

    /// Drains every node of the group. Per-node failures are reported in the result rather than
    /// returned as errors; only failing to list the group's nodes is an error.
    #[instrument(skip(self), err)]
    pub async fn drain_group(&self, node_group: &str) -> Result<GroupDrain> {
        let node_names = self.nodes_in_group(node_group).await?;
        event!(
            Level::INFO,
            nodes = node_names.len(),
            "Draining node group."
        );

        let nodes: Vec<NodeDrain> = stream::iter(node_names)
            .map(|node_name| self.drain_one(node_name))
            .buffered(CONCURRENT_NODE_DRAINS)
            .collect()
            .await;

        for node in &nodes {
            if node.outcome != NodeDrainOutcome::Drained {
                event!(
                    Level::WARN,
                    node = %node.node,
                    outcome = ?node.outcome,
                    "Node was not fully drained."
                );
            }
        }
        Ok(GroupDrain {
            node_group: node_group.to_string(),
            nodes,
        })
    }

    /// Makes every node of the group schedulable again. Returns whether all uncordons succeeded.
    #[instrument(skip(self), err)]
    pub async fn uncordon_group(&self, node_group: &str) -> Result<bool> {
        let mut all_succeeded = true;
        for node_name in self.nodes_in_group(node_group).await? {
            if let Err(err) = self.uncordon(&node_name).await {
                event!(
                    Level::WARN,
                    node_name = %node_name,
                    error = %err,
                    "Unable to uncordon node."
                );
                all_succeeded = false;
            }
        }
        Ok(all_succeeded)
    }
}

/// Given all pods on a node, keeps those a drain should remove.
/// Completed pods, DaemonSet pods and static mirror pods are skipped.
fn filter_pods<F: Iterator<Item = Pod>>(pods: F) -> impl Iterator<Item = Pod> {
    pods.filter(|pod| {
        if let Some(phase) = pod.status.as_ref().and_then(|status| status.phase.as_ref()) {
            if phase == "Failed" || phase == "Succeeded" {
                return false;
            }
        }

        // The DaemonSet controller ignores cordons, so its pods would only come back.
        if let Some(owner_references) = pod.metadata.owner_references.as_ref() {
            if owner_references.iter().any(is_daemonset_controller) {
                return false;
            }
        }

        if let Some(annotations) = pod.metadata.annotations.as_ref() {
            if annotations.contains_key(MIRROR_POD_ANNOTATION) {
                return false;
            }
        }

        true
    })
}

fn is_daemonset_controller(owner: &OwnerReference) -> bool {
    owner.controller == Some(true) && owner.kind == "DaemonSet"
}

pub mod drain_error {
    use models::command::command_error;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to list nodes of node group '{}': {}", node_group, source))]
        ListNodes {
            node_group: String,
            source: command_error::Error,
        },

        #[snafu(display("Unable to list pods on node '{}': {}", node_name, source))]
        ListPods {
            node_name: String,
            source: command_error::Error,
        },

        #[snafu(display("Unable to cordon node '{}': {}", node_name, source))]
        Cordon {
            node_name: String,
            source: command_error::Error,
        },

        #[snafu(display("Unable to uncordon node '{}': {}", node_name, source))]
        Uncordon {
            node_name: String,
            source: command_error::Error,
        },

        #[snafu(display("Unable to run drain for node '{}': {}", node_name, source))]
        DrainCommand {
            node_name: String,
            source: command_error::Error,
        },

        #[snafu(display("Drain of node '{}' failed: {}", node_name, stderr))]
        DrainRefused { node_name: String, stderr: String },
    }
}
