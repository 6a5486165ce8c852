//! Decides whether a freshly scaled-up cluster is fit to receive workloads: enough ready nodes,
//! a catalog of system workloads up, and DNS answering.
use crate::error::{self, CriticalPathError};
use crate::workload::{ServiceSpec, WorkloadInspector};
use models::capacity::ClusterIdentity;
use models::command::{args, ClusterCommandRunner, ResourceList};
use models::constants::{
    APP_MANAGED_BY, DNS_CHECK_COMPONENT, DNS_CHECK_IMAGE, DNS_LOOKUP_TARGET, KUBE_SYSTEM_NAMESPACE,
    LABEL_COMPONENT, LIFECYCLE, SYSTEM_NODE_FLOOR,
};
use models::poll::{poll_until, PollOutcome};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use serde::Serialize;
use snafu::ResultExt;
use std::convert::Infallible;
use tokio::time::Duration;
use tracing::{event, instrument, Level};
use uuid::Uuid;

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, bootstrap_error::Error>;

/// A node as seen in one check cycle. Never cached across cycles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterNode {
    pub name: String,
    pub ready: bool,
    pub schedulable: bool,
}

impl ClusterNode {
    pub(crate) fn from_node(node: &Node) -> Self {
        let ready = node
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_ref())
            .and_then(|conds| conds.iter().find(|cond| cond.type_ == "Ready"))
            .map(|cond| cond.status == "True")
            .unwrap_or(false);
        let schedulable = !node
            .spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false);
        ClusterNode {
            name: node.name_any(),
            ready,
            schedulable,
        }
    }

    pub fn is_available(&self) -> bool {
        self.ready && self.schedulable
    }
}

/// System workloads a bootstrapped cluster is expected to run. Only DNS is required; the rest pass
/// when they are not installed.
pub fn default_catalog() -> Vec<ServiceSpec> {
    vec![
        ServiceSpec::deployment("coredns", KUBE_SYSTEM_NAMESPACE, 1, true),
        ServiceSpec::deployment(
            "aws-load-balancer-controller",
            KUBE_SYSTEM_NAMESPACE,
            1,
            false,
        ),
        ServiceSpec::deployment("cluster-autoscaler", KUBE_SYSTEM_NAMESPACE, 1, false),
        ServiceSpec::deployment("ebs-csi-controller", KUBE_SYSTEM_NAMESPACE, 1, false),
        ServiceSpec::deployment("metrics-server", KUBE_SYSTEM_NAMESPACE, 1, false),
    ]
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub ready_nodes: usize,
    pub dns_resolved: bool,
}

#[derive(Clone)]
pub struct BootstrapGate<R: ClusterCommandRunner + Clone> {
    runner: R,
    inspector: WorkloadInspector<R>,
    catalog: Vec<ServiceSpec>,
    timeout: Duration,
    poll_interval: Duration,
}

impl<R: ClusterCommandRunner + Clone> BootstrapGate<R> {
    pub fn new(
        runner: R,
        catalog: Vec<ServiceSpec>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        BootstrapGate {
            inspector: WorkloadInspector::new(runner.clone()),
            runner,
            catalog,
            timeout,
            poll_interval,
        }
    }

    async fn list_nodes(&self, get_args: &[String]) -> Result<Vec<ClusterNode>> {
        let nodes: ResourceList<Node> = self
            .runner
            .kubectl(get_args)
            .await
            .and_then(|output| output.ensure_success(get_args))
            .and_then(|output| output.json())
            .context(bootstrap_error::ListNodesSnafu)?;
        Ok(nodes.items.iter().map(ClusterNode::from_node).collect())
    }

    #[instrument(skip(self), err)]
    pub async fn cluster_nodes(&self) -> Result<Vec<ClusterNode>> {
        self.list_nodes(&args(["get", "nodes", "-o", "json"]))
            .await
    }

    /// Nodes whose `label_key` label names one of `node_groups`.
    #[instrument(skip(self), err)]
    pub async fn group_nodes(
        &self,
        label_key: &str,
        node_groups: &[String],
    ) -> Result<Vec<ClusterNode>> {
        if node_groups.is_empty() {
            return Ok(Vec::new());
        }
        let selector = format!("{} in ({})", label_key, node_groups.join(","));
        let get_args = args(["get", "nodes", "-l", selector.as_str(), "-o", "json"]);
        self.list_nodes(&get_args).await
    }

    /// Succeeds when at least `min_nodes` nodes, and never fewer than the system floor, are ready
    /// and schedulable.
    #[instrument(skip(self), err)]
    pub async fn validate_minimum(
        &self,
        min_nodes: usize,
    ) -> std::result::Result<usize, CriticalPathError> {
        let required = std::cmp::max(min_nodes, SYSTEM_NODE_FLOOR);
        let ready = self
            .cluster_nodes()
            .await
            .context(error::NodeQuerySnafu)?
            .iter()
            .filter(|node| node.is_available())
            .count();
        if ready < required {
            return error::InsufficientNodesSnafu { ready, required }.fail();
        }
        event!(
            Level::INFO,
            ready,
            required,
            "Cluster has enough available nodes."
        );
        Ok(ready)
    }

    /// A deployment that is not installed counts as ready.
    pub async fn deployment_ready(&self, name: &str, namespace: &str, min_replicas: i32) -> bool {
        let spec = ServiceSpec::deployment(name, namespace, min_replicas, false);
        self.inspector.is_ready(&spec).await
    }

    /// Runs a throwaway pod that resolves the API server's service name.
    #[instrument(skip(self))]
    pub async fn dns_smoke_test(&self) -> bool {
        let suffix = Uuid::new_v4().to_simple().to_string();
        let pod_name = format!("{}-{}", DNS_CHECK_COMPONENT, &suffix[..8]);
        let image = format!("--image={}", DNS_CHECK_IMAGE);
        let labels = format!(
            "--labels={}={},{}={}",
            LABEL_COMPONENT, DNS_CHECK_COMPONENT, APP_MANAGED_BY, LIFECYCLE
        );
        let run_args = args([
            "run",
            pod_name.as_str(),
            image.as_str(),
            "--restart=Never",
            "--rm",
            "-i",
            labels.as_str(),
            "--",
            "nslookup",
            DNS_LOOKUP_TARGET,
        ]);

        match self.runner.kubectl(&run_args).await {
            Ok(output) if output.success && output.stdout.contains(DNS_LOOKUP_TARGET) => {
                event!(
                    Level::INFO,
                    "DNS smoke test resolved the cluster service name."
                );
                true
            }
            Ok(output) => {
                event!(
                    Level::WARN,
                    stderr = %output.stderr.trim(),
                    "DNS smoke test did not resolve."
                );
                false
            }
            Err(err) => {
                event!(Level::WARN, error = %err, "Unable to run DNS smoke test.");
                false
            }
        }
    }

    async fn pending_services(&self) -> Vec<String> {
        let mut pending = Vec::new();
        for service in &self.catalog {
            if !self.inspector.is_ready(service).await {
                pending.push(service.to_string());
            }
        }
        pending
    }

    /// Full readiness gate. Insufficient nodes or a catalog that never comes up are critical
    /// failures; a failed DNS smoke test is only reported.
    #[instrument(skip(self), err)]
    pub async fn validate_all(
        &self,
        cluster: &ClusterIdentity,
        min_nodes: usize,
    ) -> std::result::Result<BootstrapReport, CriticalPathError> {
        let ready_nodes = self.validate_minimum(min_nodes).await?;

        let outcome = poll_until(
            "system workloads",
            self.poll_interval,
            self.timeout,
            move || async move {
                let pending = self.pending_services().await;
                Ok::<_, Infallible>(if pending.is_empty() { Some(()) } else { None })
            },
        )
        .await;
        match outcome {
            PollOutcome::Ready(()) => {}
            PollOutcome::Timeout { elapsed } => {
                let pending = self.pending_services().await;
                event!(Level::ERROR, %cluster, ?pending, "System workloads never became ready.");
                return error::BootstrapTimeoutSnafu { pending, elapsed }.fail();
            }
            PollOutcome::Error(never) => match never {},
        }

        let dns_resolved = self.dns_smoke_test().await;
        event!(
            Level::INFO,
            %cluster,
            ready_nodes,
            dns_resolved,
            "Cluster passed bootstrap validation."
        );
        Ok(BootstrapReport {
            ready_nodes,
            dns_resolved,
        })
    }

    pub fn catalog(&self) -> &[ServiceSpec] {
        &self.catalog
    }
}

pub mod bootstrap_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to list cluster nodes: {}", source))]
        ListNodes {
            source: models::command::command_error::Error,
        },
    }
}
