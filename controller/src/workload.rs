//! Readiness of system workloads (deployments and daemonsets), shared by bootstrap validation and
//! dependency tier checks.
use models::command::{args, ClusterCommandRunner, CommandOutput};

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use serde::Serialize;
use snafu::ResultExt;
use std::fmt;
use tracing::{event, instrument, Level};

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, workload_error::Error>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    #[strum(serialize = "deployment")]
    Deployment,
    #[strum(serialize = "daemonset")]
    DaemonSet,
}

/// A system service whose health gates progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    pub name: String,
    pub namespace: String,
    pub kind: WorkloadKind,
    pub min_replicas: i32,
    /// A critical service that never becomes ready fails the whole check.
    pub critical: bool,
}

impl ServiceSpec {
    pub fn deployment(name: &str, namespace: &str, min_replicas: i32, critical: bool) -> Self {
        ServiceSpec {
            name: name.to_string(),
            namespace: namespace.to_string(),
            kind: WorkloadKind::Deployment,
            min_replicas,
            critical,
        }
    }

    pub fn daemonset(name: &str, namespace: &str, critical: bool) -> Self {
        ServiceSpec {
            name: name.to_string(),
            namespace: namespace.to_string(),
            kind: WorkloadKind::DaemonSet,
            min_replicas: 1,
            critical,
        }
    }
}

impl fmt::Display for ServiceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady { ready: i32, wanted: i32 },
    Missing,
}

impl Readiness {
    /// Whether this readiness lets a service with the given criticality pass. An absent workload
    /// is only acceptable when it is optional.
    pub fn passes(&self, critical: bool) -> bool {
        match self {
            Readiness::Ready => true,
            Readiness::Missing => !critical,
            Readiness::NotReady { .. } => false,
        }
    }
}

/// Reads live workload status through a command runner.
#[derive(Clone)]
pub struct WorkloadInspector<R: ClusterCommandRunner> {
    runner: R,
}

impl<R: ClusterCommandRunner> WorkloadInspector<R> {
    pub fn new(runner: R) -> Self {
        WorkloadInspector { runner }
    }

    async fn get(&self, kind: WorkloadKind, name: &str, namespace: &str) -> Result<CommandOutput> {
        let kind = kind.to_string();
        let get_args = args([
            "get",
            kind.as_str(),
            name,
            "-n",
            namespace,
            "-o",
            "json",
        ]);
        self.runner
            .kubectl(&get_args)
            .await
            .context(workload_error::CommandSnafu)
    }

    /// Fetches a deployment, or `None` if it does not exist.
    pub async fn deployment(&self, name: &str, namespace: &str) -> Result<Option<Deployment>> {
        let output = self.get(WorkloadKind::Deployment, name, namespace).await?;
        if output.is_not_found() {
            return Ok(None);
        }
        let get_args = args(["get", "deployment", name]);
        let output = output
            .ensure_success(&get_args)
            .context(workload_error::CommandSnafu)?;
        parse_workload(&output)
    }

    async fn daemonset(&self, name: &str, namespace: &str) -> Result<Option<DaemonSet>> {
        let output = self.get(WorkloadKind::DaemonSet, name, namespace).await?;
        if output.is_not_found() {
            return Ok(None);
        }
        let get_args = args(["get", "daemonset", name]);
        let output = output
            .ensure_success(&get_args)
            .context(workload_error::CommandSnafu)?;
        parse_workload(&output)
    }

    #[instrument(skip(self, service), fields(service = %service), err)]
    pub async fn readiness(&self, service: &ServiceSpec) -> Result<Readiness> {
        let min_replicas = service.min_replicas;
        let readiness = match service.kind {
            WorkloadKind::Deployment => self
                .deployment(&service.name, &service.namespace)
                .await?
                .map(|deployment| deployment_readiness(&deployment, min_replicas))
                .unwrap_or(Readiness::Missing),
            WorkloadKind::DaemonSet => self
                .daemonset(&service.name, &service.namespace)
                .await?
                .map(|daemonset| daemonset_readiness(&daemonset, min_replicas))
                .unwrap_or(Readiness::Missing),
        };
        event!(Level::DEBUG, ?readiness, "Checked workload readiness.");
        Ok(readiness)
    }

    /// Whether the service currently passes. Command failures count as not ready.
    pub async fn is_ready(&self, service: &ServiceSpec) -> bool {
        match self.readiness(service).await {
            Ok(readiness) => readiness.passes(service.critical),
            Err(err) => {
                event!(
                    Level::WARN,
                    %service,
                    error = %err,
                    "Unable to determine workload readiness."
                );
                false
            }
        }
    }
}

fn parse_workload<T: serde::de::DeserializeOwned>(output: &CommandOutput) -> Result<Option<T>> {
    // Simulated runs answer every get with an empty list rather than the object itself.
    let value: serde_json::Value = output.json().context(workload_error::CommandSnafu)?;
    if value.get("kind").and_then(|kind| kind.as_str()) == Some("List") {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .context(workload_error::ParseWorkloadSnafu)
}

pub(crate) fn deployment_readiness(deployment: &Deployment, min_replicas: i32) -> Readiness {
    let ready = deployment
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);
    if ready >= min_replicas {
        Readiness::Ready
    } else {
        Readiness::NotReady {
            ready,
            wanted: min_replicas,
        }
    }
}

fn daemonset_readiness(daemonset: &DaemonSet, min_replicas: i32) -> Readiness {
    let status = daemonset.status.as_ref();
    let ready = status.map_or(0, |status| status.number_ready);
    let scheduled = status.map_or(0, |status| status.desired_number_scheduled);
    let wanted = std::cmp::max(scheduled, min_replicas);
    if ready >= wanted {
        Readiness::Ready
    } else {
        Readiness::NotReady { ready, wanted }
    }
}

pub mod workload_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to query workload: {}", source))]
        Command {
            source: models::command::command_error::Error,
        },

        #[snafu(display("Unable to parse workload: {}", source))]
        ParseWorkload { source: serde_json::Error },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::{FakeCluster, FakeDeployment};

    fn not_ready(ready: i32, wanted: i32) -> Readiness {
        Readiness::NotReady { ready, wanted }
    }

    #[test]
    fn test_missing_passes_only_when_optional() {
        assert!(Readiness::Missing.passes(false));
        assert!(!Readiness::Missing.passes(true));
        assert!(Readiness::Ready.passes(true));
        assert!(!not_ready(0, 1).passes(false));
    }

    #[tokio::test]
    async fn test_readiness_from_live_objects() {
        let cluster = FakeCluster::new();
        cluster.add_deployment(FakeDeployment::new("kube-system", "coredns", 2, 2));
        cluster.add_deployment(FakeDeployment::new("kube-system", "metrics-server", 1, 0));
        cluster.add_daemonset("kube-system", "aws-node", 3, 3);
        cluster.add_daemonset("kube-system", "kube-proxy", 3, 1);
        let inspector = WorkloadInspector::new(cluster.clone());

        let test_cases = vec![
            (
                ServiceSpec::deployment("coredns", "kube-system", 1, true),
                Readiness::Ready,
            ),
            (
                ServiceSpec::deployment("metrics-server", "kube-system", 1, false),
                not_ready(0, 1),
            ),
            (
                ServiceSpec::deployment("absent", "kube-system", 1, false),
                Readiness::Missing,
            ),
            (
                ServiceSpec::daemonset("aws-node", "kube-system", true),
                Readiness::Ready,
            ),
            (
                ServiceSpec::daemonset("kube-proxy", "kube-system", true),
                not_ready(1, 3),
            ),
        ];

        for (service, expected) in test_cases {
            assert_eq!(inspector.readiness(&service).await.unwrap(), expected);
        }
    }
}
