/*!
  The control-plane provider reads and writes managed node group scaling configuration and reports
  the health of the EC2 instances backing a cluster's nodes.

  `EksControlPlane` talks to the EKS and EC2 APIs. `SimulatedControlPlane` answers with fixed data
  for dry runs.
!*/

use models::capacity::{ClusterIdentity, NodeGroupCapacity};

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::profile::ProfileFileCredentialsProvider;
use aws_sdk_ec2::model::{InstanceStateName, SummaryStatus};
use aws_sdk_eks::model::NodegroupScalingConfig;
use aws_sdk_eks::types::SdkError;
use aws_sdk_eks::Region;
use snafu::{OptionExt, ResultExt};
use std::sync::Arc;
use tokio::time::Duration;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{event, instrument, Level};

#[cfg(any(feature = "mockall", test))]
use mockall::{mock, predicate::*};

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, provider_error::Error>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const CLUSTER_STATUS_ACTIVE: &str = "ACTIVE";

// EC2 accepts at most this many instance ids per DescribeInstanceStatus call.
const DESCRIBE_INSTANCE_BATCH: usize = 100;

// Scaling updates are rejected while a previous update is still in progress, so retry them.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(20);
const NUM_RETRIES: usize = 5;

const SIMULATED_NODEGROUP: &str = "simulated-nodegroup";

/// Health of one EC2 instance as reported by DescribeInstanceStatus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceHealth {
    pub instance_id: String,
    pub running: bool,
    pub system_status_ok: bool,
    pub instance_status_ok: bool,
}

#[async_trait]
/// A trait providing an interface to the cluster control plane. This is provided as a trait
/// in order to allow mocks to be used for testing purposes.
pub trait ControlPlaneApi: Send + Sync {
    /// The lifecycle status of the cluster, e.g. `ACTIVE`.
    async fn cluster_status(&self, cluster: &ClusterIdentity) -> Result<String>;
    async fn list_clusters(&self) -> Result<Vec<String>>;
    async fn list_nodegroups(&self, cluster: &ClusterIdentity) -> Result<Vec<String>>;
    async fn describe_capacity(
        &self,
        cluster: &ClusterIdentity,
        node_group: &str,
    ) -> Result<NodeGroupCapacity>;
    async fn update_capacity(
        &self,
        cluster: &ClusterIdentity,
        node_group: &str,
        capacity: NodeGroupCapacity,
    ) -> Result<()>;
    async fn instance_health(&self, instance_ids: &[String]) -> Result<Vec<InstanceHealth>>;
}

#[cfg(any(feature = "mockall", test))]
mock! {
    /// A Mock ControlPlaneApi for use in tests.
    pub ControlPlaneApi {}
    #[async_trait]
    impl ControlPlaneApi for ControlPlaneApi {
        async fn cluster_status(&self, cluster: &ClusterIdentity) -> Result<String>;
        async fn list_clusters(&self) -> Result<Vec<String>>;
        async fn list_nodegroups(&self, cluster: &ClusterIdentity) -> Result<Vec<String>>;
        async fn describe_capacity(
            &self,
            cluster: &ClusterIdentity,
            node_group: &str,
        ) -> Result<NodeGroupCapacity>;
        async fn update_capacity(
            &self,
            cluster: &ClusterIdentity,
            node_group: &str,
            capacity: NodeGroupCapacity,
        ) -> Result<()>;
        async fn instance_health(&self, instance_ids: &[String]) -> Result<Vec<InstanceHealth>>;
    }
}

#[async_trait]
impl<T> ControlPlaneApi for Arc<T>
where
    T: ControlPlaneApi + ?Sized,
{
    async fn cluster_status(&self, cluster: &ClusterIdentity) -> Result<String> {
        (**self).cluster_status(cluster).await
    }

    async fn list_clusters(&self) -> Result<Vec<String>> {
        (**self).list_clusters().await
    }

    async fn list_nodegroups(&self, cluster: &ClusterIdentity) -> Result<Vec<String>> {
        (**self).list_nodegroups(cluster).await
    }

    async fn describe_capacity(
        &self,
        cluster: &ClusterIdentity,
        node_group: &str,
    ) -> Result<NodeGroupCapacity> {
        (**self).describe_capacity(cluster, node_group).await
    }

    async fn update_capacity(
        &self,
        cluster: &ClusterIdentity,
        node_group: &str,
        capacity: NodeGroupCapacity,
    ) -> Result<()> {
        (**self).update_capacity(cluster, node_group, capacity).await
    }

    async fn instance_health(&self, instance_ids: &[String]) -> Result<Vec<InstanceHealth>> {
        (**self).instance_health(instance_ids).await
    }
}

/// Wrapper struct to provide retry configurations for scaling updates.
struct RetryStrategy {}
impl RetryStrategy {
    fn retry_strategy() -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .map(jitter)
            .take(NUM_RETRIES)
    }
}

impl tokio_retry::Condition<provider_error::Error> for RetryStrategy {
    fn should_retry(&mut self, error: &provider_error::Error) -> bool {
        error.is_retriable()
    }
}

#[derive(Clone, Debug)]
/// Concrete implementation of the `ControlPlaneApi` trait backed by the EKS and EC2 APIs.
pub struct EksControlPlane {
    eks_client: aws_sdk_eks::Client,
    ec2_client: aws_sdk_ec2::Client,
}

impl EksControlPlane {
    /// Builds clients for `region`, using the named AWS profile's credentials when one is given.
    pub async fn new(region: &str, profile: Option<String>) -> Self {
        let region_provider = RegionProviderChain::first_try(Some(Region::new(region.to_string())));
        let loader = aws_config::from_env().region(region_provider);
        let loader = match profile {
            Some(profile) => loader.credentials_provider(
                ProfileFileCredentialsProvider::builder()
                    .profile_name(profile)
                    .build(),
            ),
            None => loader,
        };
        let shared_config = loader.load().await;

        EksControlPlane {
            eks_client: aws_sdk_eks::Client::new(&shared_config),
            ec2_client: aws_sdk_ec2::Client::new(&shared_config),
        }
    }

    async fn try_update_capacity(
        &self,
        cluster: &ClusterIdentity,
        node_group: &str,
        capacity: NodeGroupCapacity,
    ) -> Result<()> {
        self.eks_client
            .update_nodegroup_config()
            .cluster_name(cluster.as_str())
            .nodegroup_name(node_group)
            .scaling_config(
                NodegroupScalingConfig::builder()
                    .min_size(capacity.min)
                    .max_size(capacity.max)
                    .desired_size(capacity.desired)
                    .build(),
            )
            .send()
            .await
            .map_err(|err| {
                let retriable = match &err {
                    SdkError::ServiceError(service_err) => {
                        let kind = service_err.err();
                        kind.is_resource_in_use_exception() || kind.is_server_exception()
                    }
                    SdkError::ConstructionFailure(_) => false,
                    _ => true,
                };
                provider_error::Error::UpdateNodegroup {
                    cluster: cluster.to_string(),
                    node_group: node_group.to_string(),
                    retriable,
                    source: Box::new(err),
                }
            })?;
        Ok(())
    }
}

#[async_trait]
impl ControlPlaneApi for EksControlPlane {
    #[instrument(skip(self), err)]
    async fn cluster_status(&self, cluster: &ClusterIdentity) -> Result<String> {
        let output = self
            .eks_client
            .describe_cluster()
            .name(cluster.as_str())
            .send()
            .await
            .map_err(|err| Box::new(err) as BoxError)
            .context(provider_error::DescribeClusterSnafu {
                cluster: cluster.to_string(),
            })?;

        let status = output
            .cluster()
            .and_then(|cluster| cluster.status())
            .context(provider_error::MissingClusterStatusSnafu {
                cluster: cluster.to_string(),
            })?;
        Ok(status.as_str().to_string())
    }

    #[instrument(skip(self), err)]
    async fn list_clusters(&self) -> Result<Vec<String>> {
        let mut clusters = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .eks_client
                .list_clusters()
                .set_next_token(next_token.clone())
                .send()
                .await
                .map_err(|err| Box::new(err) as BoxError)
                .context(provider_error::ListClustersSnafu)?;
            clusters.extend(output.clusters().unwrap_or_default().iter().cloned());
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                return Ok(clusters);
            }
        }
    }

    #[instrument(skip(self), err)]
    async fn list_nodegroups(&self, cluster: &ClusterIdentity) -> Result<Vec<String>> {
        let mut node_groups = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .eks_client
                .list_nodegroups()
                .cluster_name(cluster.as_str())
                .set_next_token(next_token.clone())
                .send()
                .await
                .map_err(|err| Box::new(err) as BoxError)
                .context(provider_error::ListNodegroupsSnafu {
                    cluster: cluster.to_string(),
                })?;
            node_groups.extend(output.nodegroups().unwrap_or_default().iter().cloned());
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                return Ok(node_groups);
            }
        }
    }

    #[instrument(skip(self), err)]
    async fn describe_capacity(
        &self,
        cluster: &ClusterIdentity,
        node_group: &str,
    ) -> Result<NodeGroupCapacity> {
        let output = self
            .eks_client
            .describe_nodegroup()
            .cluster_name(cluster.as_str())
            .nodegroup_name(node_group)
            .send()
            .await
            .map_err(|err| Box::new(err) as BoxError)
            .context(provider_error::DescribeNodegroupSnafu {
                cluster: cluster.to_string(),
                node_group: node_group.to_string(),
            })?;

        let scaling = output
            .nodegroup()
            .and_then(|node_group| node_group.scaling_config())
            .context(provider_error::MissingScalingConfigSnafu {
                cluster: cluster.to_string(),
                node_group: node_group.to_string(),
            })?;

        Ok(NodeGroupCapacity::new(
            scaling.min_size().unwrap_or_default(),
            scaling.max_size().unwrap_or_default(),
            scaling.desired_size().unwrap_or_default(),
        ))
    }

    #[instrument(skip(self), err)]
    async fn update_capacity(
        &self,
        cluster: &ClusterIdentity,
        node_group: &str,
        capacity: NodeGroupCapacity,
    ) -> Result<()> {
        RetryIf::start(
            RetryStrategy::retry_strategy(),
            || async {
                let attempt = self
                    .try_update_capacity(cluster, node_group, capacity)
                    .await;
                if let Err(err) = attempt.as_ref() {
                    event!(Level::WARN, error = %err, "Node group update attempt failed.");
                }
                attempt
            },
            RetryStrategy {},
        )
        .await?;
        event!(Level::INFO, %capacity, "Requested node group scaling update.");
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn instance_health(&self, instance_ids: &[String]) -> Result<Vec<InstanceHealth>> {
        let mut health = Vec::new();
        for batch in instance_ids.chunks(DESCRIBE_INSTANCE_BATCH) {
            let output = self
                .ec2_client
                .describe_instance_status()
                .set_instance_ids(Some(batch.to_vec()))
                .include_all_instances(true)
                .send()
                .await
                .map_err(|err| Box::new(err) as BoxError)
                .context(provider_error::DescribeInstancesSnafu)?;

            for status in output.instance_statuses().unwrap_or_default() {
                let instance_id = match status.instance_id() {
                    Some(instance_id) => instance_id.to_string(),
                    None => continue,
                };
                health.push(InstanceHealth {
                    instance_id,
                    running: status.instance_state().and_then(|state| state.name())
                        == Some(&InstanceStateName::Running),
                    system_status_ok: status
                        .system_status()
                        .and_then(|summary| summary.status())
                        == Some(&SummaryStatus::Ok),
                    instance_status_ok: status
                        .instance_status()
                        .and_then(|summary| summary.status())
                        == Some(&SummaryStatus::Ok),
                });
            }
        }
        Ok(health)
    }
}

#[derive(Clone, Debug, Default)]
/// A `ControlPlaneApi` for dry runs: the cluster is always `ACTIVE` with one node group, and
/// updates are logged instead of sent.
pub struct SimulatedControlPlane {}

#[async_trait]
impl ControlPlaneApi for SimulatedControlPlane {
    async fn cluster_status(&self, cluster: &ClusterIdentity) -> Result<String> {
        event!(Level::INFO, %cluster, "[dry-run] describe cluster");
        Ok(CLUSTER_STATUS_ACTIVE.to_string())
    }

    async fn list_clusters(&self) -> Result<Vec<String>> {
        event!(
            Level::WARN,
            "[dry-run] No clusters to discover, name them explicitly."
        );
        Ok(Vec::new())
    }

    async fn list_nodegroups(&self, _cluster: &ClusterIdentity) -> Result<Vec<String>> {
        Ok(vec![SIMULATED_NODEGROUP.to_string()])
    }

    async fn describe_capacity(
        &self,
        _cluster: &ClusterIdentity,
        _node_group: &str,
    ) -> Result<NodeGroupCapacity> {
        Ok(NodeGroupCapacity::new(1, 3, 2))
    }

    async fn update_capacity(
        &self,
        cluster: &ClusterIdentity,
        node_group: &str,
        capacity: NodeGroupCapacity,
    ) -> Result<()> {
        event!(Level::INFO, %cluster, node_group, %capacity, "[dry-run] update node group scaling");
        Ok(())
    }

    async fn instance_health(&self, instance_ids: &[String]) -> Result<Vec<InstanceHealth>> {
        Ok(instance_ids
            .iter()
            .map(|instance_id| InstanceHealth {
                instance_id: instance_id.clone(),
                running: true,
                system_status_ok: true,
                instance_status_ok: true,
            })
            .collect())
    }
}

pub mod provider_error {
    use super::BoxError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to describe cluster '{}': {}", cluster, source))]
        DescribeCluster { cluster: String, source: BoxError },

        #[snafu(display("Cluster '{}' reported no status", cluster))]
        MissingClusterStatus { cluster: String },

        #[snafu(display("Unable to list clusters: {}", source))]
        ListClusters { source: BoxError },

        #[snafu(display("Unable to list node groups of cluster '{}': {}", cluster, source))]
        ListNodegroups { cluster: String, source: BoxError },

        #[snafu(display(
            "Unable to describe node group '{}' of cluster '{}': {}",
            node_group,
            cluster,
            source
        ))]
        DescribeNodegroup {
            cluster: String,
            node_group: String,
            source: BoxError,
        },

        #[snafu(display(
            "Node group '{}' of cluster '{}' has no scaling configuration",
            node_group,
            cluster
        ))]
        MissingScalingConfig { cluster: String, node_group: String },

        #[snafu(display(
            "Unable to update node group '{}' of cluster '{}': {}",
            node_group,
            cluster,
            source
        ))]
        UpdateNodegroup {
            cluster: String,
            node_group: String,
            retriable: bool,
            source: BoxError,
        },

        #[snafu(display("Unable to describe instance status: {}", source))]
        DescribeInstances { source: BoxError },
    }

    impl Error {
        pub fn is_retriable(&self) -> bool {
            matches!(self, Error::UpdateNodegroup { retriable: true, .. })
        }
    }
}
