//! Ordered validation of system services after capacity comes back.
//!
//! Services are grouped into tiers that are checked in order; a tier is only looked at once every
//! earlier tier has settled. When a tier runs out of time, its stragglers decide the outcome: any
//! critical service still unready halts the walk, while non-critical stragglers are noted and the
//! walk moves on.
use crate::error::{self, CriticalPathError};
use crate::workload::{ServiceSpec, WorkloadInspector};
use models::command::ClusterCommandRunner;
use models::constants::KUBE_SYSTEM_NAMESPACE;
use models::poll::{poll_until, PollOutcome};

use serde::Serialize;
use std::convert::Infallible;
use tokio::time::Duration;
use tracing::{event, instrument, Level};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceTier {
    pub name: String,
    pub description: String,
    pub services: Vec<ServiceSpec>,
}

impl ServiceTier {
    pub fn new(name: &str, description: &str, services: Vec<ServiceSpec>) -> Self {
        ServiceTier {
            name: name.to_string(),
            description: description.to_string(),
            services,
        }
    }
}

/// The standard tier table for an EKS cluster.
pub fn default_tiers() -> Vec<ServiceTier> {
    vec![
        ServiceTier::new(
            "core",
            "Cluster DNS and node networking",
            vec![
                ServiceSpec::deployment("coredns", KUBE_SYSTEM_NAMESPACE, 1, true),
                ServiceSpec::daemonset("aws-node", KUBE_SYSTEM_NAMESPACE, true),
                ServiceSpec::daemonset("kube-proxy", KUBE_SYSTEM_NAMESPACE, true),
            ],
        ),
        ServiceTier::new(
            "storage-network",
            "Block storage drivers and load balancer provisioning",
            vec![
                ServiceSpec::deployment("ebs-csi-controller", KUBE_SYSTEM_NAMESPACE, 1, false),
                ServiceSpec::daemonset("ebs-csi-node", KUBE_SYSTEM_NAMESPACE, false),
                ServiceSpec::deployment(
                    "aws-load-balancer-controller",
                    KUBE_SYSTEM_NAMESPACE,
                    1,
                    false,
                ),
            ],
        ),
        ServiceTier::new(
            "autoscaling-metrics",
            "Resource metrics and node provisioning",
            vec![
                ServiceSpec::deployment("metrics-server", KUBE_SYSTEM_NAMESPACE, 1, false),
                ServiceSpec::deployment("karpenter", "karpenter", 1, false),
            ],
        ),
        ServiceTier::new(
            "admission-control",
            "Policy engines backing admission webhooks",
            vec![
                ServiceSpec::deployment(
                    "gatekeeper-controller-manager",
                    "gatekeeper-system",
                    1,
                    false,
                ),
                ServiceSpec::deployment("kyverno-admission-controller", "kyverno", 1, false),
            ],
        ),
        ServiceTier::new(
            "observability",
            "Log and metric shipping",
            vec![
                ServiceSpec::daemonset("cloudwatch-agent", "amazon-cloudwatch", false),
                ServiceSpec::daemonset("fluent-bit", "amazon-cloudwatch", false),
            ],
        ),
        ServiceTier::new(
            "external-dns",
            "DNS record management",
            vec![ServiceSpec::deployment("external-dns", KUBE_SYSTEM_NAMESPACE, 1, false)],
        ),
        ServiceTier::new(
            "snapshot-management",
            "Volume snapshot controller",
            vec![ServiceSpec::deployment("snapshot-controller", KUBE_SYSTEM_NAMESPACE, 1, false)],
        ),
    ]
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TierOutcome {
    Ready,
    /// Timed out with only non-critical services unready.
    SoftPass {
        stragglers: Vec<String>,
        elapsed_secs: u64,
    },
    HardFailure {
        critical: Vec<String>,
        stragglers: Vec<String>,
        elapsed_secs: u64,
    },
}

impl TierOutcome {
    pub fn is_soft_pass(&self) -> bool {
        matches!(self, TierOutcome::SoftPass { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TierReport {
    pub tier: String,
    pub outcome: TierOutcome,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    pub tiers: Vec<TierReport>,
}

impl DependencyReport {
    /// Names of tiers that passed with stragglers.
    pub fn soft_failures(&self) -> Vec<&str> {
        self.tiers
            .iter()
            .filter(|report| report.outcome.is_soft_pass())
            .map(|report| report.tier.as_str())
            .collect()
    }
}

#[derive(Clone)]
pub struct DependencyGraph<R: ClusterCommandRunner> {
    inspector: WorkloadInspector<R>,
    tiers: Vec<ServiceTier>,
    poll_interval: Duration,
}

impl<R: ClusterCommandRunner> DependencyGraph<R> {
    pub fn new(runner: R, tiers: Vec<ServiceTier>, poll_interval: Duration) -> Self {
        DependencyGraph {
            inspector: WorkloadInspector::new(runner),
            tiers,
            poll_interval,
        }
    }

    pub fn tiers(&self) -> &[ServiceTier] {
        &self.tiers
    }

    async fn unready<'a>(&self, tier: &'a ServiceTier) -> Vec<&'a ServiceSpec> {
        let mut unready = Vec::new();
        for service in &tier.services {
            if !self.inspector.is_ready(service).await {
                unready.push(service);
            }
        }
        unready
    }

    #[instrument(skip(self, tier), fields(tier = %tier.name))]
    pub async fn wait_tier_ready(&self, tier: &ServiceTier, timeout: Duration) -> TierOutcome {
        let outcome = poll_until(&tier.name, self.poll_interval, timeout, move || async move {
            let ready = self.unready(tier).await.is_empty();
            Ok::<_, Infallible>(if ready { Some(()) } else { None })
        })
        .await;

        let elapsed = match outcome {
            PollOutcome::Ready(()) => {
                event!(Level::INFO, "Tier is ready.");
                return TierOutcome::Ready;
            }
            PollOutcome::Timeout { elapsed } => elapsed,
            PollOutcome::Error(never) => match never {},
        };

        // Look again so the classification reflects the state at the deadline.
        let (critical, stragglers): (Vec<&ServiceSpec>, Vec<&ServiceSpec>) = self
            .unready(tier)
            .await
            .into_iter()
            .partition(|service| service.critical);
        let critical: Vec<String> = critical.iter().map(ToString::to_string).collect();
        let stragglers: Vec<String> = stragglers.iter().map(ToString::to_string).collect();

        if critical.is_empty() {
            event!(Level::WARN, ?stragglers, "Tier timed out on non-critical services.");
            TierOutcome::SoftPass {
                stragglers,
                elapsed_secs: elapsed.as_secs(),
            }
        } else {
            event!(Level::ERROR, ?critical, "Tier timed out on critical services.");
            TierOutcome::HardFailure {
                critical,
                stragglers,
                elapsed_secs: elapsed.as_secs(),
            }
        }
    }

    /// Walks the tiers in order, each with its own timeout. Stops at the first hard failure.
    #[instrument(skip(self), err)]
    pub async fn validate_all(
        &self,
        timeout_per_tier: Duration,
    ) -> std::result::Result<DependencyReport, CriticalPathError> {
        let mut report = DependencyReport::default();
        for tier in &self.tiers {
            event!(
                Level::INFO,
                tier = %tier.name,
                description = %tier.description,
                "Validating tier."
            );
            let outcome = self.wait_tier_ready(tier, timeout_per_tier).await;
            if let TierOutcome::HardFailure {
                critical,
                elapsed_secs,
                ..
            } = &outcome
            {
                return error::CriticalTierSnafu {
                    tier: tier.name.clone(),
                    services: critical.clone(),
                    elapsed: Duration::from_secs(*elapsed_secs),
                }
                .fail();
            }
            report.tiers.push(TierReport {
                tier: tier.name.clone(),
                outcome,
            });
        }

        let soft_failures = report.soft_failures();
        if !soft_failures.is_empty() {
            event!(Level::WARN, ?soft_failures, "Some tiers passed with unready services.");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::{FakeCluster, FakeDeployment};

    fn scenario_tiers() -> Vec<ServiceTier> {
        vec![
            ServiceTier::new(
                "core",
                "dns",
                vec![ServiceSpec::deployment("coredns", "kube-system", 1, true)],
            ),
            ServiceTier::new(
                "admission-control",
                "policy",
                vec![
                    ServiceSpec::deployment("policy-controller", "policy", 1, true),
                    ServiceSpec::deployment("audit", "policy", 1, false),
                ],
            ),
            ServiceTier::new(
                "observability",
                "logs",
                vec![ServiceSpec::deployment("log-shipper", "logging", 1, false)],
            ),
        ]
    }

    fn graph(cluster: &FakeCluster) -> DependencyGraph<FakeCluster> {
        DependencyGraph::new(cluster.clone(), scenario_tiers(), Duration::from_secs(15))
    }

    fn position(cluster: &FakeCluster, name: &str) -> Option<usize> {
        cluster
            .calls()
            .iter()
            .position(|call| call.len() > 2 && call[2] == name)
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_tier_halts_walk() {
        let cluster = FakeCluster::new();
        cluster.add_deployment(FakeDeployment::new("kube-system", "coredns", 2, 2));
        cluster.add_deployment(FakeDeployment::new("policy", "policy-controller", 1, 0));
        cluster.add_deployment(FakeDeployment::new("logging", "log-shipper", 1, 1));

        let graph = graph(&cluster);
        match graph.validate_all(Duration::from_secs(300)).await {
            Err(CriticalPathError::CriticalTier {
                tier,
                services,
                elapsed,
            }) => {
                assert_eq!(tier, "admission-control");
                assert_eq!(
                    services,
                    vec!["deployment/policy/policy-controller".to_string()]
                );
                assert!(elapsed >= Duration::from_secs(300));
            }
            other => panic!("unexpected result {:?}", other),
        }

        let coredns = position(&cluster, "coredns").unwrap();
        assert!(coredns < position(&cluster, "policy-controller").unwrap());
        assert_eq!(position(&cluster, "log-shipper"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_critical_stragglers_soft_pass() {
        let cluster = FakeCluster::new();
        cluster.add_deployment(FakeDeployment::new("kube-system", "coredns", 2, 2));
        cluster.add_deployment(FakeDeployment::new("policy", "policy-controller", 1, 1));
        cluster.add_deployment(FakeDeployment::new("policy", "audit", 1, 0));

        let report = graph(&cluster)
            .validate_all(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(report.tiers.len(), 3);
        assert_eq!(report.tiers[0].outcome, TierOutcome::Ready);
        assert_eq!(
            report.tiers[1].outcome,
            TierOutcome::SoftPass {
                stragglers: vec!["deployment/policy/audit".to_string()],
                elapsed_secs: 60,
            }
        );
        // log-shipper is absent and optional
        assert_eq!(report.tiers[2].outcome, TierOutcome::Ready);
        assert_eq!(report.soft_failures(), vec!["admission-control"]);
        let policy = position(&cluster, "policy-controller").unwrap();
        assert!(policy < position(&cluster, "log-shipper").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_becomes_ready_while_polling() {
        let cluster = FakeCluster::new();
        cluster.add_deployment(FakeDeployment::new("kube-system", "coredns", 2, 0));
        let graph = graph(&cluster);

        let watcher = cluster.clone();
        let recovery = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(40)).await;
            watcher.add_deployment(FakeDeployment::new("kube-system", "coredns", 2, 2));
        });
        let outcome = graph
            .wait_tier_ready(&graph.tiers()[0], Duration::from_secs(300))
            .await;
        recovery.await.unwrap();
        assert_eq!(outcome, TierOutcome::Ready);
    }

    #[test]
    fn test_default_tier_order() {
        let tiers = default_tiers();
        let names: Vec<&str> = tiers.iter().map(|tier| tier.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "core",
                "storage-network",
                "autoscaling-metrics",
                "admission-control",
                "observability",
                "external-dns",
                "snapshot-management",
            ]
        );
    }
}
