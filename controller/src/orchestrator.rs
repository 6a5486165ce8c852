/*!
  The orchestrator sequences the lifecycle components into the two workflows of an idle window.

  Scale-down: open a session, suppress managed webhooks, disable the autoscaler, drain every node
  group, then store each group's capacity and take it to zero.

  Scale-up: open a session, check the node minimum, restore each group's capacity, wait for nodes,
  uncordon, walk the dependency tiers, restore the autoscaler, clear confirmed capacity records,
  and finally return webhooks to `Fail` and wait for them to become healthy.

  Only a failed session, and during scale-up a critical-path failure, stop a run. Every other
  failure is recorded as a warning on the per-group results and the run carries on. Scale-up is
  deliberately lenient: a failed node minimum check does not keep capacity from being restored.
!*/

use crate::autoscaler::{AutoscalerController, AutoscalerOutcome};
use crate::bootstrap::{bootstrap_error, default_catalog, BootstrapGate, BootstrapReport};
use crate::dependency::{default_tiers, DependencyGraph, DependencyReport, ServiceTier};
use crate::drain::{NodeDrainOutcome, PodDrainer};
use crate::provider::{ControlPlaneApi, CLUSTER_STATUS_ACTIVE};
use crate::verification::{VerificationLevel, VerificationResult, Verifier};
use crate::webhook::{PolicyChange, WebhookGate};
use crate::workload::ServiceSpec;
use models::capacity::{ClusterIdentity, NodeGroupCapacity};
use models::command::{args, ClusterCommandRunner};
use models::config::LifecycleConfig;
use models::poll::{poll_until, PollOutcome};
use models::result::{NodeGroupResult, StepOutcome};
use models::state::{AutoscalerRecord, CapacityRecord, StateStore};

use serde::Serialize;
use snafu::{ensure, ResultExt};
use tracing::{event, instrument, Level};

pub use crate::error::CriticalPathError;

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, orchestrator_error::Error>;

#[derive(Clone, Debug, Serialize)]
pub struct NodeGroupStatus {
    pub node_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_capacity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_capacity: Option<CapacityRecord>,
}

/// Stored records next to what the control plane reports right now.
#[derive(Clone, Debug, Serialize)]
pub struct ClusterStatus {
    pub cluster: ClusterIdentity,
    pub node_groups: Vec<NodeGroupStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscaler: Option<AutoscalerRecord>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ValidationReport {
    pub bootstrap: BootstrapReport,
    pub dependencies: DependencyReport,
}

fn policy_step(
    change: std::result::Result<PolicyChange, crate::webhook::webhook_error::Error>,
) -> StepOutcome {
    match change {
        Ok(change) if change.is_success() => StepOutcome::Succeeded,
        Ok(change) => StepOutcome::failed(format!("unable to update {}", change.failed.join(", "))),
        Err(err) => StepOutcome::failed(err),
    }
}

fn autoscaler_step(outcome: crate::autoscaler::Result<AutoscalerOutcome>) -> (bool, StepOutcome) {
    match outcome {
        Ok(AutoscalerOutcome::Skipped { reason }) => (false, StepOutcome::Skipped { reason }),
        Ok(AutoscalerOutcome::DryRun) => (true, StepOutcome::DryRun),
        Ok(_) => (true, StepOutcome::Succeeded),
        Err(err) => (false, StepOutcome::failed(err)),
    }
}

/// Logs a cluster-wide step and, when it degraded, adds a warning to every result.
fn note_step(results: &mut [NodeGroupResult], step: &str, outcome: &StepOutcome) {
    match outcome {
        StepOutcome::Failed { .. } | StepOutcome::TimedOut { .. } => {
            event!(Level::WARN, step, %outcome, "Step degraded, continuing.");
            for result in results.iter_mut() {
                result.push_warning(format!("{}: {}", step, outcome));
            }
        }
        _ => event!(Level::INFO, step, %outcome, "Step finished."),
    }
}

pub struct ClusterLifecycleOrchestrator<R, P>
where
    R: ClusterCommandRunner + Clone,
    P: ControlPlaneApi + Clone,
{
    config: LifecycleConfig,
    runner: R,
    provider: P,
    state: StateStore,
    webhooks: WebhookGate<R>,
    drainer: PodDrainer<R>,
    bootstrap: BootstrapGate<R>,
    dependencies: DependencyGraph<R>,
    autoscaler: AutoscalerController<R>,
}

impl<R, P> ClusterLifecycleOrchestrator<R, P>
where
    R: ClusterCommandRunner + Clone,
    P: ControlPlaneApi + Clone,
{
    pub fn new(config: LifecycleConfig, runner: R, provider: P) -> Self {
        let state = StateStore::new(config.state_dir.clone());
        let timeouts = config.timeouts;
        let intervals = config.intervals;
        ClusterLifecycleOrchestrator {
            webhooks: WebhookGate::new(
                runner.clone(),
                config.managed_webhooks.clone(),
                intervals.webhook_poll(),
            ),
            drainer: PodDrainer::new(
                runner.clone(),
                &config.nodegroup_label_key,
                timeouts.pod_grace_period,
                timeouts.drain(),
                intervals.termination_poll(),
            ),
            bootstrap: BootstrapGate::new(
                runner.clone(),
                default_catalog(),
                timeouts.bootstrap_validation(),
                intervals.bootstrap_poll(),
            ),
            dependencies: DependencyGraph::new(
                runner.clone(),
                default_tiers(),
                intervals.dependency_poll(),
            ),
            autoscaler: AutoscalerController::new(
                runner.clone(),
                state.clone(),
                &config.autoscaler_deployment,
            ),
            config,
            runner,
            provider,
            state,
        }
    }

    /// Replaces the bootstrap catalog and the dependency tiers.
    pub fn with_catalogs(mut self, catalog: Vec<ServiceSpec>, tiers: Vec<ServiceTier>) -> Self {
        let timeouts = self.config.timeouts;
        let intervals = self.config.intervals;
        self.bootstrap = BootstrapGate::new(
            self.runner.clone(),
            catalog,
            timeouts.bootstrap_validation(),
            intervals.bootstrap_poll(),
        );
        self.dependencies =
            DependencyGraph::new(self.runner.clone(), tiers, intervals.dependency_poll());
        self
    }

    fn dry_run(&self) -> bool {
        self.runner.is_simulated()
    }

    /// Confirms the cluster may be touched and points the runner at it.
    #[instrument(skip(self), err)]
    async fn open_session(&self, cluster: &ClusterIdentity) -> Result<()> {
        ensure!(
            !self.config.is_excluded(cluster),
            orchestrator_error::ExcludedSnafu {
                cluster: cluster.to_string(),
            }
        );
        let status = self
            .provider
            .cluster_status(cluster)
            .await
            .context(orchestrator_error::ClusterStatusSnafu {
                cluster: cluster.to_string(),
            })?;
        ensure!(
            status == CLUSTER_STATUS_ACTIVE,
            orchestrator_error::NotActiveSnafu {
                cluster: cluster.to_string(),
                status,
            }
        );
        self.runner
            .update_kubeconfig(
                cluster,
                &self.config.region,
                self.config.profile_for(cluster),
            )
            .await
            .and_then(|output| {
                output.ensure_success(&args(["update-kubeconfig", cluster.as_str()]))
            })
            .context(orchestrator_error::KubeconfigSnafu {
                cluster: cluster.to_string(),
            })?;
        Ok(())
    }

    async fn start(&self, cluster: &ClusterIdentity) -> Result<Vec<NodeGroupResult>> {
        self.open_session(cluster).await?;
        let node_groups = self
            .provider
            .list_nodegroups(cluster)
            .await
            .context(orchestrator_error::ListNodegroupsSnafu {
                cluster: cluster.to_string(),
            })?;
        event!(Level::INFO, ?node_groups, "Session established.");
        Ok(node_groups
            .iter()
            .map(|node_group| NodeGroupResult::new(node_group.as_str()))
            .collect())
    }

    #[instrument(skip(self, cluster), fields(cluster = %cluster))]
    pub async fn scale_down(&self, cluster: &ClusterIdentity) -> Vec<NodeGroupResult> {
        let mut results = match self.start(cluster).await {
            Ok(results) => results,
            Err(err) => {
                event!(Level::ERROR, error = %err, "Unable to start scale-down.");
                return vec![NodeGroupResult::synthetic_failure(err)];
            }
        };

        // Admission deadlocks are accepted rather than blocking the scale-down.
        let webhook_outcome = policy_step(self.webhooks.suppress().await);
        for result in results.iter_mut() {
            result.webhook_managed = webhook_outcome.is_success();
        }
        note_step(&mut results, "suppress webhooks", &webhook_outcome);

        let (autoscaler_managed, autoscaler_outcome) =
            autoscaler_step(self.autoscaler.disable(cluster).await);
        for result in results.iter_mut() {
            result.autoscaler_managed = autoscaler_managed;
        }
        note_step(&mut results, "disable autoscaler", &autoscaler_outcome);

        // Every group is drained before any capacity changes.
        for result in results.iter_mut() {
            match self.drainer.drain_group(&result.node_group).await {
                Ok(drain) if drain.all_succeeded() => result.pods_drained = true,
                Ok(drain) => {
                    let incomplete: Vec<&str> = drain
                        .nodes
                        .iter()
                        .filter(|node| node.outcome != NodeDrainOutcome::Drained)
                        .map(|node| node.node.as_str())
                        .collect();
                    result.push_warning(format!(
                        "partial drain, incomplete nodes: {}",
                        incomplete.join(", ")
                    ));
                }
                Err(err) => result.push_warning(format!("drain: {}", err)),
            }
        }

        for result in results.iter_mut() {
            if let Err(err) = self.zero_capacity(cluster, result).await {
                event!(
                    Level::ERROR,
                    node_group = %result.node_group,
                    error = %err,
                    "Unable to scale node group down."
                );
                result.push_error(err);
            }
        }
        results
    }

    async fn zero_capacity(
        &self,
        cluster: &ClusterIdentity,
        result: &mut NodeGroupResult,
    ) -> Result<()> {
        let node_group = result.node_group.clone();
        let current = self
            .provider
            .describe_capacity(cluster, &node_group)
            .await
            .context(orchestrator_error::CapacitySnafu {
                node_group: &node_group,
            })?;
        result.previous_capacity = current.to_string();

        // A repeated scale-down must not replace the stored original with zeros.
        let stored = self
            .state
            .get_capacity(cluster, &node_group)
            .context(orchestrator_error::StateSnafu)?;
        if current.is_scaled_to_zero() && stored.is_some() {
            event!(Level::INFO, node_group = %node_group, "Node group already scaled down.");
            result.set_current(&current);
            return Ok(());
        }

        if self.dry_run() {
            event!(
                Level::INFO,
                node_group = %node_group,
                %current,
                "[dry-run] Skipping capacity record."
            );
        } else {
            self.state
                .store_capacity(cluster, &node_group, current)
                .context(orchestrator_error::StateSnafu)?;
        }

        let target = current.scaled_to_zero();
        self.provider
            .update_capacity(cluster, &node_group, target)
            .await
            .context(orchestrator_error::CapacitySnafu {
                node_group: &node_group,
            })?;
        event!(Level::INFO, node_group = %node_group, %target, "Scaled node group down.");
        result.set_current(&target);
        Ok(())
    }

    #[instrument(skip(self, cluster), fields(cluster = %cluster))]
    pub async fn scale_up(
        &self,
        cluster: &ClusterIdentity,
        min_nodes: i32,
    ) -> Vec<NodeGroupResult> {
        let mut results = match self.start(cluster).await {
            Ok(results) => results,
            Err(err) => {
                event!(Level::ERROR, error = %err, "Unable to start scale-up.");
                return vec![NodeGroupResult::synthetic_failure(err)];
            }
        };
        let min_nodes = min_nodes.max(0);

        // Lenient by policy: refusing to restore capacity is worse than a degraded restore.
        let bootstrap_outcome = match self.bootstrap.validate_minimum(min_nodes as usize).await {
            Ok(_) => StepOutcome::Succeeded,
            Err(err) => StepOutcome::failed(err),
        };
        for result in results.iter_mut() {
            result.bootstrap_validated = bootstrap_outcome.is_success();
        }
        note_step(&mut results, "bootstrap minimum", &bootstrap_outcome);

        let mut required_nodes = 0;
        let mut restored = Vec::new();
        let mut confirmed = Vec::new();
        for result in results.iter_mut() {
            match self.restore_capacity(cluster, result, min_nodes).await {
                Ok((target, is_confirmed)) => {
                    required_nodes += target.desired.max(0) as usize;
                    restored.push(result.node_group.clone());
                    if is_confirmed {
                        confirmed.push(result.node_group.clone());
                    }
                }
                Err(err) => {
                    event!(
                        Level::ERROR,
                        node_group = %result.node_group,
                        error = %err,
                        "Unable to restore node group capacity."
                    );
                    result.push_error(err);
                }
            }
        }

        let nodes_outcome = self.wait_for_nodes(&restored, required_nodes).await;
        note_step(&mut results, "wait for nodes", &nodes_outcome);

        for result in results.iter_mut() {
            match self.drainer.uncordon_group(&result.node_group).await {
                Ok(true) => {}
                Ok(false) => result.push_warning("uncordon: some nodes remain cordoned"),
                Err(err) => result.push_warning(format!("uncordon: {}", err)),
            }
        }

        if self.dry_run() {
            event!(Level::INFO, "[dry-run] Skipping dependency validation.");
        } else {
            match self
                .dependencies
                .validate_all(self.config.timeouts.dependency_startup())
                .await
            {
                Ok(report) => {
                    let soft_failures = report.soft_failures();
                    if !soft_failures.is_empty() {
                        let warning = format!(
                            "dependency tiers passed with unready services: {}",
                            soft_failures.join(", ")
                        );
                        for result in results.iter_mut() {
                            result.push_warning(&warning);
                        }
                    }
                }
                Err(err) => {
                    // Completed steps stay in place; nothing is rolled back.
                    event!(
                        Level::ERROR,
                        error = %err,
                        "Critical dependency failure, aborting scale-up."
                    );
                    for result in results.iter_mut() {
                        result.push_error(&err);
                    }
                    return results;
                }
            }
        }
        for result in results.iter_mut() {
            result.dependencies_validated = true;
        }

        let (autoscaler_managed, autoscaler_outcome) =
            autoscaler_step(self.autoscaler.restore(cluster).await);
        for result in results.iter_mut() {
            result.autoscaler_managed = autoscaler_managed;
        }
        note_step(&mut results, "restore autoscaler", &autoscaler_outcome);

        if !self.dry_run() {
            for result in results
                .iter_mut()
                .filter(|result| confirmed.contains(&result.node_group))
            {
                if let Err(err) = self.state.delete_capacity(cluster, &result.node_group) {
                    result.push_warning(format!("unable to clear capacity record: {}", err));
                }
            }
        }

        let webhook_outcome = policy_step(self.webhooks.restore().await);
        for result in results.iter_mut() {
            result.webhook_managed = webhook_outcome.is_success();
        }
        note_step(&mut results, "restore webhooks", &webhook_outcome);

        let webhook_timeout = self.config.timeouts.webhook();
        let health_outcome = match self.webhooks.wait_healthy(webhook_timeout).await {
            PollOutcome::Ready(()) => StepOutcome::Succeeded,
            PollOutcome::Timeout { elapsed } => StepOutcome::timed_out(elapsed),
            PollOutcome::Error(err) => StepOutcome::failed(err),
        };
        note_step(&mut results, "webhook health", &health_outcome);

        results
    }

    /// Applies the restore target and reads it back. Returns the target and whether the control
    /// plane reports it.
    async fn restore_capacity(
        &self,
        cluster: &ClusterIdentity,
        result: &mut NodeGroupResult,
        min_nodes: i32,
    ) -> Result<(NodeGroupCapacity, bool)> {
        let node_group = result.node_group.clone();
        let current = self
            .provider
            .describe_capacity(cluster, &node_group)
            .await
            .context(orchestrator_error::CapacitySnafu {
                node_group: &node_group,
            })?;
        result.previous_capacity = current.to_string();

        let stored = self
            .state
            .get_capacity(cluster, &node_group)
            .context(orchestrator_error::StateSnafu)?;
        let target = NodeGroupCapacity::restore_target(stored.as_ref(), min_nodes);
        event!(
            Level::INFO,
            node_group = %node_group,
            %target,
            from_record = stored.is_some(),
            "Restoring node group capacity."
        );
        self.provider
            .update_capacity(cluster, &node_group, target)
            .await
            .context(orchestrator_error::CapacitySnafu {
                node_group: &node_group,
            })?;

        if self.dry_run() {
            result.set_current(&target);
            return Ok((target, true));
        }

        let observed = self
            .provider
            .describe_capacity(cluster, &node_group)
            .await
            .context(orchestrator_error::CapacitySnafu {
                node_group: &node_group,
            })?;
        result.set_current(&observed);
        let confirmed = observed == target;
        if !confirmed {
            result.push_warning(format!(
                "capacity update not reflected yet: wanted {}, found {}",
                target, observed
            ));
        }
        Ok((target, confirmed))
    }

    /// Waits until the restored groups, and only those, have `required` available nodes.
    async fn wait_for_nodes(&self, node_groups: &[String], required: usize) -> StepOutcome {
        if required == 0 {
            return StepOutcome::skipped("no nodes requested");
        }
        if self.dry_run() {
            return StepOutcome::DryRun;
        }
        let outcome = poll_until(
            "nodes ready",
            self.config.intervals.node_poll(),
            self.config.timeouts.node_ready(),
            move || async move {
                let available = self
                    .bootstrap
                    .group_nodes(&self.config.nodegroup_label_key, node_groups)
                    .await?
                    .iter()
                    .filter(|node| node.is_available())
                    .count();
                event!(Level::DEBUG, available, required, "Waiting for nodes.");
                Ok::<_, bootstrap_error::Error>(if available >= required {
                    Some(available)
                } else {
                    None
                })
            },
        )
        .await;
        match outcome {
            PollOutcome::Ready(_) => StepOutcome::Succeeded,
            PollOutcome::Timeout { elapsed } => StepOutcome::timed_out(elapsed),
            PollOutcome::Error(err) => StepOutcome::failed(err),
        }
    }

    /// Runs the full bootstrap gate and the dependency walk without changing anything.
    #[instrument(skip(self), err)]
    pub async fn validate(
        &self,
        cluster: &ClusterIdentity,
        min_nodes: usize,
    ) -> Result<ValidationReport> {
        self.open_session(cluster).await?;
        let bootstrap = self
            .bootstrap
            .validate_all(cluster, min_nodes)
            .await
            .context(orchestrator_error::CriticalSnafu)?;
        let dependencies = self
            .dependencies
            .validate_all(self.config.timeouts.dependency_startup())
            .await
            .context(orchestrator_error::CriticalSnafu)?;
        Ok(ValidationReport {
            bootstrap,
            dependencies,
        })
    }

    #[instrument(skip(self), err)]
    pub async fn verify(
        &self,
        cluster: &ClusterIdentity,
        level: VerificationLevel,
    ) -> Result<VerificationResult> {
        self.open_session(cluster).await?;
        Verifier::new(self.runner.clone(), self.provider.clone())
            .verify(level)
            .await
            .context(orchestrator_error::VerificationSnafu)
    }

    /// Stored records and live capacity per node group. Records for groups the control plane no
    /// longer lists are reported too.
    #[instrument(skip(self), err)]
    pub async fn status(&self, cluster: &ClusterIdentity) -> Result<ClusterStatus> {
        let node_groups = self
            .provider
            .list_nodegroups(cluster)
            .await
            .context(orchestrator_error::ListNodegroupsSnafu {
                cluster: cluster.to_string(),
            })?;
        let mut stored = self
            .state
            .get_all_capacities(cluster)
            .context(orchestrator_error::StateSnafu)?;

        let mut statuses = Vec::new();
        for node_group in node_groups {
            let live_capacity = match self.provider.describe_capacity(cluster, &node_group).await {
                Ok(capacity) => Some(capacity.to_string()),
                Err(err) => {
                    event!(
                        Level::WARN,
                        node_group = %node_group,
                        error = %err,
                        "Unable to describe node group."
                    );
                    None
                }
            };
            statuses.push(NodeGroupStatus {
                stored_capacity: stored.remove(&node_group),
                node_group,
                live_capacity,
            });
        }
        statuses.extend(stored.into_iter().map(|(node_group, record)| NodeGroupStatus {
            node_group,
            live_capacity: None,
            stored_capacity: Some(record),
        }));

        Ok(ClusterStatus {
            cluster: cluster.clone(),
            node_groups: statuses,
            autoscaler: self
                .state
                .get_autoscaler(cluster)
                .context(orchestrator_error::StateSnafu)?,
        })
    }
}

pub mod orchestrator_error {
    use super::CriticalPathError;
    use crate::provider::provider_error;
    use crate::verification::verification_error;
    use models::command::command_error;
    use models::state::state_error;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Cluster '{}' is excluded from lifecycle operations", cluster))]
        Excluded { cluster: String },

        #[snafu(display("Unable to describe cluster '{}': {}", cluster, source))]
        ClusterStatus {
            cluster: String,
            source: provider_error::Error,
        },

        #[snafu(display("Cluster '{}' is {}, not ACTIVE", cluster, status))]
        NotActive { cluster: String, status: String },

        #[snafu(display("Unable to write kubeconfig for cluster '{}': {}", cluster, source))]
        Kubeconfig {
            cluster: String,
            source: command_error::Error,
        },

        #[snafu(display("Unable to list node groups of cluster '{}': {}", cluster, source))]
        ListNodegroups {
            cluster: String,
            source: provider_error::Error,
        },

        #[snafu(display("Node group '{}': {}", node_group, source))]
        Capacity {
            node_group: String,
            source: provider_error::Error,
        },

        #[snafu(display("State store: {}", source))]
        State { source: state_error::Error },

        #[snafu(display("{}", source))]
        Critical { source: CriticalPathError },

        #[snafu(display("Unable to verify cluster: {}", source))]
        Verification { source: verification_error::Error },
    }
}
