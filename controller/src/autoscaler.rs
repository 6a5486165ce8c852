//! Turns the cluster autoscaler off for the idle window and back on afterwards, by way of its
//! replica count. The original count is written to the state store before the autoscaler is
//! scaled down, and only forgotten once the restored count has been read back from the cluster.
use crate::workload::{workload_error, WorkloadInspector};
use models::capacity::ClusterIdentity;
use models::command::{args, ClusterCommandRunner};
use models::constants::{DEFAULT_AUTOSCALER_DEPLOYMENT, KUBE_SYSTEM_NAMESPACE};
use models::state::{AutoscalerRef, StateStore};

use k8s_openapi::api::apps::v1::Deployment;
use serde::Serialize;
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{event, instrument, Level};

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, autoscaler_error::Error>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AutoscalerOutcome {
    Disabled {
        namespace: String,
        name: String,
        original_replicas: i32,
    },
    /// Already at zero replicas; nothing was stored or scaled.
    AlreadyDisabled { namespace: String, name: String },
    Restored {
        namespace: String,
        name: String,
        replicas: i32,
    },
    Skipped { reason: String },
    DryRun,
}

impl AutoscalerOutcome {
    /// Whether an autoscaler was found and acted upon (or is already in the wanted state).
    pub fn is_managed(&self) -> bool {
        !matches!(self, AutoscalerOutcome::Skipped { .. })
    }
}

fn replicas_of(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1)
}

#[derive(Clone)]
pub struct AutoscalerController<R: ClusterCommandRunner + Clone> {
    runner: R,
    inspector: WorkloadInspector<R>,
    state: StateStore,
    candidates: Vec<AutoscalerRef>,
}

impl<R: ClusterCommandRunner + Clone> AutoscalerController<R> {
    /// `deployment_name` is tried first in kube-system, followed by the names common installs use.
    pub fn new(runner: R, state: StateStore, deployment_name: &str) -> Self {
        let preferred = AutoscalerRef::new(KUBE_SYSTEM_NAMESPACE, deployment_name);
        let mut candidates = vec![preferred];
        for (namespace, name) in &[
            (KUBE_SYSTEM_NAMESPACE, DEFAULT_AUTOSCALER_DEPLOYMENT),
            (KUBE_SYSTEM_NAMESPACE, "cluster-autoscaler-aws-cluster-autoscaler"),
            ("cluster-autoscaler", DEFAULT_AUTOSCALER_DEPLOYMENT),
        ] {
            let candidate = AutoscalerRef::new(*namespace, *name);
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
        AutoscalerController {
            inspector: WorkloadInspector::new(runner.clone()),
            runner,
            state,
            candidates,
        }
    }

    /// The first conventional location that holds an autoscaler deployment, with its current
    /// replica count.
    #[instrument(skip(self), err)]
    pub async fn find(&self) -> Result<Option<(AutoscalerRef, i32)>> {
        for candidate in &self.candidates {
            if let Some(deployment) = self
                .inspector
                .deployment(&candidate.name, &candidate.namespace)
                .await
                .context(autoscaler_error::FindSnafu)?
            {
                let replicas = replicas_of(&deployment);
                event!(
                    Level::DEBUG,
                    namespace = %candidate.namespace,
                    name = %candidate.name,
                    replicas,
                    "Found autoscaler."
                );
                return Ok(Some((candidate.clone(), replicas)));
            }
        }
        Ok(None)
    }

    async fn scale(&self, autoscaler: &AutoscalerRef, replicas: i32) -> Result<()> {
        let replicas_arg = format!("--replicas={}", replicas);
        let scale_args = args([
            "scale",
            "deployment",
            autoscaler.name.as_str(),
            "-n",
            autoscaler.namespace.as_str(),
            replicas_arg.as_str(),
        ]);
        self.runner
            .kubectl(&scale_args)
            .await
            .and_then(|output| output.ensure_success(&scale_args))
            .context(autoscaler_error::ScaleSnafu)?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn disable(&self, cluster: &ClusterIdentity) -> Result<AutoscalerOutcome> {
        let (autoscaler, replicas) = match self.find().await? {
            Some(found) => found,
            None => {
                event!(Level::INFO, "No autoscaler deployment found.");
                return Ok(AutoscalerOutcome::Skipped {
                    reason: "no autoscaler deployment found".to_string(),
                });
            }
        };

        // A second scale-down must not overwrite the stored count with zero.
        if replicas == 0 {
            event!(Level::INFO, "Autoscaler already has 0 replicas.");
            return Ok(AutoscalerOutcome::AlreadyDisabled {
                namespace: autoscaler.namespace,
                name: autoscaler.name,
            });
        }

        if self.runner.is_simulated() {
            event!(
                Level::INFO,
                replicas,
                "[dry-run] Would store autoscaler state and scale to 0."
            );
            return Ok(AutoscalerOutcome::DryRun);
        }

        self.state
            .store_autoscaler(cluster, &autoscaler, replicas)
            .context(autoscaler_error::StateSnafu)?;
        self.scale(&autoscaler, 0).await?;
        event!(
            Level::INFO,
            original_replicas = replicas,
            "Disabled autoscaler."
        );
        Ok(AutoscalerOutcome::Disabled {
            namespace: autoscaler.namespace,
            name: autoscaler.name,
            original_replicas: replicas,
        })
    }

    /// Scales the autoscaler back to its stored count. The record is cleared only after the new
    /// count is observed, so a failed restore can simply be retried.
    #[instrument(skip(self), err)]
    pub async fn restore(&self, cluster: &ClusterIdentity) -> Result<AutoscalerOutcome> {
        let record = match self
            .state
            .get_autoscaler(cluster)
            .context(autoscaler_error::StateSnafu)?
        {
            Some(record) => record,
            None => {
                event!(Level::INFO, "No stored autoscaler state.");
                return Ok(AutoscalerOutcome::Skipped {
                    reason: "no stored autoscaler state".to_string(),
                });
            }
        };
        let autoscaler = record.autoscaler;

        if self.runner.is_simulated() {
            event!(
                Level::INFO,
                replicas = record.original_replicas,
                "[dry-run] Would restore autoscaler."
            );
            return Ok(AutoscalerOutcome::DryRun);
        }

        self.scale(&autoscaler, record.original_replicas).await?;

        let observed = self
            .inspector
            .deployment(&autoscaler.name, &autoscaler.namespace)
            .await
            .context(autoscaler_error::FindSnafu)?
            .context(autoscaler_error::VanishedSnafu {
                namespace: autoscaler.namespace.clone(),
                name: autoscaler.name.clone(),
            })?;
        let replicas = replicas_of(&observed);
        ensure!(
            replicas == record.original_replicas,
            autoscaler_error::UnconfirmedSnafu {
                expected: record.original_replicas,
                actual: replicas,
            }
        );

        self.state
            .clear_autoscaler(cluster)
            .context(autoscaler_error::StateSnafu)?;
        event!(Level::INFO, replicas, "Restored autoscaler.");
        Ok(AutoscalerOutcome::Restored {
            namespace: autoscaler.namespace,
            name: autoscaler.name,
            replicas,
        })
    }
}

pub mod autoscaler_error {
    use super::workload_error;
    use models::command::command_error;
    use models::state::state_error;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to look up autoscaler: {}", source))]
        Find { source: workload_error::Error },

        #[snafu(display("Unable to scale autoscaler: {}", source))]
        Scale { source: command_error::Error },

        #[snafu(display("Unable to access autoscaler state: {}", source))]
        State { source: state_error::Error },

        #[snafu(display("Autoscaler '{}/{}' disappeared during restore", namespace, name))]
        Vanished { namespace: String, name: String },

        #[snafu(display(
            "Autoscaler restore not confirmed: expected {} replicas, found {}",
            expected,
            actual
        ))]
        Unconfirmed { expected: i32, actual: i32 },
    }
}
