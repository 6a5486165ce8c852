use controller::orchestrator::{ClusterStatus, ValidationReport};
use controller::provider::{ControlPlaneApi, EksControlPlane, SimulatedControlPlane};
use controller::verification::{VerificationLevel, VerificationResult};
use controller::ClusterLifecycleOrchestrator;
use models::capacity::ClusterIdentity;
use models::command::{ClusterCommandRunner, KubectlRunner, SimulatedRunner};
use models::config::LifecycleConfig;
use models::constants::SYSTEM_NODE_FLOOR;
use models::result::NodeGroupResult;
use models::telemetry;

use argh::FromArgs;
use futures::{stream, StreamExt};
use serde::Serialize;
use snafu::{ensure, ResultExt};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{event, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, controller_error::Error>;

/// Clusters handled at the same time when each has its own kubeconfig.
const CONCURRENT_CLUSTERS: usize = 4;
const KUBECONFIG_DIR: &str = "kubeconfig";

#[derive(FromArgs, Debug)]
/// Scales EKS clusters down for idle windows and brings them back safely.
struct Arguments {
    /// path to the YAML configuration file
    #[argh(option)]
    config: Option<PathBuf>,

    /// AWS region, overriding the configuration file
    #[argh(option)]
    region: Option<String>,

    /// cluster to operate on; repeat for several. Defaults to every cluster in the region.
    #[argh(option)]
    cluster: Vec<String>,

    /// log and simulate every change instead of making it
    #[argh(switch)]
    dry_run: bool,

    /// debug-level logging
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    subcommand: SubCommand,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum SubCommand {
    ScaleDown(ScaleDownArgs),
    ScaleUp(ScaleUpArgs),
    Validate(ValidateArgs),
    Verify(VerifyArgs),
    Status(StatusArgs),
}

#[derive(FromArgs, Debug)]
/// Drain node groups and take their capacity to zero.
#[argh(subcommand, name = "scale-down")]
struct ScaleDownArgs {}

#[derive(FromArgs, Debug)]
/// Restore node group capacity and bring workloads back.
#[argh(subcommand, name = "scale-up")]
struct ScaleUpArgs {
    /// lower bound for each node group's min and desired size
    #[argh(option, default = "SYSTEM_NODE_FLOOR as i32")]
    min_nodes: i32,
}

#[derive(FromArgs, Debug)]
/// Check bootstrap readiness and the dependency tiers without changing anything.
#[argh(subcommand, name = "validate")]
struct ValidateArgs {
    /// nodes that must be ready and schedulable
    #[argh(option, default = "SYSTEM_NODE_FLOOR")]
    min_nodes: usize,
}

#[derive(FromArgs, Debug)]
/// Check the EC2 instances behind the cluster's nodes.
#[argh(subcommand, name = "verify")]
struct VerifyArgs {
    /// one of state, system or full
    #[argh(option, default = "VerificationLevel::State")]
    level: VerificationLevel,
}

#[derive(FromArgs, Debug)]
/// Show stored records next to live capacity.
#[argh(subcommand, name = "status")]
struct StatusArgs {}

#[derive(Serialize)]
#[serde(untagged)]
enum Report {
    NodeGroups(Vec<NodeGroupResult>),
    Status(ClusterStatus),
    Validation(ValidationReport),
    Verification(VerificationResult),
}

#[derive(Serialize)]
struct ClusterReport {
    cluster: ClusterIdentity,
    succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<Report>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ClusterReport {
    fn from_results(cluster: ClusterIdentity, results: Vec<NodeGroupResult>) -> Self {
        ClusterReport {
            cluster,
            succeeded: results.iter().all(NodeGroupResult::is_success),
            report: Some(Report::NodeGroups(results)),
            error: None,
        }
    }

    fn from_outcome<T, E: std::fmt::Display>(
        cluster: ClusterIdentity,
        outcome: std::result::Result<T, E>,
        passed: impl FnOnce(&T) -> bool,
        wrap: impl FnOnce(T) -> Report,
    ) -> Self {
        match outcome {
            Ok(value) => ClusterReport {
                cluster,
                succeeded: passed(&value),
                report: Some(wrap(value)),
                error: None,
            },
            Err(err) => ClusterReport {
                cluster,
                succeeded: false,
                report: None,
                error: Some(err.to_string()),
            },
        }
    }
}

#[tokio::main]
async fn main() {
    let arguments: Arguments = argh::from_env();
    if let Err(e) = run(arguments).await {
        eprintln!("{}", e);
        process::exit(1);
    }
}

async fn run(arguments: Arguments) -> Result<()> {
    telemetry::init_telemetry_from_env(arguments.verbose)
        .context(controller_error::TelemetryInitSnafu)?;

    let mut config =
        LifecycleConfig::load(arguments.config.as_deref()).context(controller_error::ConfigSnafu)?;
    if let Some(region) = arguments.region.clone() {
        config.region = region;
        config = config.validated().context(controller_error::ConfigSnafu)?;
    }

    let clusters = select_clusters(&arguments, &config).await?;
    // A shared kubeconfig can only point at one cluster at a time.
    let concurrency = if config.kubeconfig.is_some() {
        1
    } else {
        CONCURRENT_CLUSTERS
    };
    event!(Level::INFO, ?clusters, dry_run = arguments.dry_run, "Starting lifecycle run.");

    let reports: Vec<ClusterReport> = stream::iter(clusters)
        .map(|cluster| run_cluster(&arguments, &config, cluster))
        .buffered(concurrency)
        .collect()
        .await;

    let rendered =
        serde_json::to_string_pretty(&reports).context(controller_error::SerializeSnafu)?;
    println!("{}", rendered);

    let failed: Vec<String> = reports
        .iter()
        .filter(|report| !report.succeeded)
        .map(|report| report.cluster.to_string())
        .collect();
    ensure!(
        failed.is_empty(),
        controller_error::ClustersFailedSnafu { failed }
    );
    Ok(())
}

async fn select_clusters(
    arguments: &Arguments,
    config: &LifecycleConfig,
) -> Result<Vec<ClusterIdentity>> {
    // A simulated control plane has no clusters to discover.
    ensure!(
        !(arguments.dry_run && arguments.cluster.is_empty()),
        controller_error::DryRunWithoutClusterSnafu
    );
    let names = if !arguments.cluster.is_empty() {
        arguments.cluster.clone()
    } else {
        EksControlPlane::new(&config.region, None)
            .await
            .list_clusters()
            .await
            .context(controller_error::ListClustersSnafu)?
    };
    Ok(names
        .into_iter()
        .map(ClusterIdentity::new)
        .filter(|cluster| {
            let excluded = config.is_excluded(cluster) && arguments.cluster.is_empty();
            if excluded {
                event!(Level::INFO, %cluster, "Skipping excluded cluster.");
            }
            !excluded
        })
        .collect())
}

/// Each cluster gets its own runner and control-plane client, so concurrent sessions never share
/// credentials or a kubeconfig.
async fn run_cluster(
    arguments: &Arguments,
    config: &LifecycleConfig,
    cluster: ClusterIdentity,
) -> ClusterReport {
    let (runner, provider): (Arc<dyn ClusterCommandRunner>, Arc<dyn ControlPlaneApi>) =
        if arguments.dry_run {
            (
                Arc::new(SimulatedRunner::new()),
                Arc::new(SimulatedControlPlane::default()),
            )
        } else {
            let kubeconfig = config.kubeconfig.clone().unwrap_or_else(|| {
                config
                    .state_dir
                    .join(KUBECONFIG_DIR)
                    .join(format!("{}.yaml", cluster))
            });
            let profile = config.profile_for(&cluster);
            (
                Arc::new(
                    KubectlRunner::new(config.timeouts.kubectl())
                        .with_binaries(config.kubectl_binary.as_str(), config.aws_binary.as_str())
                        .with_kubeconfig(Some(kubeconfig)),
                ),
                Arc::new(EksControlPlane::new(&config.region, profile).await),
            )
        };
    let orchestrator = ClusterLifecycleOrchestrator::new(config.clone(), runner, provider);

    match &arguments.subcommand {
        SubCommand::ScaleDown(_) => {
            let results = orchestrator.scale_down(&cluster).await;
            ClusterReport::from_results(cluster, results)
        }
        SubCommand::ScaleUp(scale_up) => {
            let results = orchestrator.scale_up(&cluster, scale_up.min_nodes).await;
            ClusterReport::from_results(cluster, results)
        }
        SubCommand::Validate(validate) => {
            let outcome = orchestrator.validate(&cluster, validate.min_nodes).await;
            ClusterReport::from_outcome(cluster, outcome, |_| true, Report::Validation)
        }
        SubCommand::Verify(verify) => {
            let outcome = orchestrator.verify(&cluster, verify.level).await;
            ClusterReport::from_outcome(
                cluster,
                outcome,
                |result| result.passed,
                Report::Verification,
            )
        }
        SubCommand::Status(_) => {
            let outcome = orchestrator.status(&cluster).await;
            ClusterReport::from_outcome(cluster, outcome, |_| true, Report::Status)
        }
    }
}

pub mod controller_error {
    use models::config::config_error;
    use models::telemetry;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to initialize telemetry: '{}'", source))]
        TelemetryInit {
            source: telemetry::TelemetryConfigError,
        },

        #[snafu(display("Unable to load configuration: '{}'", source))]
        Config { source: config_error::Error },

        #[snafu(display("A dry run needs at least one --cluster"))]
        DryRunWithoutCluster,

        #[snafu(display("Unable to list clusters: '{}'", source))]
        ListClusters {
            source: controller::provider::provider_error::Error,
        },

        #[snafu(display("Unable to render results: '{}'", source))]
        Serialize { source: serde_json::Error },

        #[snafu(display("Lifecycle run failed for: {}", failed.join(", ")))]
        ClustersFailed { failed: Vec<String> },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn arguments(cluster: &[&str], dry_run: bool) -> Arguments {
        Arguments {
            config: None,
            region: None,
            cluster: cluster.iter().map(|name| name.to_string()).collect(),
            dry_run,
            verbose: false,
            subcommand: SubCommand::Status(StatusArgs {}),
        }
    }

    #[tokio::test]
    async fn test_dry_run_requires_named_clusters() {
        let config = LifecycleConfig {
            excluded_clusters: vec!["c2".to_string()],
            ..Default::default()
        };

        assert!(matches!(
            select_clusters(&arguments(&[], true), &config).await,
            Err(controller_error::Error::DryRunWithoutCluster)
        ));
        // clusters named on the command line are taken as given
        assert_eq!(
            select_clusters(&arguments(&["c1", "c2"], true), &config)
                .await
                .unwrap(),
            vec![ClusterIdentity::new("c1"), ClusterIdentity::new("c2")]
        );
    }
}
