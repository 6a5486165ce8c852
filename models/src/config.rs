use crate::capacity::ClusterIdentity;
use crate::constants::*;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::time::Duration;
use validator::Validate;

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, config_error::Error>;

lazy_static! {
    pub(crate) static ref VALID_AWS_REGION: Regex =
        Regex::new(r"^[a-z]{2}(-gov)?-[a-z]+-[0-9]+$").unwrap();
}

/// Everything the lifecycle tool reads from its configuration file.
///
/// Every field has a default, so an empty file (or no file at all) is a valid configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    #[validate(regex = "VALID_AWS_REGION")]
    pub region: String,
    /// Maps cluster names to the AWS profile used to reach them.
    pub accounts: BTreeMap<String, String>,
    pub state_dir: PathBuf,
    #[validate(length(min = 1))]
    pub kubectl_binary: String,
    #[validate(length(min = 1))]
    pub aws_binary: String,
    pub kubeconfig: Option<PathBuf>,
    #[validate]
    pub timeouts: Timeouts,
    #[validate]
    pub intervals: PollIntervals,
    #[validate]
    pub managed_webhooks: Vec<ManagedWebhook>,
    #[validate(length(min = 1))]
    pub autoscaler_deployment: String,
    #[validate(length(min = 1))]
    pub nodegroup_label_key: String,
    pub excluded_clusters: Vec<String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            region: "us-west-2".to_string(),
            accounts: BTreeMap::new(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            kubectl_binary: KUBECTL_BINARY.to_string(),
            aws_binary: AWS_BINARY.to_string(),
            kubeconfig: None,
            timeouts: Timeouts::default(),
            intervals: PollIntervals::default(),
            managed_webhooks: default_managed_webhooks(),
            autoscaler_deployment: DEFAULT_AUTOSCALER_DEPLOYMENT.to_string(),
            nodegroup_label_key: DEFAULT_NODEGROUP_LABEL_KEY.to_string(),
            excluded_clusters: Vec::new(),
        }
    }
}

impl LifecycleConfig {
    /// Loads configuration from `path` if given, applies environment overrides and validates it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .context(config_error::ReadConfigSnafu { path })?;
                Self::from_yaml(&contents).context(config_error::ParseConfigSnafu { path })?
            }
            None => Self::default(),
        };
        config.with_env_overrides().validated()
    }

    fn from_yaml(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
        // An empty document deserializes to unit, not to an empty mapping.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(state_dir) = env::var(STATE_DIR_ENV_VAR) {
            if !state_dir.is_empty() {
                self.state_dir = PathBuf::from(state_dir);
            }
        }
        self
    }

    pub fn validated(self) -> Result<Self> {
        self.validate().context(config_error::InvalidConfigSnafu)?;
        Ok(self)
    }

    /// The AWS profile configured for a cluster, if any.
    pub fn profile_for(&self, cluster: &ClusterIdentity) -> Option<String> {
        self.accounts.get(cluster.as_str()).cloned()
    }

    pub fn is_excluded(&self, cluster: &ClusterIdentity) -> bool {
        self.excluded_clusters
            .iter()
            .any(|excluded| excluded == cluster.as_str())
    }
}

/// Upper bounds on every wait, in seconds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    #[validate(range(min = 1))]
    pub webhook: u64,
    #[validate(range(min = 1))]
    pub drain: u64,
    pub pod_grace_period: u64,
    #[validate(range(min = 1))]
    pub bootstrap_validation: u64,
    #[validate(range(min = 1))]
    pub dependency_startup: u64,
    #[validate(range(min = 1, max = 3600))]
    pub kubectl: u64,
    #[validate(range(min = 1))]
    pub node_ready: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            webhook: DEFAULT_WEBHOOK_TIMEOUT_SECS,
            drain: DEFAULT_DRAIN_TIMEOUT_SECS,
            pod_grace_period: DEFAULT_POD_GRACE_PERIOD_SECS,
            bootstrap_validation: DEFAULT_BOOTSTRAP_VALIDATION_TIMEOUT_SECS,
            dependency_startup: DEFAULT_DEPENDENCY_STARTUP_TIMEOUT_SECS,
            kubectl: DEFAULT_KUBECTL_TIMEOUT_SECS,
            node_ready: DEFAULT_NODE_READY_TIMEOUT_SECS,
        }
    }
}

impl Timeouts {
    pub fn webhook(&self) -> Duration {
        Duration::from_secs(self.webhook)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain)
    }

    pub fn bootstrap_validation(&self) -> Duration {
        Duration::from_secs(self.bootstrap_validation)
    }

    pub fn dependency_startup(&self) -> Duration {
        Duration::from_secs(self.dependency_startup)
    }

    pub fn kubectl(&self) -> Duration {
        Duration::from_secs(self.kubectl)
    }

    pub fn node_ready(&self) -> Duration {
        Duration::from_secs(self.node_ready)
    }
}

/// Sleep between polls of converging state, in seconds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct PollIntervals {
    #[validate(range(min = 1))]
    pub node_poll: u64,
    #[validate(range(min = 1))]
    pub webhook_poll: u64,
    #[validate(range(min = 1))]
    pub bootstrap_poll: u64,
    #[validate(range(min = 1))]
    pub dependency_poll: u64,
    #[validate(range(min = 1))]
    pub termination_poll: u64,
}

impl Default for PollIntervals {
    fn default() -> Self {
        PollIntervals {
            node_poll: DEFAULT_NODE_POLL_INTERVAL_SECS,
            webhook_poll: DEFAULT_WEBHOOK_POLL_INTERVAL_SECS,
            bootstrap_poll: DEFAULT_BOOTSTRAP_POLL_INTERVAL_SECS,
            dependency_poll: DEFAULT_DEPENDENCY_POLL_INTERVAL_SECS,
            termination_poll: DEFAULT_TERMINATION_POLL_INTERVAL_SECS,
        }
    }
}

impl PollIntervals {
    pub fn node_poll(&self) -> Duration {
        Duration::from_secs(self.node_poll)
    }

    pub fn webhook_poll(&self) -> Duration {
        Duration::from_secs(self.webhook_poll)
    }

    pub fn bootstrap_poll(&self) -> Duration {
        Duration::from_secs(self.bootstrap_poll)
    }

    pub fn dependency_poll(&self) -> Duration {
        Duration::from_secs(self.dependency_poll)
    }

    pub fn termination_poll(&self) -> Duration {
        Duration::from_secs(self.termination_poll)
    }
}

/// A deployment in a namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub name: String,
    pub namespace: String,
}

impl WorkloadRef {
    pub fn new<S: Into<String>>(name: S, namespace: S) -> Self {
        WorkloadRef {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

/// An allow-list entry for webhooks this tool may toggle, optionally naming the deployment that
/// serves it so its rollout can be awaited after restore.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ManagedWebhook {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(default)]
    pub deployment: Option<WorkloadRef>,
}

impl ManagedWebhook {
    pub fn new<S: Into<String>>(name: S, deployment: Option<WorkloadRef>) -> Self {
        ManagedWebhook {
            name: name.into(),
            deployment,
        }
    }
}

fn default_managed_webhooks() -> Vec<ManagedWebhook> {
    vec![
        ManagedWebhook::new(
            "aws-load-balancer-webhook",
            Some(WorkloadRef::new("aws-load-balancer-controller", KUBE_SYSTEM_NAMESPACE)),
        ),
        ManagedWebhook::new(
            "gatekeeper-validating-webhook-configuration",
            Some(WorkloadRef::new("gatekeeper-controller-manager", "gatekeeper-system")),
        ),
        ManagedWebhook::new(
            "kyverno-resource-validating-webhook-cfg",
            Some(WorkloadRef::new("kyverno-admission-controller", "kyverno")),
        ),
    ]
}

pub mod config_error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to read configuration file '{}': {}", path.display(), source))]
        ReadConfig {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Unable to parse configuration file '{}': {}", path.display(), source))]
        ParseConfig {
            path: PathBuf,
            source: serde_yaml::Error,
        },

        #[snafu(display("Invalid configuration: {}", source))]
        InvalidConfig {
            source: validator::ValidationErrors,
        },
    }
}
