/*!
  The webhook gate toggles admission webhooks between blocking (`Fail`) and permissive (`Ignore`)
  failure policies.

  While a cluster has no nodes, the services behind its admission webhooks are gone. A webhook
  with a `Fail` policy then rejects every matching request, including the ones needed to bring
  those services back. Scale-down therefore suppresses managed webhooks to `Ignore`, and scale-up
  restores them to `Fail` once workloads are back.

  Only webhooks on the configured allow-list are touched. Configurations are fetched live, every
  sub-webhook's policy is rewritten, and the object is re-applied only when something changed.
!*/

use crate::workload::WorkloadInspector;
use models::command::{args, ClusterCommandRunner, ResourceList};
use models::config::ManagedWebhook;
use models::poll::{poll_until, PollOutcome};

use k8s_openapi::api::core::v1::Endpoints;
use serde::Serialize;
use serde_json::Value;
use snafu::ResultExt;
use tokio::time::Duration;
use tracing::{event, instrument, Level};

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, webhook_error::Error>;

pub const POLICY_FAIL: &str = "Fail";
pub const POLICY_IGNORE: &str = "Ignore";

// Server-populated metadata that must not be sent back on apply.
const SERVER_MANAGED_METADATA: &[&str] = &[
    "managedFields",
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
pub enum WebhookKind {
    #[strum(serialize = "validating")]
    Validating,
    #[strum(serialize = "mutating")]
    Mutating,
}

impl WebhookKind {
    pub const ALL: [WebhookKind; 2] = [WebhookKind::Validating, WebhookKind::Mutating];

    fn resource(&self) -> &'static str {
        match self {
            WebhookKind::Validating => "validatingwebhookconfigurations",
            WebhookKind::Mutating => "mutatingwebhookconfigurations",
        }
    }
}

/// A namespaced service called by a webhook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WebhookDescriptor {
    pub name: String,
    pub kind: WebhookKind,
    /// `Fail` if any sub-webhook blocks, otherwise `Ignore`.
    pub failure_policy: String,
    pub services: Vec<ServiceRef>,
}

impl WebhookDescriptor {
    fn from_config(kind: WebhookKind, config: &Value) -> Option<Self> {
        let name = config["metadata"]["name"].as_str()?.to_string();
        let hooks = sub_webhooks(config);
        let blocking = hooks
            .iter()
            .any(|hook| effective_policy(hook) == POLICY_FAIL);
        let services = hooks
            .iter()
            .filter_map(|hook| {
                let service = &hook["clientConfig"]["service"];
                Some(ServiceRef {
                    namespace: service["namespace"].as_str()?.to_string(),
                    name: service["name"].as_str()?.to_string(),
                })
            })
            .collect();

        Some(WebhookDescriptor {
            name,
            kind,
            failure_policy: if blocking { POLICY_FAIL } else { POLICY_IGNORE }.to_string(),
            services,
        })
    }
}

fn sub_webhooks(config: &Value) -> Vec<Value> {
    config["webhooks"].as_array().cloned().unwrap_or_default()
}

/// The API server treats a missing policy as `Fail`.
fn effective_policy(hook: &Value) -> &str {
    hook["failurePolicy"].as_str().unwrap_or(POLICY_FAIL)
}

/// Sets every sub-webhook's policy to `policy`, returning whether anything changed.
pub(crate) fn set_failure_policy(config: &mut Value, policy: &str) -> bool {
    let mut changed = false;
    if let Some(hooks) = config["webhooks"].as_array_mut() {
        for hook in hooks.iter_mut() {
            if effective_policy(hook) != policy {
                hook["failurePolicy"] = Value::String(policy.to_string());
                changed = true;
            }
        }
    }
    changed
}

fn strip_server_metadata(config: &mut Value) {
    if let Some(metadata) = config["metadata"].as_object_mut() {
        for field in SERVER_MANAGED_METADATA {
            metadata.remove(*field);
        }
    }
}

/// What a suppress or restore pass did to the managed webhooks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PolicyChange {
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<String>,
}

impl PolicyChange {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct WebhookGate<R: ClusterCommandRunner + Clone> {
    runner: R,
    inspector: WorkloadInspector<R>,
    managed: Vec<ManagedWebhook>,
    poll_interval: Duration,
}

impl<R: ClusterCommandRunner + Clone> WebhookGate<R> {
    pub fn new(runner: R, managed: Vec<ManagedWebhook>, poll_interval: Duration) -> Self {
        WebhookGate {
            inspector: WorkloadInspector::new(runner.clone()),
            runner,
            managed,
            poll_interval,
        }
    }

    /// A webhook is managed when its name equals or contains an allow-listed identifier. Empty
    /// identifiers match nothing.
    pub fn is_managed(&self, name: &str) -> bool {
        self.managed
            .iter()
            .filter(|entry| !entry.name.is_empty())
            .any(|entry| name.contains(entry.name.as_str()))
    }

    async fn list_configs(&self, kind: WebhookKind) -> Result<Vec<Value>> {
        let list_args = args(["get", kind.resource(), "-o", "json"]);
        let output = self
            .runner
            .kubectl(&list_args)
            .await
            .and_then(|output| output.ensure_success(&list_args))
            .context(webhook_error::ListWebhooksSnafu { kind })?;
        let list: ResourceList<Value> = output
            .json()
            .context(webhook_error::ListWebhooksSnafu { kind })?;
        Ok(list.items)
    }

    #[instrument(skip(self), err)]
    pub async fn list_webhooks(&self, kind: WebhookKind) -> Result<Vec<WebhookDescriptor>> {
        Ok(self
            .list_configs(kind)
            .await?
            .iter()
            .filter_map(|config| WebhookDescriptor::from_config(kind, config))
            .collect())
    }

    async fn managed_webhooks(&self) -> Result<Vec<WebhookDescriptor>> {
        let mut managed = Vec::new();
        for kind in WebhookKind::ALL.iter() {
            managed.extend(
                self.list_webhooks(*kind)
                    .await?
                    .into_iter()
                    .filter(|webhook| self.is_managed(&webhook.name)),
            );
        }
        Ok(managed)
    }

    /// Fetches one configuration, rewrites its policies, and applies it if anything changed.
    /// Returns whether an apply was issued.
    async fn apply_policy(&self, webhook: &WebhookDescriptor, policy: &str) -> Result<bool> {
        let get_args = args([
            "get",
            webhook.kind.resource(),
            webhook.name.as_str(),
            "-o",
            "json",
        ]);
        let mut config: Value = self
            .runner
            .kubectl(&get_args)
            .await
            .and_then(|output| output.ensure_success(&get_args))
            .and_then(|output| output.json())
            .context(webhook_error::FetchWebhookSnafu {
                name: webhook.name.clone(),
            })?;

        if !set_failure_policy(&mut config, policy) {
            event!(
                Level::INFO,
                webhook = %webhook.name,
                policy,
                "Webhook already has the desired failure policy."
            );
            return Ok(false);
        }

        strip_server_metadata(&mut config);
        let apply_args = args(["apply", "-f", "-"]);
        let manifest = serde_json::to_string(&config).context(webhook_error::SerializeSnafu {
            name: webhook.name.clone(),
        })?;
        self.runner
            .kubectl_with_input(&apply_args, &manifest)
            .await
            .and_then(|output| output.ensure_success(&apply_args))
            .context(webhook_error::ApplyWebhookSnafu {
                name: webhook.name.clone(),
            })?;
        event!(Level::INFO, webhook = %webhook.name, policy, "Updated webhook failure policy.");
        Ok(true)
    }

    async fn set_policy(&self, policy: &str) -> Result<PolicyChange> {
        let mut change = PolicyChange::default();
        for webhook in self.managed_webhooks().await? {
            match self.apply_policy(&webhook, policy).await {
                Ok(true) => change.changed.push(webhook.name),
                Ok(false) => change.unchanged.push(webhook.name),
                Err(err) => {
                    event!(
                        Level::ERROR,
                        webhook = %webhook.name,
                        error = %err,
                        "Unable to update webhook failure policy."
                    );
                    change.failed.push(webhook.name);
                }
            }
        }
        Ok(change)
    }

    /// Switches managed webhooks to `Ignore` so an empty cluster does not reject its own recovery.
    #[instrument(skip(self), err)]
    pub async fn suppress(&self) -> Result<PolicyChange> {
        self.set_policy(POLICY_IGNORE).await
    }

    /// Returns managed webhooks to blocking mode.
    #[instrument(skip(self), err)]
    pub async fn restore(&self) -> Result<PolicyChange> {
        self.set_policy(POLICY_FAIL).await
    }

    /// Whether a webhook's backing services have at least one ready endpoint. Webhooks outside the
    /// allow-list, and URL-configured webhooks, are reported healthy.
    #[instrument(skip(self, webhook), fields(webhook = %webhook.name))]
    pub async fn is_healthy(&self, webhook: &WebhookDescriptor) -> bool {
        if !self.is_managed(&webhook.name) {
            return true;
        }
        for service in &webhook.services {
            if !self.service_has_endpoints(service).await {
                event!(
                    Level::DEBUG,
                    service = %service.name,
                    "Webhook service has no ready endpoints."
                );
                return false;
            }
        }
        true
    }

    async fn service_has_endpoints(&self, service: &ServiceRef) -> bool {
        let get_args = args([
            "get",
            "endpoints",
            service.name.as_str(),
            "-n",
            service.namespace.as_str(),
            "-o",
            "json",
        ]);
        let endpoints: Endpoints = match self
            .runner
            .kubectl(&get_args)
            .await
            .and_then(|output| output.ensure_success(&get_args))
            .and_then(|output| output.json())
        {
            Ok(endpoints) => endpoints,
            Err(_) => return false,
        };
        endpoints
            .subsets
            .unwrap_or_default()
            .iter()
            .filter_map(|subset| subset.addresses.as_ref())
            .any(|addresses| !addresses.is_empty())
    }

    async fn backing_deployments_ready(&self) -> bool {
        for deployment in self.managed.iter().flat_map(|entry| &entry.deployment) {
            match self
                .inspector
                .deployment(&deployment.name, &deployment.namespace)
                .await
            {
                Ok(Some(live)) => {
                    let wanted = live
                        .spec
                        .as_ref()
                        .and_then(|spec| spec.replicas)
                        .unwrap_or(1);
                    let ready = live
                        .status
                        .as_ref()
                        .and_then(|status| status.ready_replicas)
                        .unwrap_or(0);
                    if ready != wanted {
                        return false;
                    }
                }
                // Not installed on this cluster.
                Ok(None) => {}
                Err(_) => return false,
            }
        }
        true
    }

    async fn all_healthy(&self) -> Result<Option<()>> {
        if !self.backing_deployments_ready().await {
            return Ok(None);
        }
        for webhook in self.managed_webhooks().await? {
            if !self.is_healthy(&webhook).await {
                return Ok(None);
            }
        }
        Ok(Some(()))
    }

    /// Polls until every managed webhook's deployment has rolled out and its service has endpoints.
    #[instrument(skip(self))]
    pub async fn wait_healthy(&self, timeout: Duration) -> PollOutcome<(), webhook_error::Error> {
        poll_until("managed webhooks healthy", self.poll_interval, timeout, move || {
            self.all_healthy()
        })
        .await
    }
}

pub mod webhook_error {
    use super::WebhookKind;
    use models::command::command_error;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to list {} webhook configurations: {}", kind, source))]
        ListWebhooks {
            kind: WebhookKind,
            source: command_error::Error,
        },

        #[snafu(display("Unable to fetch webhook configuration '{}': {}", name, source))]
        FetchWebhook {
            name: String,
            source: command_error::Error,
        },

        #[snafu(display("Unable to serialize webhook configuration '{}': {}", name, source))]
        Serialize {
            name: String,
            source: serde_json::Error,
        },

        #[snafu(display("Unable to apply webhook configuration '{}': {}", name, source))]
        ApplyWebhook {
            name: String,
            source: command_error::Error,
        },
    }
}
