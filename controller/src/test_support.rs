//! In-memory stand-ins for a cluster and its control plane, used by unit tests across the crate.
//!
//! `FakeCluster` interprets the kubectl invocations this crate issues against a small object store
//! and records every call. `FakeControlPlane` keeps node group capacity and adds or removes nodes
//! in the paired `FakeCluster` when capacity changes.
use crate::provider::{provider_error, ControlPlaneApi, InstanceHealth, CLUSTER_STATUS_ACTIVE};
use models::capacity::{ClusterIdentity, NodeGroupCapacity};
use models::command::{ClusterCommandRunner, CommandOutput, Result as CommandResult};
use models::constants::DEFAULT_NODEGROUP_LABEL_KEY;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetStatus, Deployment, DeploymentSpec, DeploymentStatus,
};
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointSubset, Endpoints, Node, NodeCondition, NodeSpec, NodeStatus, Pod,
    PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use maplit::btreemap;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use uuid::Uuid;

pub(crate) const VALIDATING: &str = "validatingwebhookconfigurations";
pub(crate) const MUTATING: &str = "mutatingwebhookconfigurations";

const NEEDS_FORCE_STDERR: &str = "error: cannot delete Pods declare no controller \
    (use --force to override): default/bare-pod";

const DNS_LOOKUP_STDOUT: &str =
    "Server:    10.100.0.10\nAddress 1: 10.100.0.1 kubernetes.default.svc.cluster.local";

pub(crate) fn temp_state_dir() -> PathBuf {
    std::env::temp_dir().join(format!("eks-lifecycle-test-{}", Uuid::new_v4()))
}

pub(crate) fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

#[derive(Clone, Debug)]
pub(crate) struct FakeNode {
    pub name: String,
    pub group: Option<String>,
    pub ready: bool,
    pub unschedulable: bool,
    pub instance_id: String,
}

impl FakeNode {
    pub fn new(name: &str, group: &str) -> Self {
        FakeNode {
            name: name.to_string(),
            group: Some(group.to_string()),
            ready: true,
            unschedulable: false,
            instance_id: format!("i-{}", name),
        }
    }

    fn to_json(&self) -> Value {
        let labels = self.group.clone().map(|group| {
            let key = DEFAULT_NODEGROUP_LABEL_KEY.to_string();
            btreemap! { key => group }
        });
        let node = Node {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels,
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(self.unschedulable),
                provider_id: Some(format!("aws:///us-west-2a/{}", self.instance_id)),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if self.ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };
        serde_json::to_value(node).unwrap()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct FakePod {
    pub namespace: String,
    pub name: String,
    pub node: String,
    pub daemonset: bool,
    pub mirror: bool,
    pub phase: String,
    /// Survives drains, like a pod stuck terminating.
    pub sticky: bool,
}

impl FakePod {
    pub fn new(namespace: &str, name: &str, node: &str) -> Self {
        FakePod {
            namespace: namespace.to_string(),
            name: name.to_string(),
            node: node.to_string(),
            daemonset: false,
            mirror: false,
            phase: "Running".to_string(),
            sticky: false,
        }
    }

    pub fn daemonset(mut self) -> Self {
        self.daemonset = true;
        self
    }

    pub fn mirror(mut self) -> Self {
        self.mirror = true;
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.phase = phase.to_string();
        self
    }

    pub fn sticky(mut self) -> Self {
        self.sticky = true;
        self
    }

    fn evictable(&self) -> bool {
        !self.daemonset && !self.mirror && !self.sticky
    }

    fn to_json(&self) -> Value {
        let owner_references = if self.daemonset {
            Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "DaemonSet".to_string(),
                name: format!("{}-ds", self.name),
                uid: "uid".to_string(),
                controller: Some(true),
                ..Default::default()
            }])
        } else {
            None
        };
        let annotations = if self.mirror {
            let key = "kubernetes.io/config.mirror".to_string();
            Some(btreemap! { key => "hash".to_string() })
        } else {
            None
        };
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                owner_references,
                annotations,
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(self.node.clone()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(self.phase.clone()),
                ..Default::default()
            }),
        };
        serde_json::to_value(pod).unwrap()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct FakeDeployment {
    pub namespace: String,
    pub name: String,
    pub replicas: i32,
    pub ready_replicas: i32,
}

impl FakeDeployment {
    pub fn new(namespace: &str, name: &str, replicas: i32, ready_replicas: i32) -> Self {
        FakeDeployment {
            namespace: namespace.to_string(),
            name: name.to_string(),
            replicas,
            ready_replicas,
        }
    }

    fn to_json(&self) -> Value {
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(self.replicas),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                replicas: Some(self.replicas),
                ready_replicas: Some(self.ready_replicas),
                ..Default::default()
            }),
        };
        serde_json::to_value(deployment).unwrap()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DrainBehavior {
    /// Refuses unless `--force` is passed.
    NeedsForce,
    /// Always fails.
    Fail,
}

#[derive(Default)]
struct FakeState {
    nodes: BTreeMap<String, FakeNode>,
    pods: Vec<FakePod>,
    deployments: BTreeMap<(String, String), FakeDeployment>,
    daemonsets: BTreeMap<(String, String), (i32, i32)>,
    webhooks: BTreeMap<(String, String), Value>,
    endpoints: BTreeMap<(String, String), bool>,
    drain_behavior: BTreeMap<String, DrainBehavior>,
    failing_commands: Vec<Vec<String>>,
    calls: Vec<Vec<String>>,
    call_timeouts: Vec<(Vec<String>, Duration)>,
    applied: Vec<Value>,
    kubeconfigs: Vec<String>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        FakeCluster::default()
    }

    pub fn add_node(&self, node: FakeNode) {
        let mut state = self.state.lock().unwrap();
        state.nodes.insert(node.name.clone(), node);
    }

    pub fn set_node_ready(&self, name: &str, ready: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.get_mut(name) {
            node.ready = ready;
        }
    }

    pub fn node(&self, name: &str) -> Option<FakeNode> {
        self.state.lock().unwrap().nodes.get(name).cloned()
    }

    pub fn nodes_in_group(&self, group: &str) -> Vec<FakeNode> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|node| node.group.as_deref() == Some(group))
            .cloned()
            .collect()
    }

    /// Adds or removes nodes of a group until it has `desired` members.
    pub fn resize_group(&self, group: &str, desired: i32) {
        let mut state = self.state.lock().unwrap();
        let members: Vec<String> = state
            .nodes
            .values()
            .filter(|node| node.group.as_deref() == Some(group))
            .map(|node| node.name.clone())
            .collect();
        let desired = desired.max(0) as usize;
        if members.len() > desired {
            for name in &members[desired..] {
                state.nodes.remove(name);
                state.pods.retain(|pod| &pod.node != name);
            }
        } else {
            let mut index = 0;
            let mut count = members.len();
            while count < desired {
                let name = format!("{}-node-{}", group, index);
                index += 1;
                if !state.nodes.contains_key(&name) {
                    let node = FakeNode::new(&name, group);
                    state.nodes.insert(name, node);
                    count += 1;
                }
            }
        }
    }

    pub fn add_pod(&self, pod: FakePod) {
        self.state.lock().unwrap().pods.push(pod);
    }

    pub fn pods_on(&self, node: &str) -> Vec<FakePod> {
        self.state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|pod| pod.node == node)
            .cloned()
            .collect()
    }

    pub fn add_deployment(&self, deployment: FakeDeployment) {
        let mut state = self.state.lock().unwrap();
        let key = (deployment.namespace.clone(), deployment.name.clone());
        state.deployments.insert(key, deployment);
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<FakeDeployment> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn add_daemonset(&self, namespace: &str, name: &str, desired: i32, ready: i32) {
        let key = (namespace.to_string(), name.to_string());
        let mut state = self.state.lock().unwrap();
        state.daemonsets.insert(key, (desired, ready));
    }

    pub fn add_webhook(&self, resource: &str, config: Value) {
        let name = config["metadata"]["name"].as_str().unwrap().to_string();
        self.state
            .lock()
            .unwrap()
            .webhooks
            .insert((resource.to_string(), name), config);
    }

    pub fn webhook(&self, resource: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .webhooks
            .get(&(resource.to_string(), name.to_string()))
            .cloned()
    }

    pub fn set_endpoints(&self, namespace: &str, name: &str, has_addresses: bool) {
        self.state
            .lock()
            .unwrap()
            .endpoints
            .insert((namespace.to_string(), name.to_string()), has_addresses);
    }

    pub fn set_drain_behavior(&self, node: &str, behavior: DrainBehavior) {
        self.state
            .lock()
            .unwrap()
            .drain_behavior
            .insert(node.to_string(), behavior);
    }

    /// Every call whose arguments start with `prefix` fails.
    pub fn fail_commands(&self, prefix: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .failing_commands
            .push(strings(prefix));
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of recorded calls whose arguments start with `prefix`.
    pub fn count_calls(&self, prefix: &[&str]) -> usize {
        let prefix = strings(prefix);
        self.calls()
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }

    /// Timeouts requested through `kubectl_with_timeout` for calls starting with `prefix`.
    pub fn call_timeouts(&self, prefix: &[&str]) -> Vec<Duration> {
        let prefix = strings(prefix);
        self.state
            .lock()
            .unwrap()
            .call_timeouts
            .iter()
            .filter(|(args, _)| args.starts_with(&prefix))
            .map(|(_, call_timeout)| *call_timeout)
            .collect()
    }

    pub fn applied(&self) -> Vec<Value> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn kubeconfigs(&self) -> Vec<String> {
        self.state.lock().unwrap().kubeconfigs.clone()
    }

    fn execute(&self, args: &[String], input: Option<&str>) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        state.calls.push(args.to_vec());
        if state
            .failing_commands
            .iter()
            .any(|prefix| args.starts_with(prefix))
        {
            return CommandOutput::failure("error: injected failure");
        }

        let parts: Vec<&str> = args.iter().map(String::as_str).collect();
        match parts.as_slice() {
            ["get", "nodes", "-o", "json"] => {
                list(state.nodes.values().map(FakeNode::to_json).collect())
            }
            ["get", "nodes", "-l", selector, "-o", "json"] => {
                // Either `key=group` or `key in (a,b)`.
                let groups: Vec<&str> = match selector.split_once(" in (") {
                    Some((_, set)) => set.trim_end_matches(')').split(',').collect(),
                    None => selector.splitn(2, '=').nth(1).into_iter().collect(),
                };
                list(
                    state
                        .nodes
                        .values()
                        .filter(|node| {
                            node.group
                                .as_deref()
                                .map_or(false, |group| groups.contains(&group))
                        })
                        .map(FakeNode::to_json)
                        .collect(),
                )
            }
            ["get", "pods", _, "--field-selector", selector, "-o", "json"] => {
                let node = selector.trim_start_matches("spec.nodeName=");
                list(
                    state
                        .pods
                        .iter()
                        .filter(|pod| pod.node == node)
                        .map(FakePod::to_json)
                        .collect(),
                )
            }
            ["get", "deployment", name, "-n", namespace, "-o", "json"] => state
                .deployments
                .get(&(namespace.to_string(), name.to_string()))
                .map(|deployment| object(deployment.to_json()))
                .unwrap_or_else(|| not_found("deployments.apps", name)),
            ["get", "daemonset", name, "-n", namespace, "-o", "json"] => state
                .daemonsets
                .get(&(namespace.to_string(), name.to_string()))
                .map(|(desired, ready)| {
                    let daemonset = DaemonSet {
                        metadata: ObjectMeta {
                            name: Some(name.to_string()),
                            namespace: Some(namespace.to_string()),
                            ..Default::default()
                        },
                        spec: None,
                        status: Some(DaemonSetStatus {
                            desired_number_scheduled: *desired,
                            number_ready: *ready,
                            ..Default::default()
                        }),
                    };
                    object(serde_json::to_value(daemonset).unwrap())
                })
                .unwrap_or_else(|| not_found("daemonsets.apps", name)),
            ["get", "endpoints", name, "-n", namespace, "-o", "json"] => state
                .endpoints
                .get(&(namespace.to_string(), name.to_string()))
                .map(|has_addresses| {
                    let addresses = if *has_addresses {
                        Some(vec![EndpointAddress {
                            ip: "10.0.0.10".to_string(),
                            ..Default::default()
                        }])
                    } else {
                        None
                    };
                    let endpoints = Endpoints {
                        metadata: ObjectMeta {
                            name: Some(name.to_string()),
                            namespace: Some(namespace.to_string()),
                            ..Default::default()
                        },
                        subsets: Some(vec![EndpointSubset {
                            addresses,
                            ..Default::default()
                        }]),
                    };
                    object(serde_json::to_value(endpoints).unwrap())
                })
                .unwrap_or_else(|| not_found("endpoints", name)),
            ["get", resource, "-o", "json"] if is_webhook_kind(resource) => {
                list(
                    state
                        .webhooks
                        .iter()
                        .filter(|((kind, _), _)| kind.as_str() == *resource)
                        .map(|(_, config)| config.clone())
                        .collect(),
                )
            }
            ["get", resource, name, "-o", "json"] if is_webhook_kind(resource) => {
                state
                    .webhooks
                    .get(&(resource.to_string(), name.to_string()))
                    .map(|config| object(config.clone()))
                    .unwrap_or_else(|| not_found(resource, name))
            }
            ["apply", "-f", "-"] => {
                let config: Value = match input.map(serde_json::from_str) {
                    Some(Ok(config)) => config,
                    _ => return CommandOutput::failure("error: no objects passed to apply"),
                };
                let resource = match config["kind"].as_str() {
                    Some("ValidatingWebhookConfiguration") => VALIDATING,
                    Some("MutatingWebhookConfiguration") => MUTATING,
                    _ => return CommandOutput::failure("error: unsupported kind"),
                };
                let name = config["metadata"]["name"].as_str().map(str::to_string);
                let name = name.unwrap_or_default();
                state.applied.push(config.clone());
                let key = (resource.to_string(), name.clone());
                state.webhooks.insert(key, config);
                CommandOutput::success(format!("{}/{} configured", resource, name))
            }
            ["scale", "deployment", name, "-n", namespace, replicas] => {
                let key = (namespace.to_string(), name.to_string());
                let replicas: i32 = match replicas.trim_start_matches("--replicas=").parse() {
                    Ok(replicas) => replicas,
                    Err(_) => return CommandOutput::failure("error: invalid replicas"),
                };
                match state.deployments.get_mut(&key) {
                    Some(deployment) => {
                        deployment.replicas = replicas;
                        deployment.ready_replicas = replicas;
                        CommandOutput::success(format!("deployment.apps/{} scaled", name))
                    }
                    None => not_found("deployments.apps", name),
                }
            }
            ["cordon", node] | ["uncordon", node] => {
                let cordon = parts[0] == "cordon";
                match state.nodes.get_mut(*node) {
                    Some(fake) => {
                        fake.unschedulable = cordon;
                        CommandOutput::success(format!("node/{} {}ed", node, parts[0]))
                    }
                    None => not_found("nodes", node),
                }
            }
            ["drain", node, flags @ ..] => {
                let force = flags.contains(&"--force");
                match state.drain_behavior.get(*node) {
                    Some(DrainBehavior::Fail) => {
                        return CommandOutput::failure("error: unable to drain node");
                    }
                    Some(DrainBehavior::NeedsForce) if !force => {
                        return CommandOutput::failure(NEEDS_FORCE_STDERR);
                    }
                    _ => {}
                }
                match state.nodes.get_mut(*node) {
                    Some(fake) => fake.unschedulable = true,
                    None => return not_found("nodes", node),
                }
                state
                    .pods
                    .retain(|pod| pod.node != *node || !pod.evictable());
                CommandOutput::success(format!("node/{} drained", node))
            }
            ["run", ..] => CommandOutput::success(DNS_LOOKUP_STDOUT),
            _ => CommandOutput::failure(format!("error: unsupported command {:?}", parts)),
        }
    }
}

fn is_webhook_kind(resource: &str) -> bool {
    resource == VALIDATING || resource == MUTATING
}

fn object(value: Value) -> CommandOutput {
    CommandOutput::success(value.to_string())
}

fn list(items: Vec<Value>) -> CommandOutput {
    object(json!({"apiVersion": "v1", "kind": "List", "items": items}))
}

fn not_found(resource: &str, name: &str) -> CommandOutput {
    CommandOutput::failure(format!(
        "Error from server (NotFound): {} \"{}\" not found",
        resource, name
    ))
}

#[async_trait]
impl ClusterCommandRunner for FakeCluster {
    async fn kubectl(&self, args: &[String]) -> CommandResult<CommandOutput> {
        Ok(self.execute(args, None))
    }

    async fn kubectl_with_timeout(
        &self,
        args: &[String],
        call_timeout: Duration,
    ) -> CommandResult<CommandOutput> {
        self.state
            .lock()
            .unwrap()
            .call_timeouts
            .push((args.to_vec(), call_timeout));
        Ok(self.execute(args, None))
    }

    async fn kubectl_with_input(
        &self,
        args: &[String],
        input: &str,
    ) -> CommandResult<CommandOutput> {
        Ok(self.execute(args, Some(input)))
    }

    async fn update_kubeconfig(
        &self,
        cluster: &ClusterIdentity,
        _region: &str,
        _profile: Option<String>,
    ) -> CommandResult<CommandOutput> {
        self.state
            .lock()
            .unwrap()
            .kubeconfigs
            .push(cluster.to_string());
        Ok(CommandOutput::success("Updated context"))
    }

    fn is_simulated(&self) -> bool {
        false
    }
}

/// Builds a webhook configuration whose sub-webhooks carry the given failure policies and call the
/// given service.
pub(crate) fn webhook_config(
    resource: &str,
    name: &str,
    policies: &[&str],
    service: Option<(&str, &str)>,
) -> Value {
    let kind = if resource == VALIDATING {
        "ValidatingWebhookConfiguration"
    } else {
        "MutatingWebhookConfiguration"
    };
    let client_config = match service {
        Some((namespace, service)) => json!({"service": {"namespace": namespace, "name": service}}),
        None => json!({"url": "https://example.com/hook"}),
    };
    let webhooks: Vec<Value> = policies
        .iter()
        .enumerate()
        .map(|(index, policy)| {
            json!({
                "name": format!("hook-{}.example.com", index),
                "failurePolicy": policy,
                "clientConfig": client_config,
                "sideEffects": "None",
                "admissionReviewVersions": ["v1"],
            })
        })
        .collect();
    json!({
        "apiVersion": "admissionregistration.k8s.io/v1",
        "kind": kind,
        "metadata": {
            "name": name,
            "resourceVersion": "42",
            "managedFields": [{"manager": "helm"}],
        },
        "webhooks": webhooks,
    })
}

#[derive(Default)]
struct ControlPlaneState {
    status: String,
    groups: BTreeMap<String, NodeGroupCapacity>,
    updates: Vec<(String, NodeGroupCapacity)>,
    failing_updates: BTreeSet<String>,
    /// Updates are accepted but never take effect.
    ignore_updates: bool,
    unhealthy_instances: BTreeSet<String>,
}

#[derive(Clone)]
pub(crate) struct FakeControlPlane {
    cluster: FakeCluster,
    state: Arc<Mutex<ControlPlaneState>>,
}

impl FakeControlPlane {
    pub fn new(cluster: FakeCluster) -> Self {
        FakeControlPlane {
            cluster,
            state: Arc::new(Mutex::new(ControlPlaneState {
                status: CLUSTER_STATUS_ACTIVE.to_string(),
                ..Default::default()
            })),
        }
    }

    /// Adds a node group and creates its `desired` nodes in the cluster.
    pub fn add_group(&self, name: &str, capacity: NodeGroupCapacity) {
        self.state
            .lock()
            .unwrap()
            .groups
            .insert(name.to_string(), capacity);
        self.cluster.resize_group(name, capacity.desired);
    }

    pub fn capacity(&self, name: &str) -> Option<NodeGroupCapacity> {
        self.state.lock().unwrap().groups.get(name).copied()
    }

    pub fn set_status(&self, status: &str) {
        self.state.lock().unwrap().status = status.to_string();
    }

    pub fn fail_updates_for(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_updates
            .insert(name.to_string());
    }

    pub fn ignore_updates(&self) {
        self.state.lock().unwrap().ignore_updates = true;
    }

    pub fn set_instance_unhealthy(&self, instance_id: &str) {
        self.state
            .lock()
            .unwrap()
            .unhealthy_instances
            .insert(instance_id.to_string());
    }

    pub fn updates(&self) -> Vec<(String, NodeGroupCapacity)> {
        self.state.lock().unwrap().updates.clone()
    }
}

#[async_trait]
impl ControlPlaneApi for FakeControlPlane {
    async fn cluster_status(&self, _cluster: &ClusterIdentity) -> crate::provider::Result<String> {
        Ok(self.state.lock().unwrap().status.clone())
    }

    async fn list_clusters(&self) -> crate::provider::Result<Vec<String>> {
        Ok(vec!["c1".to_string()])
    }

    async fn list_nodegroups(
        &self,
        _cluster: &ClusterIdentity,
    ) -> crate::provider::Result<Vec<String>> {
        Ok(self.state.lock().unwrap().groups.keys().cloned().collect())
    }

    async fn describe_capacity(
        &self,
        cluster: &ClusterIdentity,
        node_group: &str,
    ) -> crate::provider::Result<NodeGroupCapacity> {
        match self.capacity(node_group) {
            Some(capacity) => Ok(capacity),
            None => Err(provider_error::Error::MissingScalingConfig {
                cluster: cluster.to_string(),
                node_group: node_group.to_string(),
            }),
        }
    }

    async fn update_capacity(
        &self,
        cluster: &ClusterIdentity,
        node_group: &str,
        capacity: NodeGroupCapacity,
    ) -> crate::provider::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.updates.push((node_group.to_string(), capacity));
            if state.failing_updates.contains(node_group) {
                return Err(provider_error::Error::UpdateNodegroup {
                    cluster: cluster.to_string(),
                    node_group: node_group.to_string(),
                    retriable: false,
                    source: "InvalidParameterException".into(),
                });
            }
            if state.ignore_updates {
                return Ok(());
            }
            state.groups.insert(node_group.to_string(), capacity);
        }
        self.cluster.resize_group(node_group, capacity.desired);
        Ok(())
    }

    async fn instance_health(
        &self,
        instance_ids: &[String],
    ) -> crate::provider::Result<Vec<InstanceHealth>> {
        let state = self.state.lock().unwrap();
        Ok(instance_ids
            .iter()
            .map(|instance_id| {
                let healthy = !state.unhealthy_instances.contains(instance_id);
                InstanceHealth {
                    instance_id: instance_id.clone(),
                    running: true,
                    system_status_ok: healthy,
                    instance_status_ok: healthy,
                }
            })
            .collect())
    }
}
