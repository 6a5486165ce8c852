/// Helper macro to avoid retyping the base domain-like name of our system when creating further
/// string constants from it. When given no parameters, this returns the base domain-like name of
/// the system. When given a string literal parameter it adds `/parameter` to the end.
#[macro_export]
macro_rules! lifecycle_domain {
    () => {
        "lifecycle.eks.aws"
    };
    ($s:literal) => {
        concat!(lifecycle_domain!(), "/", $s)
    };
}

pub const LIFECYCLE: &str = "eks-lifecycle";

// Label applied to throwaway pods created by this tool (e.g. the DNS smoke test).
pub const LABEL_COMPONENT: &str = lifecycle_domain!("component");
pub const DNS_CHECK_COMPONENT: &str = "dns-check";

// Standard tags https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
pub const APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

// Binaries
pub const KUBECTL_BINARY: &str = "kubectl";
pub const AWS_BINARY: &str = "aws";

// EKS labels every managed node with the name of its node group.
pub const DEFAULT_NODEGROUP_LABEL_KEY: &str = "eks.amazonaws.com/nodegroup";

// Node groups cannot have a max size of zero.
pub const NODEGROUP_MIN_MAX_SIZE: i32 = 1;

// Fallback capacity for groups without a stored record: max(min_nodes * 3, 10).
pub const FALLBACK_MAX_MULTIPLIER: i32 = 3;
pub const FALLBACK_MAX_FLOOR: i32 = 10;

// A cluster is never considered bootstrapped with fewer ready nodes than this.
pub const SYSTEM_NODE_FLOOR: usize = 2;

// Default timeouts, in seconds.
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_POD_GRACE_PERIOD_SECS: u64 = 30;
pub const DEFAULT_BOOTSTRAP_VALIDATION_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_DEPENDENCY_STARTUP_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_KUBECTL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_NODE_READY_TIMEOUT_SECS: u64 = 600;

// Default poll intervals, in seconds.
pub const DEFAULT_NODE_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_WEBHOOK_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_BOOTSTRAP_POLL_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_DEPENDENCY_POLL_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_TERMINATION_POLL_INTERVAL_SECS: u64 = 10;

pub const DEFAULT_STATE_DIR: &str = ".eks-lifecycle/state";
pub const STATE_DIR_ENV_VAR: &str = "LIFECYCLE_STATE_DIR";

pub const DEFAULT_AUTOSCALER_DEPLOYMENT: &str = "cluster-autoscaler";
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

pub const DNS_CHECK_IMAGE: &str = "busybox:1.36";
pub const DNS_LOOKUP_TARGET: &str = "kubernetes.default.svc.cluster.local";
