use snafu::Snafu;

/// Failures that stop a scale-up in its tracks. Steps already completed stay in place.
///
/// These are kept apart from the per-component errors, which only ever degrade a run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CriticalPathError {
    #[snafu(display(
        "Only {} ready and schedulable nodes, at least {} are required",
        ready,
        required
    ))]
    InsufficientNodes { ready: usize, required: usize },

    #[snafu(display("Unable to query cluster nodes: {}", source))]
    NodeQuery {
        source: crate::bootstrap::bootstrap_error::Error,
    },

    #[snafu(display(
        "System workloads not ready after {}s: {}",
        elapsed.as_secs(),
        pending.join(", ")
    ))]
    BootstrapTimeout {
        pending: Vec<String>,
        elapsed: tokio::time::Duration,
    },

    #[snafu(display(
        "Critical services of tier '{}' not ready after {}s: {}",
        tier,
        elapsed.as_secs(),
        services.join(", ")
    ))]
    CriticalTier {
        tier: String,
        services: Vec<String>,
        elapsed: tokio::time::Duration,
    },
}
