/*!
  The command runner is the only way components talk to a cluster. Every kubectl (and aws cli)
  invocation goes through a `ClusterCommandRunner`, which bounds each call with a timeout and
  reports a structured result instead of a raw process status.

  `KubectlRunner` spawns real processes. `SimulatedRunner` short-circuits every call with canned
  success output, which is what `--dry-run` uses.
!*/

use crate::capacity::ClusterIdentity;
use crate::constants::{AWS_BINARY, KUBECTL_BINARY};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use snafu::{ensure, ResultExt};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{event, instrument, Level};

#[cfg(feature = "mockall")]
use mockall::{mock, predicate::*};

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, command_error::Error>;

/// kubectl prints this when the requested object does not exist.
const NOT_FOUND_MARKER: &str = "(NotFound)";

/// Canned output for simulated `get -o json` calls: an empty list.
const SIMULATED_LIST_OUTPUT: &str = r#"{"apiVersion":"v1","kind":"List","items":[]}"#;
const SIMULATED_OUTPUT: &str = "simulated";

/// The structured result of a single command invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success<S: Into<String>>(stdout: S) -> Self {
        CommandOutput {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure<S: Into<String>>(stderr: S) -> Self {
        CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command failed because the object it asked for does not exist.
    pub fn is_not_found(&self) -> bool {
        !self.success && self.stderr.contains(NOT_FOUND_MARKER)
    }

    /// Converts a failed invocation into an error carrying its stderr.
    pub fn ensure_success(self, args: &[String]) -> Result<Self> {
        ensure!(
            self.success,
            command_error::CommandFailedSnafu {
                args: args.to_vec(),
                stderr: self.stderr.trim().to_string(),
            }
        );
        Ok(self)
    }

    /// Parses stdout as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.stdout).context(command_error::ParseOutputSnafu)
    }
}

/// Mirrors the `items` of any `kubectl get -o json` list response.
#[derive(Clone, Debug, Deserialize)]
pub struct ResourceList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// Builds an argument vector from string-like parts.
pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

#[async_trait]
/// A trait providing an interface to run control-plane commands. This is provided as a trait
/// in order to allow fakes and mocks to be used for testing purposes.
pub trait ClusterCommandRunner: Send + Sync {
    /// Runs kubectl with the given arguments.
    async fn kubectl(&self, args: &[String]) -> Result<CommandOutput>;
    /// Runs kubectl with a call timeout other than the runner's own, for commands such as
    /// `kubectl drain` that carry a longer `--timeout` of their own.
    async fn kubectl_with_timeout(
        &self,
        args: &[String],
        call_timeout: Duration,
    ) -> Result<CommandOutput>;
    /// Runs kubectl, writing `input` to its stdin (used with `apply -f -`).
    async fn kubectl_with_input(&self, args: &[String], input: &str) -> Result<CommandOutput>;
    /// Writes credentials for the given cluster so subsequent kubectl calls reach it.
    async fn update_kubeconfig(
        &self,
        cluster: &ClusterIdentity,
        region: &str,
        profile: Option<String>,
    ) -> Result<CommandOutput>;
    /// Whether calls are short-circuited rather than executed.
    fn is_simulated(&self) -> bool;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock ClusterCommandRunner for use in tests.
    pub ClusterCommandRunner {}
    #[async_trait]
    impl ClusterCommandRunner for ClusterCommandRunner {
        async fn kubectl(&self, args: &[String]) -> Result<CommandOutput>;
        async fn kubectl_with_timeout(
            &self,
            args: &[String],
            call_timeout: Duration,
        ) -> Result<CommandOutput>;
        async fn kubectl_with_input(&self, args: &[String], input: &str) -> Result<CommandOutput>;
        async fn update_kubeconfig(
            &self,
            cluster: &ClusterIdentity,
            region: &str,
            profile: Option<String>,
        ) -> Result<CommandOutput>;
        fn is_simulated(&self) -> bool;
    }
}

#[async_trait]
impl<T> ClusterCommandRunner for Arc<T>
where
    T: ClusterCommandRunner + ?Sized,
{
    async fn kubectl(&self, args: &[String]) -> Result<CommandOutput> {
        (**self).kubectl(args).await
    }

    async fn kubectl_with_timeout(
        &self,
        args: &[String],
        call_timeout: Duration,
    ) -> Result<CommandOutput> {
        (**self).kubectl_with_timeout(args, call_timeout).await
    }

    async fn kubectl_with_input(&self, args: &[String], input: &str) -> Result<CommandOutput> {
        (**self).kubectl_with_input(args, input).await
    }

    async fn update_kubeconfig(
        &self,
        cluster: &ClusterIdentity,
        region: &str,
        profile: Option<String>,
    ) -> Result<CommandOutput> {
        (**self).update_kubeconfig(cluster, region, profile).await
    }

    fn is_simulated(&self) -> bool {
        (**self).is_simulated()
    }
}

#[derive(Clone, Debug)]
/// Implements `ClusterCommandRunner` by spawning kubectl and the aws cli.
pub struct KubectlRunner {
    kubectl_binary: String,
    aws_binary: String,
    kubeconfig: Option<PathBuf>,
    call_timeout: Duration,
}

impl KubectlRunner {
    pub fn new(call_timeout: Duration) -> Self {
        KubectlRunner {
            kubectl_binary: KUBECTL_BINARY.to_string(),
            aws_binary: AWS_BINARY.to_string(),
            kubeconfig: None,
            call_timeout,
        }
    }

    pub fn with_binaries<S: Into<String>>(mut self, kubectl_binary: S, aws_binary: S) -> Self {
        self.kubectl_binary = kubectl_binary.into();
        self.aws_binary = aws_binary.into();
        self
    }

    /// Points every kubectl call (and the kubeconfig written for a session) at the given file.
    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    fn kubectl_args(&self, args: &[String]) -> Vec<String> {
        let mut full_args = args.to_vec();
        if let Some(kubeconfig) = self.kubeconfig.as_ref() {
            full_args.push("--kubeconfig".to_string());
            full_args.push(kubeconfig.to_string_lossy().to_string());
        }
        full_args
    }

    #[instrument(skip(self, input), err)]
    async fn run(
        &self,
        program: &str,
        args: Vec<String>,
        input: Option<&str>,
        call_timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut command = Command::new(program);
        command
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if input.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn().context(command_error::SpawnSnafu {
            program: program.to_string(),
            args: args.clone(),
        })?;

        // A child that stops reading stdin must not outlive the call timeout either.
        let completion = async {
            if let Some(input) = input {
                if let Some(mut stdin) = child.stdin.take() {
                    stdin
                        .write_all(input.as_bytes())
                        .await
                        .context(command_error::WriteStdinSnafu {
                            program: program.to_string(),
                        })?;
                }
            }
            child
                .wait_with_output()
                .await
                .context(command_error::SpawnSnafu {
                    program: program.to_string(),
                    args: args.clone(),
                })
        };

        let output = timeout(call_timeout, completion)
            .await
            .map_err(|_| command_error::Error::CommandTimeout {
                args: args.clone(),
                elapsed: call_timeout,
            })??;

        let result = CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if !result.success {
            event!(
                Level::DEBUG,
                program,
                ?args,
                stderr = %result.stderr.trim(),
                "Command exited unsuccessfully."
            );
        }
        Ok(result)
    }
}

#[async_trait]
impl ClusterCommandRunner for KubectlRunner {
    async fn kubectl(&self, args: &[String]) -> Result<CommandOutput> {
        self.kubectl_with_timeout(args, self.call_timeout).await
    }

    async fn kubectl_with_timeout(
        &self,
        args: &[String],
        call_timeout: Duration,
    ) -> Result<CommandOutput> {
        let kubectl_args = self.kubectl_args(args);
        self.run(&self.kubectl_binary, kubectl_args, None, call_timeout)
            .await
    }

    async fn kubectl_with_input(&self, args: &[String], input: &str) -> Result<CommandOutput> {
        self.run(
            &self.kubectl_binary,
            self.kubectl_args(args),
            Some(input),
            self.call_timeout,
        )
        .await
    }

    async fn update_kubeconfig(
        &self,
        cluster: &ClusterIdentity,
        region: &str,
        profile: Option<String>,
    ) -> Result<CommandOutput> {
        let mut aws_args = args([
            "eks",
            "update-kubeconfig",
            "--name",
            cluster.as_str(),
            "--region",
            region,
        ]);
        if let Some(profile) = profile {
            aws_args.push("--profile".to_string());
            aws_args.push(profile);
        }
        if let Some(kubeconfig) = self.kubeconfig.as_ref() {
            aws_args.push("--kubeconfig".to_string());
            aws_args.push(kubeconfig.to_string_lossy().to_string());
        }
        self.run(&self.aws_binary, aws_args, None, self.call_timeout)
            .await
    }

    fn is_simulated(&self) -> bool {
        false
    }
}

#[derive(Clone, Debug, Default)]
/// A `ClusterCommandRunner` that never touches a cluster. Every call is logged and answered with
/// deterministic success output: an empty list for `get ... -o json`, a fixed string otherwise.
pub struct SimulatedRunner {}

impl SimulatedRunner {
    pub fn new() -> Self {
        SimulatedRunner {}
    }

    fn canned_output(args: &[String]) -> CommandOutput {
        let is_json_get = args.first().map(String::as_str) == Some("get")
            && args.windows(2).any(|pair| pair == ["-o", "json"]);
        if is_json_get {
            CommandOutput::success(SIMULATED_LIST_OUTPUT)
        } else {
            CommandOutput::success(SIMULATED_OUTPUT)
        }
    }
}

#[async_trait]
impl ClusterCommandRunner for SimulatedRunner {
    async fn kubectl(&self, args: &[String]) -> Result<CommandOutput> {
        event!(Level::INFO, command = %args.join(" "), "[dry-run] kubectl");
        Ok(Self::canned_output(args))
    }

    async fn kubectl_with_timeout(
        &self,
        args: &[String],
        _call_timeout: Duration,
    ) -> Result<CommandOutput> {
        self.kubectl(args).await
    }

    async fn kubectl_with_input(&self, args: &[String], _input: &str) -> Result<CommandOutput> {
        event!(Level::INFO, command = %args.join(" "), "[dry-run] kubectl with input");
        Ok(Self::canned_output(args))
    }

    async fn update_kubeconfig(
        &self,
        cluster: &ClusterIdentity,
        region: &str,
        _profile: Option<String>,
    ) -> Result<CommandOutput> {
        event!(Level::INFO, %cluster, region, "[dry-run] aws eks update-kubeconfig");
        Ok(CommandOutput::success(SIMULATED_OUTPUT))
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

pub mod command_error {
    use snafu::Snafu;
    use tokio::time::Duration;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Failed to run {} {:?}: {}", program, args.join(" "), source))]
        Spawn {
            program: String,
            args: Vec<String>,
            source: std::io::Error,
        },

        #[snafu(display("Failed to write stdin of {}: {}", program, source))]
        WriteStdin {
            program: String,
            source: std::io::Error,
        },

        #[snafu(display(
            "Command {:?} did not finish in the time allocated ({:.2}s)",
            args.join(" "),
            elapsed.as_secs_f64()
        ))]
        CommandTimeout { args: Vec<String>, elapsed: Duration },

        #[snafu(display("Command {:?} failed: {}", args.join(" "), stderr))]
        CommandFailed { args: Vec<String>, stderr: String },

        #[snafu(display("Unable to parse command output: {}", source))]
        ParseOutput { source: serde_json::Error },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_simulated_runner_answers_gets_with_empty_list() {
        let runner = SimulatedRunner::new();
        let output = runner
            .kubectl(&args(["get", "nodes", "-o", "json"]))
            .await
            .unwrap();
        assert!(output.success);
        let list: ResourceList<serde_json::Value> = output.json().unwrap();
        assert!(list.items.is_empty());

        let output = runner
            .kubectl(&args(["scale", "deployment", "x", "--replicas=0"]))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, SIMULATED_OUTPUT);
        assert!(runner.is_simulated());
    }

    #[test]
    fn test_not_found_detection() {
        let output = CommandOutput::failure(
            "Error from server (NotFound): deployments.apps \"cluster-autoscaler\" not found",
        );
        assert!(output.is_not_found());
        assert!(!CommandOutput::failure("connection refused").is_not_found());
        assert!(!CommandOutput::success("(NotFound)").is_not_found());
    }

    #[test]
    fn test_ensure_success_carries_stderr() {
        let err = CommandOutput::failure("boom\n")
            .ensure_success(&args(["cordon", "node-1"]))
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_kubeconfig_appended_to_kubectl_args() {
        let runner = KubectlRunner::new(Duration::from_secs(5))
            .with_kubeconfig(Some(PathBuf::from("/tmp/kubeconfig.yaml")));
        assert_eq!(
            runner.kubectl_args(&args(["get", "nodes"])),
            args(["get", "nodes", "--kubeconfig", "/tmp/kubeconfig.yaml"])
        );
    }
    fn shell_runner(call_timeout: Duration) -> KubectlRunner {
        KubectlRunner::new(call_timeout).with_binaries("sh", "aws")
    }

    #[tokio::test]
    async fn test_call_timeout_override() {
        let runner = shell_runner(Duration::from_millis(500));
        let slow = args(["-c", "sleep 2 && echo drained"]);

        let err = runner.kubectl(&slow).await.unwrap_err();
        assert!(matches!(err, command_error::Error::CommandTimeout { .. }));

        let output = runner
            .kubectl_with_timeout(&slow, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "drained");
    }

    #[tokio::test]
    async fn test_stdin_write_is_bounded_by_call_timeout() {
        let runner = shell_runner(Duration::from_millis(500));
        // Far more than a pipe buffer, to a child that never reads it.
        let input = "x".repeat(4 * 1024 * 1024);
        let started = std::time::Instant::now();

        let err = runner
            .kubectl_with_input(&args(["-c", "sleep 5"]), &input)
            .await
            .unwrap_err();
        assert!(matches!(err, command_error::Error::CommandTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
