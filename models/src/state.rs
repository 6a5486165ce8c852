/*!
  File-backed persistence of the configuration a cluster had before it was scaled down.

  Each cluster owns two files in the state directory:

  * `{cluster}_nodegroups.json`, an object keyed by node group name holding the original capacity.
  * `{cluster}_autoscaler.json`, a flat object describing the autoscaler and its original replicas.

  Every write rewrites the whole file through a temporary file and a rename, so a crash mid-write
  leaves the previous contents in place. There is no locking, so run one orchestration per cluster
  at a time.
!*/

use crate::capacity::{ClusterIdentity, NodeGroupCapacity};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{event, instrument, Level};

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, state_error::Error>;

const NODEGROUPS_SUFFIX: &str = "nodegroups";
const AUTOSCALER_SUFFIX: &str = "autoscaler";

lazy_static! {
    static ref UNSAFE_FILENAME_CHARS: Regex = Regex::new(r"[^A-Za-z0-9_.-]").unwrap();
}

/// A node group's capacity as captured immediately before scale-down.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRecord {
    #[serde(flatten)]
    pub capacity: NodeGroupCapacity,
    pub stored_at: DateTime<Utc>,
}

/// Locates the autoscaling workload of a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerRef {
    pub namespace: String,
    pub name: String,
}

impl AutoscalerRef {
    pub fn new<S: Into<String>>(namespace: S, name: S) -> Self {
        AutoscalerRef {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// The autoscaler snapshot taken when it was disabled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerRecord {
    #[serde(flatten)]
    pub autoscaler: AutoscalerRef,
    pub original_replicas: i32,
    pub stored_at: DateTime<Utc>,
}

pub type CapacityRecords = BTreeMap<String, CapacityRecord>;

#[derive(Clone, Debug)]
pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    pub fn new<P: Into<PathBuf>>(state_dir: P) -> Self {
        StateStore {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn path_for(&self, cluster: &ClusterIdentity, suffix: &str) -> PathBuf {
        let safe_name = UNSAFE_FILENAME_CHARS.replace_all(cluster.as_str(), "_");
        let file_name = format!("{}_{}.json", safe_name, suffix);
        self.state_dir.join(file_name)
    }

    #[instrument(skip(self, capacity), err)]
    pub fn store_capacity(
        &self,
        cluster: &ClusterIdentity,
        node_group: &str,
        capacity: NodeGroupCapacity,
    ) -> Result<()> {
        let path = self.path_for(cluster, NODEGROUPS_SUFFIX);
        let mut records: CapacityRecords = read_json(&path)?.unwrap_or_default();
        records.insert(
            node_group.to_string(),
            CapacityRecord {
                capacity,
                stored_at: Utc::now(),
            },
        );
        write_json(&path, &records)?;
        event!(Level::INFO, %capacity, "Stored original node group capacity.");
        Ok(())
    }

    pub fn get_capacity(
        &self,
        cluster: &ClusterIdentity,
        node_group: &str,
    ) -> Result<Option<NodeGroupCapacity>> {
        Ok(self
            .get_all_capacities(cluster)?
            .get(node_group)
            .map(|record| record.capacity))
    }

    pub fn get_all_capacities(&self, cluster: &ClusterIdentity) -> Result<CapacityRecords> {
        let records = read_json(&self.path_for(cluster, NODEGROUPS_SUFFIX))?;
        Ok(records.unwrap_or_default())
    }

    /// Removes one node group's record. The file itself goes away with the last record.
    #[instrument(skip(self), err)]
    pub fn delete_capacity(&self, cluster: &ClusterIdentity, node_group: &str) -> Result<()> {
        let path = self.path_for(cluster, NODEGROUPS_SUFFIX);
        let mut records: CapacityRecords = match read_json(&path)? {
            Some(records) => records,
            None => return Ok(()),
        };
        if records.remove(node_group).is_none() {
            return Ok(());
        }
        if records.is_empty() {
            remove_file(&path)
        } else {
            write_json(&path, &records)
        }
    }

    #[instrument(skip(self), err)]
    pub fn store_autoscaler(
        &self,
        cluster: &ClusterIdentity,
        autoscaler: &AutoscalerRef,
        original_replicas: i32,
    ) -> Result<()> {
        let record = AutoscalerRecord {
            autoscaler: autoscaler.clone(),
            original_replicas,
            stored_at: Utc::now(),
        };
        write_json(&self.path_for(cluster, AUTOSCALER_SUFFIX), &record)
    }

    pub fn get_autoscaler(&self, cluster: &ClusterIdentity) -> Result<Option<AutoscalerRecord>> {
        read_json(&self.path_for(cluster, AUTOSCALER_SUFFIX))
    }

    #[instrument(skip(self), err)]
    pub fn clear_autoscaler(&self, cluster: &ClusterIdentity) -> Result<()> {
        remove_file(&self.path_for(cluster, AUTOSCALER_SUFFIX))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).context(state_error::ReadStateSnafu { path })?;
    serde_json::from_str(&contents)
        .context(state_error::ParseStateSnafu { path })
        .map(Some)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .context(state_error::InvalidStatePathSnafu { path })?;
    fs::create_dir_all(dir).context(state_error::WriteStateSnafu { path: dir })?;

    let contents =
        serde_json::to_string_pretty(value).context(state_error::SerializeStateSnafu { path })?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents).context(state_error::WriteStateSnafu { path: &tmp_path })?;
    fs::rename(&tmp_path, path).context(state_error::WriteStateSnafu { path })
}

fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(state_error::WriteStateSnafu { path }),
    }
}

pub mod state_error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to read state file '{}': {}", path.display(), source))]
        ReadState {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("State file '{}' is corrupt: {}", path.display(), source))]
        ParseState {
            path: PathBuf,
            source: serde_json::Error,
        },

        #[snafu(display("Unable to serialize state for '{}': {}", path.display(), source))]
        SerializeState {
            path: PathBuf,
            source: serde_json::Error,
        },

        #[snafu(display("Unable to write state to '{}': {}", path.display(), source))]
        WriteState {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("State path '{}' has no parent directory", path.display()))]
        InvalidStatePath { path: PathBuf },
    }
}
