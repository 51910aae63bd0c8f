use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;

use crate::error::{Error, Result};

/// Top-level cluster description file. Everything the binary needs to
/// assemble a scheduler: inventory, partitions, licenses and tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDto {
    pub nodes: Vec<NodeDto>,
    pub partitions: Vec<PartitionDto>,
    #[serde(default)]
    pub licenses: String,
    #[serde(default)]
    pub hres_licenses: Vec<HresLicenseDto>,
    #[serde(default)]
    pub scheduler: SchedulerParamsDto,
    #[serde(default)]
    pub jobs: Vec<JobDto>,
}

impl ClusterDto {
    /// Load a cluster description from disk.
    ///
    /// Diagnostics are written for the operator editing the file: an
    /// empty file is reported as such rather than as a JSON syntax
    /// error, and an inventory that could never schedule anything (no
    /// nodes, no partitions, a partition without nodes, duplicate node
    /// names) is rejected before any table is built.
    pub fn load(path: &str) -> Result<ClusterDto> {
        let data = fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Err(Error::ModelConstructionError(format!("cluster file '{}' is empty", path)));
        }
        let dto: ClusterDto = serde_json::from_str(&data)?;
        dto.check(path)?;
        Ok(dto)
    }

    fn check(&self, path: &str) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::ModelConstructionError(format!("'{}' defines no nodes", path)));
        }
        if self.partitions.is_empty() {
            return Err(Error::ModelConstructionError(format!("'{}' defines no partitions", path)));
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for node in self.nodes.iter() {
            if !seen.insert(node.name.as_str()) {
                return Err(Error::ModelConstructionError(format!("'{}' defines node {} twice", path, node.name)));
            }
        }
        for part in self.partitions.iter() {
            if part.nodes.is_empty() {
                return Err(Error::ModelConstructionError(format!("'{}': partition {} has no nodes", path, part.name)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDto {
    pub name: String,
    #[serde(default = "default_one_u16")]
    pub cpus: u16,
    #[serde(default = "default_one_u16")]
    pub sockets: u16,
    #[serde(default = "default_one_u16")]
    pub cores_per_socket: u16,
    #[serde(default = "default_true")]
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionDto {
    pub name: String,
    #[serde(default = "default_one_u16")]
    pub priority_tier: u16,
    pub nodes: Vec<String>,
    #[serde(default = "default_one_u32")]
    pub min_nodes: u32,
    #[serde(default)]
    pub max_nodes: Option<u32>,
    #[serde(default)]
    pub max_time_secs: Option<i64>,
    /// "exclusive", "no", "force:N" or "yes:N".
    #[serde(default)]
    pub max_share: Option<String>,
    /// Comma-separated subset of: off, suspend, requeue, cancel, gang.
    #[serde(default)]
    pub preempt_mode: Option<String>,
    #[serde(default)]
    pub grace_time: u32,
    #[serde(default = "default_true")]
    pub state_up: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HresLicenseDto {
    pub name: String,
    pub nodes: Vec<String>,
    pub total: u32,
    /// 1 = exclusive selection, 2 = inclusive filter.
    pub mode: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerParamsDto {
    pub default_queue_depth: Option<u32>,
    pub partition_job_depth: Option<u32>,
    pub max_rpc_cnt: Option<u32>,
    pub max_sched_time: Option<i64>,
    pub sched_interval: Option<i64>,
    pub sched_max_job_start: Option<u32>,
    pub bf_min_age_reserve: Option<i64>,
    pub build_queue_timeout: Option<i64>,
    pub batch_sched_delay: Option<i64>,
    pub max_depend_depth: Option<u32>,
    pub sched_time_slice: Option<i64>,
    /// Gang evaluation granularity: "node", "socket", "core", "cpu", "cpu2".
    pub select_granularity: Option<String>,
    pub rpc_timeout: Option<i64>,
    pub complete_wait: Option<i64>,
    /// Free-form option string, e.g.
    /// "youngest_first,min_exempt_priority=100000,reclaim_licenses".
    pub preempt_params: Option<String>,
    /// Legacy option string; only "preempt_youngest_first" is honored.
    pub sched_params: Option<String>,
    pub wiki_compat: Option<bool>,
    pub preempt_send_user_signal: Option<bool>,
    pub prolog_path: Option<String>,
    pub epilog_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDto {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub user_id: u32,
    #[serde(default = "default_one_u32")]
    pub priority: u32,
    pub partition: String,
    #[serde(default)]
    pub alt_partitions: Vec<String>,
    #[serde(default = "default_one_u32")]
    pub min_nodes: u32,
    #[serde(default)]
    pub max_nodes: Option<u32>,
    #[serde(default)]
    pub licenses: Option<String>,
    #[serde(default)]
    pub dependency: Option<String>,
}

fn default_one_u16() -> u16 {
    1
}

fn default_one_u32() -> u32 {
    1
}

fn default_true() -> bool {
    true
}
