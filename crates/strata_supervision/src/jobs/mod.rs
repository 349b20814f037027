//! Reconfiguration jobs and the per-tick scheduler.
//!
//! A job is a unit of reconfiguration work owned by the supervisor. It is
//! created in `/Target/ToDo`, advanced at most one step per tick, and ends
//! as a record under `/Target/Finished` or `/Target/Failed`; the supervisor
//! never leaves dangling queue entries. All job writes are conditional, so a
//! lost race is a silent no-op recomputed on the next tick.

mod active_failover;
mod add_follower;
mod clean_out_server;
mod failed_server;
mod move_shard;
mod remove_follower;

pub use active_failover::ActiveFailover;
pub use add_follower::AddFollower;
pub use clean_out_server::CleanOutServer;
pub use failed_server::FailedServer;
pub use move_shard::MoveShard;
pub use remove_follower::RemoveFollower;

use chrono::Utc;
use serde_json::{json, Map, Value};
use strata_agency::{Envelope, Node, Operation, WriteTransaction};

use crate::config::SupervisionConfig;
use crate::health::{recorded_status, timestamp, HealthStatus};
use crate::paths;

/// Queue a job record lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    ToDo,
    Pending,
    Finished,
    Failed,
}

impl JobState {
    pub fn queue_prefix(self) -> &'static str {
        match self {
            JobState::ToDo => paths::TARGET_TODO,
            JobState::Pending => paths::TARGET_PENDING,
            JobState::Finished => paths::TARGET_FINISHED,
            JobState::Failed => paths::TARGET_FAILED,
        }
    }
}

/// Result of advancing a job one step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do yet; the job stays where it is.
    Unchanged,
    /// The job scheduled its move from ToDo to Pending.
    Advanced,
    /// The job scheduled its terminal transition to Finished.
    Finished,
    /// The job scheduled its terminal transition to Failed.
    Failed(String),
}

/// Fields shared by every job record.
#[derive(Clone, Debug, PartialEq)]
pub struct JobCommon {
    pub id: u64,
    pub creator: String,
    pub time_created: String,
}

impl JobCommon {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            creator: "supervision".to_string(),
            time_created: timestamp(Utc::now()),
        }
    }

    fn from_value(value: &Value) -> anyhow::Result<Self> {
        let id = value
            .get("jobId")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("job record without numeric jobId"))?;
        Ok(Self {
            id,
            creator: value
                .get("creator")
                .and_then(Value::as_str)
                .unwrap_or("supervision")
                .to_string(),
            time_created: value
                .get("timeCreated")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    fn write_into(&self, fields: &mut Map<String, Value>) {
        fields.insert("jobId".to_string(), json!(self.id));
        fields.insert("creator".to_string(), json!(self.creator));
        fields.insert("timeCreated".to_string(), json!(self.time_created));
    }
}

/// The tagged set of job kinds the supervisor knows how to advance.
#[derive(Clone, Debug, PartialEq)]
pub enum Job {
    FailedServer(FailedServer),
    ActiveFailover(ActiveFailover),
    AddFollower(AddFollower),
    RemoveFollower(RemoveFollower),
    MoveShard(MoveShard),
    CleanOutServer(CleanOutServer),
}

impl Job {
    pub fn from_value(value: &Value) -> anyhow::Result<Job> {
        let job_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("job record without type"))?;
        match job_type {
            "failedServer" => Ok(Job::FailedServer(FailedServer::from_value(value)?)),
            "activeFailover" => Ok(Job::ActiveFailover(ActiveFailover::from_value(value)?)),
            "addFollower" => Ok(Job::AddFollower(AddFollower::from_value(value)?)),
            "removeFollower" => Ok(Job::RemoveFollower(RemoveFollower::from_value(value)?)),
            "moveShard" => Ok(Job::MoveShard(MoveShard::from_value(value)?)),
            "cleanOutServer" => Ok(Job::CleanOutServer(CleanOutServer::from_value(value)?)),
            other => anyhow::bail!("unknown job type {other}"),
        }
    }

    pub fn job_id(&self) -> u64 {
        match self {
            Job::FailedServer(job) => job.common.id,
            Job::ActiveFailover(job) => job.common.id,
            Job::AddFollower(job) => job.common.id,
            Job::RemoveFollower(job) => job.common.id,
            Job::MoveShard(job) => job.common.id,
            Job::CleanOutServer(job) => job.common.id,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Job::FailedServer(job) => job.to_value(),
            Job::ActiveFailover(job) => job.to_value(),
            Job::AddFollower(job) => job.to_value(),
            Job::RemoveFollower(job) => job.to_value(),
            Job::MoveShard(job) => job.to_value(),
            Job::CleanOutServer(job) => job.to_value(),
        }
    }

    /// Advance the job one step from the queue it was found in.
    pub fn run(
        &self,
        state: JobState,
        snapshot: &Node,
        config: &SupervisionConfig,
        scheduler: &mut Scheduler,
    ) -> anyhow::Result<StepOutcome> {
        match self {
            Job::FailedServer(job) => job.run(state, snapshot, config, scheduler),
            Job::ActiveFailover(job) => job.run(state, snapshot, config, scheduler),
            Job::AddFollower(job) => job.run(state, snapshot, config, scheduler),
            Job::RemoveFollower(job) => job.run(state, snapshot, config, scheduler),
            Job::MoveShard(job) => job.run(state, snapshot, config, scheduler),
            Job::CleanOutServer(job) => job.run(state, snapshot, config, scheduler),
        }
    }
}

/// Accumulates the writes produced during one supervision tick and hands out
/// job ids from the batch reserved via `/Sync/LatestID`.
///
/// Ids are strictly increasing within a leader term; a claim from an
/// exhausted batch returns `None` and the next tick re-reserves.
#[derive(Debug, Default)]
pub struct Scheduler {
    next_job_id: u64,
    job_id_max: u64,
    envelopes: Vec<Envelope>,
}

impl Scheduler {
    pub fn new(next_job_id: u64, job_id_max: u64) -> Self {
        Self {
            next_job_id,
            job_id_max,
            envelopes: Vec::new(),
        }
    }

    pub fn claim_job_id(&mut self) -> Option<u64> {
        if self.next_job_id == 0 || self.next_job_id >= self.job_id_max {
            return None;
        }
        let id = self.next_job_id;
        self.next_job_id += 1;
        Some(id)
    }

    /// Where the id cursor ended up after this tick's claims.
    pub fn cursor(&self) -> u64 {
        self.next_job_id
    }

    pub fn submit(&mut self, envelope: Envelope) {
        self.envelopes.push(envelope);
    }

    pub fn submit_transaction(&mut self, write: WriteTransaction) {
        self.envelopes.push(Envelope::of_write(write));
    }

    pub fn take_envelopes(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.envelopes)
    }
}

/// Run one step of every queued job, ToDo first, then Pending, in key order.
pub fn work_jobs(config: &SupervisionConfig, snapshot: &Node, scheduler: &mut Scheduler) {
    for state in [JobState::ToDo, JobState::Pending] {
        for (key, value) in snapshot.children(state.queue_prefix()) {
            let job = match Job::from_value(value) {
                Ok(job) => job,
                Err(err) => {
                    tracing::warn!(job = %key, error = %err, "skipping unparsable job record");
                    continue;
                }
            };
            match job.run(state, snapshot, config, scheduler) {
                Ok(outcome) => {
                    tracing::debug!(job = %key, ?state, ?outcome, "job step");
                }
                Err(err) => {
                    tracing::error!(job = %key, ?state, error = %err, "job step failed");
                }
            }
        }
    }
}

/// Servers that can receive new responsibilities: planned DB servers minus
/// known-failed ones and minus servers being (or already) cleaned out.
pub fn available_servers(snapshot: &Node) -> Vec<String> {
    let failed = snapshot.children(paths::TARGET_FAILED_SERVERS);
    let to_be_cleaned = snapshot.children(paths::TARGET_TO_BE_CLEANED);
    let cleaned = snapshot.children(paths::TARGET_CLEANED);
    snapshot
        .children(paths::PLAN_DBSERVERS)
        .keys()
        .filter(|id| {
            !failed.contains_key(*id)
                && !to_be_cleaned.contains_key(*id)
                && !cleaned.contains_key(*id)
        })
        .cloned()
        .collect()
}

/// Available servers currently in GOOD health, excluding `exclude`.
pub(crate) fn follower_candidates(snapshot: &Node, exclude: &[String]) -> Vec<String> {
    available_servers(snapshot)
        .into_iter()
        .filter(|id| !exclude.contains(id))
        .filter(|id| recorded_status(snapshot, id) == Some(HealthStatus::Good))
        .collect()
}

/// Whether a ToDo job already targets `shard` with a plan-shape change.
pub(crate) fn todo_targets_shard(snapshot: &Node, shard: &str) -> bool {
    snapshot
        .children(paths::TARGET_TODO)
        .values()
        .any(|job| {
            let job_type = job.get("type").and_then(Value::as_str).unwrap_or("");
            matches!(job_type, "addFollower" | "removeFollower" | "moveShard")
                && job.get("shard").and_then(Value::as_str) == Some(shard)
        })
}

/// Whether `shard` carries a block marker.
pub(crate) fn shard_blocked(snapshot: &Node, shard: &str) -> bool {
    snapshot.has(&format!("{}/{shard}", paths::BLOCKED_SHARDS))
        || snapshot.has(&format!("{}/{shard}", paths::BLOCKED_SERVERS))
}

pub(crate) fn server_blocked(snapshot: &Node, server: &str) -> bool {
    snapshot.has(&format!("{}/{server}", paths::BLOCKED_SERVERS))
}

/// A planned shard with its current server assignment.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PlannedShard {
    pub database: String,
    pub collection: String,
    pub shard: String,
    pub servers: Vec<String>,
}

impl PlannedShard {
    pub fn plan_path(&self) -> String {
        plan_shard_path(&self.database, &self.collection, &self.shard)
    }
}

pub(crate) fn plan_shard_path(database: &str, collection: &str, shard: &str) -> String {
    format!(
        "{}/{database}/{collection}/shards/{shard}",
        paths::PLAN_COLLECTIONS
    )
}

pub(crate) fn required_str(value: &Value, key: &str) -> anyhow::Result<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("job record without {key}"))
}

pub(crate) fn object_entries(value: &Value) -> impl Iterator<Item = (&String, &Value)> {
    value.as_object().into_iter().flat_map(|map| map.iter())
}

pub(crate) fn string_array(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(item.as_str()?.to_string());
    }
    Some(out)
}

/// Every planned shard in the snapshot, database/collection/shard key order.
pub(crate) fn planned_shards(snapshot: &Node) -> Vec<PlannedShard> {
    let mut out = Vec::new();
    for (database, collections) in snapshot.children(paths::PLAN_COLLECTIONS) {
        for (collection, body) in object_entries(collections) {
            let Some(shards) = body.get("shards") else {
                continue;
            };
            for (shard, servers) in object_entries(shards) {
                let Some(servers) = string_array(servers) else {
                    continue;
                };
                out.push(PlannedShard {
                    database: database.clone(),
                    collection: collection.clone(),
                    shard: shard.clone(),
                    servers,
                });
            }
        }
    }
    out
}

pub(crate) fn replication_factor(snapshot: &Node, database: &str, collection: &str) -> Option<u64> {
    snapshot.uint_at(&format!(
        "{}/{database}/{collection}/replicationFactor",
        paths::PLAN_COLLECTIONS
    ))
}

/// The effective replication target; `0` means satellite, replicate to every
/// available server.
pub(crate) fn effective_replication(snapshot: &Node, raw: u64) -> usize {
    if raw == 0 {
        available_servers(snapshot).len()
    } else {
        raw as usize
    }
}

/// Delete the queue entry and write the terminal record in one atomic unit.
pub(crate) fn terminal_transaction(
    config: &SupervisionConfig,
    from: JobState,
    record: Value,
    id: u64,
    success: bool,
    reason: Option<&str>,
) -> WriteTransaction {
    let mut record = record;
    if let Some(fields) = record.as_object_mut() {
        fields.insert("timeFinished".to_string(), json!(timestamp(Utc::now())));
        if let Some(reason) = reason {
            fields.insert("reason".to_string(), json!(reason));
        }
    }
    let target = if success {
        JobState::Finished
    } else {
        JobState::Failed
    };
    WriteTransaction {
        operations: vec![
            Operation::Delete {
                path: config.prefixed(&format!("{}/{id}", from.queue_prefix())),
            },
            Operation::Set {
                path: config.prefixed(&format!("{}/{id}", target.queue_prefix())),
                value: record,
            },
        ],
        preconditions: Vec::new(),
    }
}
