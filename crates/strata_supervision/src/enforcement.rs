//! Declarative-state enforcement: replication repair and cluster shrinking.

use serde_json::Value;
use strata_agency::Node;

use crate::config::SupervisionConfig;
use crate::jobs::{
    self, AddFollower, CleanOutServer, RemoveFollower, Scheduler,
};
use crate::paths;

/// Compare planned against actual replication for every shard and schedule
/// follower jobs for the mismatches.
///
/// Clones (`distributeShardsLike`) follow their prototype and are skipped;
/// shards with an in-flight follower/move job or a block marker are left
/// alone.
pub fn enforce_replication(
    config: &SupervisionConfig,
    snapshot: &Node,
    scheduler: &mut Scheduler,
) {
    for (database, collections) in snapshot.children(paths::PLAN_COLLECTIONS) {
        for (collection, body) in jobs::object_entries(collections) {
            let Some(raw) = body.get("replicationFactor").and_then(Value::as_u64) else {
                tracing::warn!(
                    database = %database,
                    collection = %collection,
                    "collection has no replicationFactor; skipping enforcement"
                );
                continue;
            };
            if body.get("distributeShardsLike").is_some() {
                continue;
            }
            let desired = jobs::effective_replication(snapshot, raw);

            let Some(shards) = body.get("shards") else {
                continue;
            };
            for (shard, servers) in jobs::object_entries(shards) {
                let Some(servers) = jobs::string_array(servers) else {
                    tracing::warn!(shard = %shard, "planned shard is not a server list");
                    continue;
                };
                let actual = servers.len();
                if actual == desired {
                    continue;
                }
                if jobs::todo_targets_shard(snapshot, shard) {
                    tracing::debug!(
                        shard = %shard,
                        "follower or move job already queued; not scheduling again"
                    );
                    continue;
                }
                if jobs::shard_blocked(snapshot, shard) {
                    continue;
                }
                let Some(job_id) = scheduler.claim_job_id() else {
                    tracing::debug!("job id batch exhausted; deferring replication repair");
                    return;
                };
                let write = if actual < desired {
                    AddFollower::new(job_id, database, collection, shard)
                        .create_transaction(config, &servers)
                } else {
                    RemoveFollower::new(job_id, database, collection, shard)
                        .create_transaction(config, &servers)
                };
                match write {
                    Ok(write) => scheduler.submit_transaction(write),
                    Err(err) => {
                        tracing::error!(shard = %shard, error = %err, "follower job build failed");
                    }
                }
            }
        }
    }
}

/// When the operator lowered `/Target/NumberOfDBServers`, pick the
/// lexicographically largest available server and schedule a clean-out.
///
/// Low priority: runs only with both job queues empty, and never shrinks
/// below the largest replication factor in use or below two servers.
pub fn shrink_cluster(config: &SupervisionConfig, snapshot: &Node, scheduler: &mut Scheduler) {
    if !snapshot.children(paths::TARGET_TODO).is_empty()
        || !snapshot.children(paths::TARGET_PENDING).is_empty()
    {
        return;
    }

    let Some(target) = snapshot.uint_at(paths::TARGET_NUMBER_OF_DBSERVERS) else {
        tracing::trace!("targeted number of DB servers not set yet");
        return;
    };
    let target = target as usize;

    let mut available = jobs::available_servers(snapshot);
    if target >= available.len() {
        return;
    }
    if available.len() == 1 {
        tracing::debug!("only one DB server left; not shrinking");
        return;
    }

    let mut max_replication = 1u64;
    for (_, collections) in snapshot.children(paths::PLAN_COLLECTIONS) {
        for (collection, body) in jobs::object_entries(collections) {
            let Some(factor) = body.get("replicationFactor").and_then(Value::as_u64) else {
                tracing::warn!(
                    collection = %collection,
                    "cannot read replication factor; not shrinking"
                );
                return;
            };
            max_replication = max_replication.max(factor);
        }
    }

    if (max_replication as usize) < available.len() && available.len() > target {
        available.sort_unstable();
        let Some(victim) = available.last().cloned() else {
            return;
        };
        let Some(job_id) = scheduler.claim_job_id() else {
            tracing::debug!("job id batch exhausted; deferring cluster shrink");
            return;
        };
        match CleanOutServer::new(job_id, &victim).create_transaction(config) {
            Ok(write) => {
                tracing::info!(server = %victim, job_id, "scheduling clean-out to shrink cluster");
                scheduler.submit_transaction(write);
            }
            Err(err) => {
                tracing::error!(server = %victim, error = %err, "clean-out job build failed");
            }
        }
    }
}
