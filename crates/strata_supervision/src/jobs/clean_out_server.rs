//! CleanOutServer: drain every shard replica off one DB server.
//!
//! Starting blocks the server and records it under
//! `/Target/ToBeCleanedServers`; while pending, the job keeps scheduling
//! `MoveShard` children for shards still on the server, one wave per tick,
//! and finishes once the server holds nothing.

use serde_json::{json, Value};
use strata_agency::{Node, TransactionBuilder, WriteTransaction};

use crate::config::SupervisionConfig;
use crate::paths;

use super::{
    follower_candidates, planned_shards, required_str, server_blocked, shard_blocked,
    terminal_transaction, todo_targets_shard, JobCommon, JobState, MoveShard, Scheduler,
    StepOutcome,
};

#[derive(Clone, Debug, PartialEq)]
pub struct CleanOutServer {
    pub common: JobCommon,
    pub server: String,
}

impl CleanOutServer {
    pub fn new(id: u64, server: &str) -> Self {
        Self {
            common: JobCommon::new(id),
            server: server.to_string(),
        }
    }

    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        Ok(Self {
            common: JobCommon::from_value(value)?,
            server: required_str(value, "server")?,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut out = json!({
            "type": "cleanOutServer",
            "server": self.server,
        });
        self.common
            .write_into(out.as_object_mut().expect("job serializes as object"));
        out
    }

    pub fn create_transaction(&self, config: &SupervisionConfig) -> anyhow::Result<WriteTransaction> {
        let todo_path = format!("{}/{}", paths::TARGET_TODO, self.common.id);
        let mut builder = TransactionBuilder::new();
        builder
            .set(config.prefixed(&todo_path), self.to_value())
            .old_empty(config.prefixed(&todo_path), true)
            .old_empty(
                config.prefixed(&format!("{}/{}", paths::PLAN_DBSERVERS, self.server)),
                false,
            )
            .old_empty(
                config.prefixed(&format!("{}/{}", paths::BLOCKED_SERVERS, self.server)),
                true,
            );
        Ok(builder.build()?)
    }

    fn blocked_path(&self, config: &SupervisionConfig) -> String {
        config.prefixed(&format!("{}/{}", paths::BLOCKED_SERVERS, self.server))
    }

    pub(crate) fn run(
        &self,
        state: JobState,
        snapshot: &Node,
        config: &SupervisionConfig,
        scheduler: &mut Scheduler,
    ) -> anyhow::Result<StepOutcome> {
        match state {
            JobState::ToDo => self.start(snapshot, config, scheduler),
            JobState::Pending => self.drain(snapshot, config, scheduler),
            other => anyhow::bail!("cleanOutServer found in terminal queue {other:?}"),
        }
    }

    fn start(
        &self,
        snapshot: &Node,
        config: &SupervisionConfig,
        scheduler: &mut Scheduler,
    ) -> anyhow::Result<StepOutcome> {
        if server_blocked(snapshot, &self.server) {
            return Ok(StepOutcome::Unchanged);
        }

        let pending = format!("{}/{}", paths::TARGET_PENDING, self.common.id);
        let mut builder = TransactionBuilder::new();
        builder
            .set(self.blocked_path(config), json!(self.common.id))
            .set(
                config.prefixed(&format!("{}/{}", paths::TARGET_TO_BE_CLEANED, self.server)),
                json!({}),
            )
            .delete(config.prefixed(&format!("{}/{}", paths::TARGET_TODO, self.common.id)))
            .set(config.prefixed(&pending), self.to_value())
            .old_empty(self.blocked_path(config), true);
        scheduler.submit_transaction(builder.build()?);
        Ok(StepOutcome::Advanced)
    }

    fn drain(
        &self,
        snapshot: &Node,
        config: &SupervisionConfig,
        scheduler: &mut Scheduler,
    ) -> anyhow::Result<StepOutcome> {
        let holding: Vec<_> = planned_shards(snapshot)
            .into_iter()
            .filter(|shard| shard.servers.contains(&self.server))
            .collect();

        if holding.is_empty() {
            let mut builder = TransactionBuilder::new();
            builder
                .delete(self.blocked_path(config))
                .delete(
                    config.prefixed(&format!("{}/{}", paths::TARGET_TO_BE_CLEANED, self.server)),
                )
                .set(
                    config.prefixed(&format!("{}/{}", paths::TARGET_CLEANED, self.server)),
                    json!({}),
                );
            let mut write = builder.build()?;
            write.merge(terminal_transaction(
                config,
                JobState::Pending,
                self.to_value(),
                self.common.id,
                true,
                None,
            ));
            scheduler.submit_transaction(write);
            return Ok(StepOutcome::Finished);
        }

        for shard in holding {
            if todo_targets_shard(snapshot, &shard.shard) || shard_blocked(snapshot, &shard.shard)
            {
                continue;
            }
            let candidates = follower_candidates(snapshot, &shard.servers);
            let Some(target) = candidates.first() else {
                tracing::debug!(
                    server = %self.server,
                    shard = %shard.shard,
                    "no destination for clean-out move yet"
                );
                continue;
            };
            let Some(child_id) = scheduler.claim_job_id() else {
                tracing::debug!("job id batch exhausted; deferring clean-out children");
                break;
            };
            let child = MoveShard::new(
                child_id,
                &shard.database,
                &shard.collection,
                &shard.shard,
                &self.server,
                target,
            );
            scheduler.submit_transaction(child.create_transaction(config, &shard.servers)?);
        }
        Ok(StepOutcome::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Node {
        Node::from_value(json!({
            "Plan": {
                "DBServers": { "PRMR-a": "none", "PRMR-b": "none", "PRMR-c": "none" },
                "Collections": {
                    "db1": {
                        "coll1": {
                            "replicationFactor": 2,
                            "shards": {
                                "s1": ["PRMR-c", "PRMR-a"],
                                "s2": ["PRMR-a", "PRMR-b"],
                            },
                        },
                    },
                },
            },
            "Supervision": {
                "Health": {
                    "PRMR-a": { "Status": "GOOD" },
                    "PRMR-b": { "Status": "GOOD" },
                    "PRMR-c": { "Status": "GOOD" },
                },
            },
        }))
    }

    #[test]
    fn start_blocks_server_and_goes_pending() {
        let config = SupervisionConfig::default();
        let job = CleanOutServer::new(41, "PRMR-c");
        let mut scheduler = Scheduler::new(42, 10_000);
        let outcome = job
            .run(JobState::ToDo, &snapshot(), &config, &mut scheduler)
            .unwrap();
        assert_eq!(outcome, StepOutcome::Advanced);

        let wire = scheduler.take_envelopes()[0].to_wire();
        let ops = &wire[0][0];
        assert_eq!(ops["/strata/Supervision/DBServers/PRMR-c"]["new"], json!(41));
        assert!(ops["/strata/Target/ToBeCleanedServers/PRMR-c"]["new"].is_object());
        assert!(ops["/strata/Target/Pending/41"]["new"].is_object());
    }

    #[test]
    fn drain_schedules_move_children_for_held_shards() {
        let config = SupervisionConfig::default();
        let job = CleanOutServer::new(41, "PRMR-c");
        let mut scheduler = Scheduler::new(42, 10_000);
        let outcome = job
            .run(JobState::Pending, &snapshot(), &config, &mut scheduler)
            .unwrap();
        assert_eq!(outcome, StepOutcome::Unchanged);

        // Only s1 holds PRMR-c; one child move away from it.
        let envelopes = scheduler.take_envelopes();
        assert_eq!(envelopes.len(), 1);
        let wire = envelopes[0].to_wire();
        let record = &wire[0][0]["/strata/Target/ToDo/42"]["new"];
        assert_eq!(record["type"], json!("moveShard"));
        assert_eq!(record["fromServer"], json!("PRMR-c"));
        assert_eq!(record["toServer"], json!("PRMR-b"));
    }

    #[test]
    fn drain_finishes_once_server_is_empty() {
        let mut raw = snapshot().into_value();
        raw["Plan"]["Collections"]["db1"]["coll1"]["shards"]["s1"] = json!(["PRMR-b", "PRMR-a"]);
        let snapshot = Node::from_value(raw);

        let config = SupervisionConfig::default();
        let job = CleanOutServer::new(41, "PRMR-c");
        let mut scheduler = Scheduler::new(42, 10_000);
        let outcome = job
            .run(JobState::Pending, &snapshot, &config, &mut scheduler)
            .unwrap();
        assert_eq!(outcome, StepOutcome::Finished);

        let wire = scheduler.take_envelopes()[0].to_wire();
        let ops = &wire[0][0];
        assert_eq!(ops["/strata/Supervision/DBServers/PRMR-c"]["op"], json!("delete"));
        assert!(ops["/strata/Target/CleanedServers/PRMR-c"]["new"].is_object());
        assert!(ops["/strata/Target/Finished/41"]["new"].is_object());
    }
}
