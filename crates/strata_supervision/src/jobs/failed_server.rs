//! FailedServer: react to a DB server that stayed FAILED past the grace
//! period.
//!
//! Creation registers the server under `/Target/FailedServers` in the same
//! atomic unit as the health transition that triggered it. Starting rotates
//! planned shard leadership away from the failed server; the job finishes
//! once it leads nothing. Followers on the failed server are left in place
//! so they can resync if the server returns; replication repair picks up
//! the slack independently.

use serde_json::{json, Value};
use strata_agency::{Node, Operation, Precondition, TransactionBuilder, WriteTransaction};

use crate::config::SupervisionConfig;
use crate::health::{recorded_status, HealthStatus};
use crate::paths;

use super::{
    planned_shards, required_str, terminal_transaction, JobCommon, JobState, PlannedShard,
    Scheduler, StepOutcome,
};

#[derive(Clone, Debug, PartialEq)]
pub struct FailedServer {
    pub common: JobCommon,
    pub server: String,
}

impl FailedServer {
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
            "type": "failedServer",
            "server": self.server,
        });
        self.common
            .write_into(out.as_object_mut().expect("job serializes as object"));
        out
    }

    /// The enqueue transaction, merged by the caller into the same atomic
    /// unit as the health-status write: registers the failure and creates
    /// the ToDo record, guarded by the server still being planned and no
    /// failure being registered yet.
    pub fn create_transaction(&self, config: &SupervisionConfig) -> anyhow::Result<WriteTransaction> {
        let todo_path = format!("{}/{}", paths::TARGET_TODO, self.common.id);
        let failed_path = format!("{}/{}", paths::TARGET_FAILED_SERVERS, self.server);
        let mut builder = TransactionBuilder::new();
        builder
            .set(config.prefixed(&todo_path), self.to_value())
            .set(config.prefixed(&failed_path), json!({}))
            .old_empty(
                config.prefixed(&format!("{}/{}", paths::PLAN_DBSERVERS, self.server)),
                false,
            )
            .old_empty(config.prefixed(&failed_path), true)
            .old_empty(config.prefixed(&todo_path), true);
        Ok(builder.build()?)
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
            JobState::Pending => self.finish_when_demoted(snapshot, config, scheduler),
            other => anyhow::bail!("failedServer found in terminal queue {other:?}"),
        }
    }

    fn led_shards(&self, snapshot: &Node) -> Vec<PlannedShard> {
        planned_shards(snapshot)
            .into_iter()
            .filter(|shard| shard.servers.first() == Some(&self.server))
            .collect()
    }

    fn start(
        &self,
        snapshot: &Node,
        config: &SupervisionConfig,
        scheduler: &mut Scheduler,
    ) -> anyhow::Result<StepOutcome> {
        let led = self.led_shards(snapshot);
        if led.is_empty() {
            scheduler.submit_transaction(terminal_transaction(
                config,
                JobState::ToDo,
                self.to_value(),
                self.common.id,
                true,
                Some("server led no shards"),
            ));
            return Ok(StepOutcome::Finished);
        }

        let mut operations = Vec::new();
        let mut preconditions = Vec::new();
        let mut rotated = false;
        for shard in &led {
            let Some(successor) = shard.servers[1..]
                .iter()
                .find(|id| recorded_status(snapshot, id) != Some(HealthStatus::Failed))
            else {
                tracing::debug!(
                    server = %self.server,
                    shard = %shard.shard,
                    "no surviving follower to promote"
                );
                continue;
            };
            // Promoted follower leads; the failed leader drops to the tail so
            // it can resync as a follower if it comes back.
            let mut reordered = vec![successor.clone()];
            reordered.extend(
                shard
                    .servers
                    .iter()
                    .filter(|id| *id != successor && **id != self.server)
                    .cloned(),
            );
            reordered.push(self.server.clone());

            let path = config.prefixed(&shard.plan_path());
            operations.push(Operation::Set {
                path: path.clone(),
                value: json!(reordered),
            });
            preconditions.push(Precondition::Old {
                path,
                value: json!(shard.servers),
            });
            rotated = true;
        }

        if !rotated {
            // Every led shard lacks a live follower; retry next tick.
            return Ok(StepOutcome::Unchanged);
        }

        operations.push(Operation::Increment {
            path: config.prefixed(paths::PLAN_VERSION),
            step: 1,
        });
        operations.push(Operation::Delete {
            path: config.prefixed(&format!("{}/{}", paths::TARGET_TODO, self.common.id)),
        });
        operations.push(Operation::Set {
            path: config.prefixed(&format!("{}/{}", paths::TARGET_PENDING, self.common.id)),
            value: self.to_value(),
        });
        scheduler.submit_transaction(WriteTransaction {
            operations,
            preconditions,
        });
        Ok(StepOutcome::Advanced)
    }

    fn finish_when_demoted(
        &self,
        snapshot: &Node,
        config: &SupervisionConfig,
        scheduler: &mut Scheduler,
    ) -> anyhow::Result<StepOutcome> {
        if !self.led_shards(snapshot).is_empty() {
            return Ok(StepOutcome::Unchanged);
        }
        scheduler.submit_transaction(terminal_transaction(
            config,
            JobState::Pending,
            self.to_value(),
            self.common.id,
            true,
            None,
        ));
        Ok(StepOutcome::Finished)
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
                                "s1": ["PRMR-a", "PRMR-b", "PRMR-c"],
                                "s2": ["PRMR-b", "PRMR-a"],
                            },
                        },
                    },
                },
            },
            "Supervision": {
                "Health": {
                    "PRMR-a": { "Status": "FAILED" },
                    "PRMR-b": { "Status": "GOOD" },
                    "PRMR-c": { "Status": "GOOD" },
                },
            },
        }))
    }

    #[test]
    fn create_registers_failure_and_guards() {
        let config = SupervisionConfig::default();
        let job = FailedServer::new(51, "PRMR-a");
        let write = job.create_transaction(&config).unwrap();
        assert_eq!(write.operations.len(), 2);
        assert_eq!(write.preconditions.len(), 3);
        let wire = strata_agency::Envelope::of_write(write).to_wire();
        assert!(wire[0][0]["/strata/Target/FailedServers/PRMR-a"]["new"].is_object());
        assert_eq!(
            wire[0][1]["/strata/Target/FailedServers/PRMR-a"],
            json!({ "oldEmpty": true })
        );
    }

    #[test]
    fn start_promotes_first_live_follower() {
        let config = SupervisionConfig::default();
        let job = FailedServer::new(51, "PRMR-a");
        let mut scheduler = Scheduler::new(52, 10_000);
        let outcome = job
            .run(JobState::ToDo, &snapshot(), &config, &mut scheduler)
            .unwrap();
        assert_eq!(outcome, StepOutcome::Advanced);

        let wire = scheduler.take_envelopes()[0].to_wire();
        let ops = &wire[0][0];
        // s1 was led by the failed server: promote b, keep c, demote a.
        assert_eq!(
            ops["/strata/Plan/Collections/db1/coll1/shards/s1"]["new"],
            json!(["PRMR-b", "PRMR-c", "PRMR-a"])
        );
        // s2 was not led by it and stays untouched.
        assert!(ops
            .get("/strata/Plan/Collections/db1/coll1/shards/s2")
            .is_none());
        assert!(ops["/strata/Target/Pending/51"]["new"].is_object());
    }

    #[test]
    fn start_finishes_directly_when_nothing_is_led() {
        let config = SupervisionConfig::default();
        let job = FailedServer::new(51, "PRMR-c");
        let mut scheduler = Scheduler::new(52, 10_000);
        let outcome = job
            .run(JobState::ToDo, &snapshot(), &config, &mut scheduler)
            .unwrap();
        assert_eq!(outcome, StepOutcome::Finished);
    }

    #[test]
    fn pending_finishes_once_leadership_moved() {
        let mut raw = snapshot().into_value();
        raw["Plan"]["Collections"]["db1"]["coll1"]["shards"]["s1"] =
            json!(["PRMR-b", "PRMR-c", "PRMR-a"]);
        let snapshot = Node::from_value(raw);

        let config = SupervisionConfig::default();
        let job = FailedServer::new(51, "PRMR-a");
        let mut scheduler = Scheduler::new(52, 10_000);
        let outcome = job
            .run(JobState::Pending, &snapshot, &config, &mut scheduler)
            .unwrap();
        assert_eq!(outcome, StepOutcome::Finished);
        let wire = scheduler.take_envelopes()[0].to_wire();
        assert!(wire[0][0]["/strata/Target/Finished/51"]["new"].is_object());
    }

    #[test]
    fn waits_when_no_follower_survives() {
        let mut raw = snapshot().into_value();
        raw["Supervision"]["Health"]["PRMR-b"]["Status"] = json!("FAILED");
        raw["Supervision"]["Health"]["PRMR-c"]["Status"] = json!("FAILED");
        let snapshot = Node::from_value(raw);

        let config = SupervisionConfig::default();
        let job = FailedServer::new(51, "PRMR-a");
        let mut scheduler = Scheduler::new(52, 10_000);
        let outcome = job
            .run(JobState::ToDo, &snapshot, &config, &mut scheduler)
            .unwrap();
        assert_eq!(outcome, StepOutcome::Unchanged);
        assert!(scheduler.take_envelopes().is_empty());
    }
}
