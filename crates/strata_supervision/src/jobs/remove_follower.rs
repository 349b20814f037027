//! RemoveFollower: shed excess replicas from an over-replicated shard.

use serde_json::{json, Value};
use strata_agency::{Node, TransactionBuilder, WriteTransaction};

use crate::config::SupervisionConfig;
use crate::health::{recorded_status, HealthStatus};
use crate::paths;

use super::{
    effective_replication, plan_shard_path, replication_factor, required_str, shard_blocked,
    string_array, terminal_transaction, JobCommon, JobState, Scheduler, StepOutcome,
};

#[derive(Clone, Debug, PartialEq)]
pub struct RemoveFollower {
    pub common: JobCommon,
    pub database: String,
    pub collection: String,
    pub shard: String,
}

impl RemoveFollower {
    pub fn new(id: u64, database: &str, collection: &str, shard: &str) -> Self {
        Self {
            common: JobCommon::new(id),
            database: database.to_string(),
            collection: collection.to_string(),
            shard: shard.to_string(),
        }
    }

    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        Ok(Self {
            common: JobCommon::from_value(value)?,
            database: required_str(value, "database")?,
            collection: required_str(value, "collection")?,
            shard: required_str(value, "shard")?,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut out = json!({
            "type": "removeFollower",
            "database": self.database,
            "collection": self.collection,
            "shard": self.shard,
        });
        self.common
            .write_into(out.as_object_mut().expect("job serializes as object"));
        out
    }

    pub fn create_transaction(
        &self,
        config: &SupervisionConfig,
        planned: &[String],
    ) -> anyhow::Result<WriteTransaction> {
        let plan_path = plan_shard_path(&self.database, &self.collection, &self.shard);
        let todo_path = format!("{}/{}", paths::TARGET_TODO, self.common.id);
        let mut builder = TransactionBuilder::new();
        builder
            .set(config.prefixed(&todo_path), self.to_value())
            .old_empty(config.prefixed(&todo_path), true)
            .eq(config.prefixed(&plan_path), json!(planned))
            .old_empty(
                config.prefixed(&format!("{}/{}", paths::BLOCKED_SHARDS, self.shard)),
                true,
            );
        Ok(builder.build()?)
    }

    pub(crate) fn run(
        &self,
        state: JobState,
        snapshot: &Node,
        config: &SupervisionConfig,
        scheduler: &mut Scheduler,
    ) -> anyhow::Result<StepOutcome> {
        if state != JobState::ToDo {
            let reason = "removeFollower has no pending phase";
            scheduler.submit_transaction(terminal_transaction(
                config,
                state,
                self.to_value(),
                self.common.id,
                false,
                Some(reason),
            ));
            return Ok(StepOutcome::Failed(reason.to_string()));
        }

        let plan_path = plan_shard_path(&self.database, &self.collection, &self.shard);
        let Some(planned) = snapshot.value_at(&plan_path).and_then(string_array) else {
            let reason = "shard no longer planned";
            scheduler.submit_transaction(terminal_transaction(
                config,
                state,
                self.to_value(),
                self.common.id,
                false,
                Some(reason),
            ));
            return Ok(StepOutcome::Failed(reason.to_string()));
        };

        let Some(raw) = replication_factor(snapshot, &self.database, &self.collection) else {
            anyhow::bail!(
                "collection {}/{} has no replicationFactor",
                self.database,
                self.collection
            );
        };
        let desired = effective_replication(snapshot, raw);

        if planned.len() <= desired {
            scheduler.submit_transaction(terminal_transaction(
                config,
                state,
                self.to_value(),
                self.common.id,
                true,
                Some("replication already satisfied"),
            ));
            return Ok(StepOutcome::Finished);
        }

        if shard_blocked(snapshot, &self.shard) {
            return Ok(StepOutcome::Unchanged);
        }

        // Never remove the leader. Prefer shedding an unhealthy follower,
        // otherwise the last one in the list.
        let followers = &planned[1..];
        let victim = followers
            .iter()
            .find(|id| recorded_status(snapshot, id) != Some(HealthStatus::Good))
            .or_else(|| followers.last())
            .cloned();
        let Some(victim) = victim else {
            return Ok(StepOutcome::Unchanged);
        };

        let reduced: Vec<String> = planned.iter().filter(|id| **id != victim).cloned().collect();

        let mut builder = TransactionBuilder::new();
        builder
            .set(config.prefixed(&plan_path), json!(reduced))
            .increment(config.prefixed(paths::PLAN_VERSION), 1)
            .eq(config.prefixed(&plan_path), json!(planned))
            .old_empty(
                config.prefixed(&format!("{}/{}", paths::BLOCKED_SHARDS, self.shard)),
                true,
            );
        let mut write = builder.build()?;
        write.merge(terminal_transaction(
            config,
            state,
            self.to_value(),
            self.common.id,
            true,
            None,
        ));
        scheduler.submit_transaction(write);
        Ok(StepOutcome::Finished)
    }
}
