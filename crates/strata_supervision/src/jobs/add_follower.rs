//! AddFollower: raise a shard's actual replication to its planned factor.

use serde_json::{json, Value};
use strata_agency::{Node, TransactionBuilder, WriteTransaction};

use crate::config::SupervisionConfig;
use crate::paths;

use super::{
    effective_replication, follower_candidates, plan_shard_path, replication_factor,
    required_str, shard_blocked, string_array, terminal_transaction, JobCommon, JobState,
    Scheduler, StepOutcome,
};

#[derive(Clone, Debug, PartialEq)]
pub struct AddFollower {
    pub common: JobCommon,
    pub database: String,
    pub collection: String,
    pub shard: String,
}

impl AddFollower {
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
            "type": "addFollower",
            "database": self.database,
            "collection": self.collection,
            "shard": self.shard,
        });
        self.common
            .write_into(out.as_object_mut().expect("job serializes as object"));
        out
    }

    /// The enqueue transaction: the ToDo record, guarded by an unchanged
    /// plan for the shard and by the job slot being free.
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
            let reason = "addFollower has no pending phase";
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

        if planned.len() >= desired {
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

        let candidates = follower_candidates(snapshot, &planned);
        let Some(follower) = candidates.first() else {
            tracing::debug!(
                shard = %self.shard,
                "no healthy follower candidate available yet"
            );
            return Ok(StepOutcome::Unchanged);
        };

        let mut extended = planned.clone();
        extended.push(follower.clone());

        let mut builder = TransactionBuilder::new();
        builder
            .set(config.prefixed(&plan_path), json!(extended))
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
