//! MoveShard: staged relocation of one shard replica between DB servers.
//!
//! The move is two-phase: the target joins the planned server list and the
//! shard is blocked (ToDo -> Pending), then once the target shows up in
//! `Current` the source is dropped and the shard unblocked (Pending ->
//! Finished).

use serde_json::{json, Value};
use strata_agency::{Node, TransactionBuilder, WriteTransaction};

use crate::config::SupervisionConfig;
use crate::paths;

use super::{
    plan_shard_path, required_str, string_array, terminal_transaction, JobCommon, JobState,
    Scheduler, StepOutcome,
};

#[derive(Clone, Debug, PartialEq)]
pub struct MoveShard {
    pub common: JobCommon,
    pub database: String,
    pub collection: String,
    pub shard: String,
    pub from_server: String,
    pub to_server: String,
}

impl MoveShard {
    pub fn new(
        id: u64,
        database: &str,
        collection: &str,
        shard: &str,
        from_server: &str,
        to_server: &str,
    ) -> Self {
        Self {
            common: JobCommon::new(id),
            database: database.to_string(),
            collection: collection.to_string(),
            shard: shard.to_string(),
            from_server: from_server.to_string(),
            to_server: to_server.to_string(),
        }
    }

    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        Ok(Self {
            common: JobCommon::from_value(value)?,
            database: required_str(value, "database")?,
            collection: required_str(value, "collection")?,
            shard: required_str(value, "shard")?,
            from_server: required_str(value, "fromServer")?,
            to_server: required_str(value, "toServer")?,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut out = json!({
            "type": "moveShard",
            "database": self.database,
            "collection": self.collection,
            "shard": self.shard,
            "fromServer": self.from_server,
            "toServer": self.to_server,
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

    fn blocked_path(&self, config: &SupervisionConfig) -> String {
        config.prefixed(&format!("{}/{}", paths::BLOCKED_SHARDS, self.shard))
    }

    fn current_servers(&self, snapshot: &Node) -> Option<Vec<String>> {
        snapshot
            .value_at(&format!(
                "{}/{}/{}/{}/servers",
                paths::CURRENT_COLLECTIONS, self.database, self.collection, self.shard
            ))
            .and_then(string_array)
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
            JobState::Pending => self.finish_when_synced(snapshot, config, scheduler),
            other => anyhow::bail!("moveShard found in terminal queue {other:?}"),
        }
    }

    fn start(
        &self,
        snapshot: &Node,
        config: &SupervisionConfig,
        scheduler: &mut Scheduler,
    ) -> anyhow::Result<StepOutcome> {
        let plan_path = plan_shard_path(&self.database, &self.collection, &self.shard);
        let Some(planned) = snapshot.value_at(&plan_path).and_then(string_array) else {
            let reason = "shard no longer planned";
            scheduler.submit_transaction(terminal_transaction(
                config,
                JobState::ToDo,
                self.to_value(),
                self.common.id,
                false,
                Some(reason),
            ));
            return Ok(StepOutcome::Failed(reason.to_string()));
        };

        if !planned.contains(&self.from_server) || planned.contains(&self.to_server) {
            let reason = "planned servers changed under the move";
            scheduler.submit_transaction(terminal_transaction(
                config,
                JobState::ToDo,
                self.to_value(),
                self.common.id,
                false,
                Some(reason),
            ));
            return Ok(StepOutcome::Failed(reason.to_string()));
        }

        let mut extended = planned.clone();
        extended.push(self.to_server.clone());

        let pending = format!("{}/{}", paths::TARGET_PENDING, self.common.id);
        let mut builder = TransactionBuilder::new();
        builder
            .set(config.prefixed(&plan_path), json!(extended))
            .increment(config.prefixed(paths::PLAN_VERSION), 1)
            .set(self.blocked_path(config), json!(self.common.id))
            .delete(config.prefixed(&format!("{}/{}", paths::TARGET_TODO, self.common.id)))
            .set(config.prefixed(&pending), self.to_value())
            .eq(config.prefixed(&plan_path), json!(planned))
            .old_empty(self.blocked_path(config), true);
        scheduler.submit_transaction(builder.build()?);
        Ok(StepOutcome::Advanced)
    }

    fn finish_when_synced(
        &self,
        snapshot: &Node,
        config: &SupervisionConfig,
        scheduler: &mut Scheduler,
    ) -> anyhow::Result<StepOutcome> {
        let plan_path = plan_shard_path(&self.database, &self.collection, &self.shard);
        let Some(planned) = snapshot.value_at(&plan_path).and_then(string_array) else {
            let reason = "shard no longer planned";
            let mut write = terminal_transaction(
                config,
                JobState::Pending,
                self.to_value(),
                self.common.id,
                false,
                Some(reason),
            );
            write.operations.push(strata_agency::Operation::Delete {
                path: self.blocked_path(config),
            });
            scheduler.submit_transaction(write);
            return Ok(StepOutcome::Failed(reason.to_string()));
        };

        let synced = self
            .current_servers(snapshot)
            .is_some_and(|servers| servers.contains(&self.to_server));
        if !synced {
            return Ok(StepOutcome::Unchanged);
        }

        let reduced: Vec<String> = planned
            .iter()
            .filter(|id| **id != self.from_server)
            .cloned()
            .collect();

        let mut builder = TransactionBuilder::new();
        builder
            .set(config.prefixed(&plan_path), json!(reduced))
            .increment(config.prefixed(paths::PLAN_VERSION), 1)
            .delete(self.blocked_path(config))
            .eq(config.prefixed(&plan_path), json!(planned));
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
        Ok(StepOutcome::Finished)
    }
}
