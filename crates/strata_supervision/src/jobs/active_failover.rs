//! ActiveFailover: promote a replica when the leading single server fails.

use serde_json::{json, Value};
use strata_agency::{Node, TransactionBuilder, WriteTransaction};

use crate::config::SupervisionConfig;
use crate::health::{recorded_status, HealthStatus};
use crate::paths;

use super::{required_str, terminal_transaction, JobCommon, JobState, Scheduler, StepOutcome};

#[derive(Clone, Debug, PartialEq)]
pub struct ActiveFailover {
    pub common: JobCommon,
    pub server: String,
}

impl ActiveFailover {
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
            "type": "activeFailover",
            "server": self.server,
        });
        self.common
            .write_into(out.as_object_mut().expect("job serializes as object"));
        out
    }

    /// The enqueue transaction, merged by the caller into the same atomic
    /// unit as the health-status write.
    pub fn create_transaction(&self, config: &SupervisionConfig) -> anyhow::Result<WriteTransaction> {
        let todo_path = format!("{}/{}", paths::TARGET_TODO, self.common.id);
        let failed_path = format!("{}/{}", paths::TARGET_FAILED_SERVERS, self.server);
        let mut builder = TransactionBuilder::new();
        builder
            .set(config.prefixed(&todo_path), self.to_value())
            .set(config.prefixed(&failed_path), json!({}))
            .old_empty(
                config.prefixed(&format!("{}/{}", paths::PLAN_SINGLES, self.server)),
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
        if state != JobState::ToDo {
            let reason = "activeFailover has no pending phase";
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

        let candidate = snapshot
            .children(paths::PLAN_SINGLES)
            .keys()
            .filter(|id| *id != &self.server)
            .find(|id| recorded_status(snapshot, id) == Some(HealthStatus::Good))
            .cloned();
        let Some(candidate) = candidate else {
            let reason = "no healthy failover candidate";
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

        let leader_path = config.prefixed(paths::PLAN_ASYNC_REPLICATION_LEADER);
        let mut builder = TransactionBuilder::new();
        builder.set(&leader_path, json!(candidate));
        match snapshot.string_at(paths::PLAN_ASYNC_REPLICATION_LEADER) {
            Some(current) => {
                builder.eq(&leader_path, json!(current));
            }
            None => {
                builder.old_empty(&leader_path, true);
            }
        }
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
