//! In-memory agency agent.
//!
//! Applies write envelopes against a committed tree and a leader-local
//! transient tree with full precondition semantics. This is the substrate
//! for the integration test suites and for embedding the supervisor in a
//! single-process harness; leadership is scriptable.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::client::{Agent, WriteResult};
use crate::error::AgencyError;
use crate::node::{normalize_path, Node};
use crate::transaction::{Envelope, Operation, Precondition, Transaction, WriteTransaction};

struct Inner {
    committed: Value,
    transient: Value,
    commit_index: u64,
    leader: bool,
    leader_since: Option<Instant>,
    prepare_done: bool,
}

/// A single-node agency living entirely in process memory.
pub struct MemoryAgent {
    inner: Mutex<Inner>,
}

impl Default for MemoryAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAgent {
    /// A fresh agent holding empty trees; not leading.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                committed: Value::Object(Map::new()),
                transient: Value::Object(Map::new()),
                commit_index: 0,
                leader: false,
                leader_since: None,
                prepare_done: false,
            }),
        }
    }

    /// A fresh agent that already leads with finished preparation, as if it
    /// had held leadership for `held_for`.
    pub fn leading(held_for: Duration) -> Self {
        let agent = Self::new();
        agent.set_leader_for(held_for);
        agent.set_prepare_leadership_done(true);
        agent
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory agent lock poisoned")
    }

    pub fn set_leader(&self, leader: bool) {
        let mut inner = self.lock();
        inner.leader = leader;
        inner.leader_since = leader.then(Instant::now);
    }

    /// Mark the agent as leading since `held_for` ago.
    pub fn set_leader_for(&self, held_for: Duration) {
        let mut inner = self.lock();
        inner.leader = true;
        let now = Instant::now();
        inner.leader_since = Some(now.checked_sub(held_for).unwrap_or(now));
    }

    pub fn set_prepare_leadership_done(&self, done: bool) {
        self.lock().prepare_done = done;
    }

    /// Seed the committed tree directly, bypassing the envelope machinery.
    pub fn write_committed(&self, path: &str, value: Value) {
        let mut inner = self.lock();
        *entry(&mut inner.committed, path) = value;
    }

    /// Seed the transient tree directly.
    pub fn write_transient(&self, path: &str, value: Value) {
        let mut inner = self.lock();
        *entry(&mut inner.transient, path) = value;
    }

    /// Snapshot of the whole committed tree.
    pub fn committed(&self) -> Node {
        Node::from_value(self.lock().committed.clone())
    }

    /// Snapshot of the whole transient tree.
    pub fn transient(&self) -> Node {
        Node::from_value(self.lock().transient.clone())
    }

    pub fn commit_index(&self) -> u64 {
        self.lock().commit_index
    }

    fn apply(inner: &mut Inner, envelope: &Envelope) -> WriteResult {
        let mut result = WriteResult {
            accepted: true,
            ..WriteResult::default()
        };
        for transaction in &envelope.transactions {
            match transaction {
                Transaction::Write(write) => {
                    if preconditions_hold(&inner.committed, write) {
                        apply_operations(&mut inner.committed, &write.operations);
                        inner.commit_index += 1;
                        result.indices.push(inner.commit_index);
                    } else {
                        result.indices.push(0);
                    }
                    result.results.push(Value::Null);
                }
                Transaction::Read(paths) => {
                    result.indices.push(0);
                    result.results.push(read_paths(&inner.committed, paths));
                }
            }
        }
        result
    }
}

#[async_trait]
impl Agent for MemoryAgent {
    async fn read_snapshot(&self, prefix: &str) -> Result<Node, AgencyError> {
        let inner = self.lock();
        Ok(lookup(&inner.committed, prefix)
            .cloned()
            .map(Node::from_value)
            .unwrap_or_default())
    }

    async fn read_transient(&self, prefix: &str) -> Result<Node, AgencyError> {
        let inner = self.lock();
        Ok(lookup(&inner.transient, prefix)
            .cloned()
            .map(Node::from_value)
            .unwrap_or_default())
    }

    async fn submit_write(&self, envelope: Envelope) -> Result<WriteResult, AgencyError> {
        let mut inner = self.lock();
        if !inner.leader {
            return Err(AgencyError::NotLeader);
        }
        Ok(Self::apply(&mut inner, &envelope))
    }

    async fn submit_write_and_wait(&self, envelope: Envelope) -> Result<bool, AgencyError> {
        // A single in-memory node replicates instantly.
        let result = self.submit_write(envelope).await?;
        Ok(result.accepted)
    }

    async fn submit_transient(&self, envelope: Envelope) -> Result<(), AgencyError> {
        let mut inner = self.lock();
        for transaction in &envelope.transactions {
            if let Transaction::Write(write) = transaction {
                apply_operations(&mut inner.transient, &write.operations);
            }
        }
        Ok(())
    }

    fn is_leader(&self) -> bool {
        self.lock().leader
    }

    fn leader_for(&self) -> Duration {
        let inner = self.lock();
        match (inner.leader, inner.leader_since) {
            (true, Some(since)) => since.elapsed(),
            _ => Duration::ZERO,
        }
    }

    fn prepare_leadership_done(&self) -> bool {
        self.lock().prepare_done
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments(path) {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Mutable access to `path`, creating intermediate objects along the way.
/// Non-object values on the way are replaced by objects.
fn entry<'a>(root: &'a mut Value, path: &str) -> &'a mut Value {
    let mut current = root;
    for segment in segments(path) {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .expect("entry descends into objects")
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }
    current
}

fn remove(root: &mut Value, path: &str) {
    let mut parts: Vec<&str> = segments(path).collect();
    let Some(last) = parts.pop() else {
        return;
    };
    let mut current = root;
    for segment in parts {
        let Some(next) = current.as_object_mut().and_then(|map| map.get_mut(segment)) else {
            return;
        };
        current = next;
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(last);
    }
}

fn preconditions_hold(root: &Value, write: &WriteTransaction) -> bool {
    write.preconditions.iter().all(|prec| match prec {
        Precondition::OldEmpty { path, empty } => lookup(root, path).is_none() == *empty,
        Precondition::Old { path, value } => lookup(root, path) == Some(value),
        Precondition::IsArray { path, is_array } => {
            lookup(root, path).is_some_and(Value::is_array) == *is_array
        }
    })
}

fn apply_operations(root: &mut Value, operations: &[Operation]) {
    for op in operations {
        match op {
            Operation::Set { path, value } => {
                *entry(root, path) = value.clone();
            }
            Operation::Delete { path } => {
                remove(root, path);
            }
            Operation::Increment { path, step } => {
                let slot = entry(root, path);
                let old = slot.as_u64().unwrap_or(0);
                *slot = Value::from(old + step);
            }
            Operation::Merge { path, value } => {
                let slot = entry(root, path);
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                let map = slot.as_object_mut().expect("merge target is an object");
                for (key, item) in value {
                    map.insert(key.clone(), item.clone());
                }
            }
        }
    }
}

fn read_paths(root: &Value, paths: &[String]) -> Value {
    let mut out = Value::Object(Map::new());
    for path in paths {
        let path = normalize_path(path);
        if let Some(value) = lookup(root, &path) {
            *entry(&mut out, &path) = value.clone();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionBuilder;
    use serde_json::json;

    fn write(build: impl FnOnce(&mut TransactionBuilder)) -> Envelope {
        let mut builder = TransactionBuilder::new();
        build(&mut builder);
        Envelope::of_write(builder.build().expect("valid transaction"))
    }

    #[tokio::test]
    async fn set_creates_intermediate_objects() {
        let agent = MemoryAgent::leading(Duration::ZERO);
        let result = agent
            .submit_write(write(|b| {
                b.set("/strata/Plan/DBServers/PRMR-a", json!("none"));
            }))
            .await
            .unwrap();
        assert!(result.accepted);
        assert_eq!(result.index(0), 1);
        assert_eq!(
            agent.committed().string_at("/strata/Plan/DBServers/PRMR-a"),
            Some("none")
        );
    }

    #[tokio::test]
    async fn increment_starts_from_zero_and_steps() {
        let agent = MemoryAgent::leading(Duration::ZERO);
        for _ in 0..2 {
            agent
                .submit_write(write(|b| {
                    b.increment("/strata/Sync/LatestID", 10_000);
                }))
                .await
                .unwrap();
        }
        assert_eq!(agent.committed().uint_at("/strata/Sync/LatestID"), Some(20_000));
    }

    #[tokio::test]
    async fn failed_preconditions_reject_only_their_transaction() {
        let agent = MemoryAgent::leading(Duration::ZERO);
        agent.write_committed("/strata/Agency/Definition", json!(1));

        let mut envelope = write(|b| {
            b.set("/strata/Target/Marker", json!(true));
        });
        let mut guarded = TransactionBuilder::new();
        guarded
            .set("/strata/Agency/Definition", json!(2))
            .old_empty("/strata/Agency/Definition", true);
        envelope.push_write(guarded.build().unwrap());

        let result = agent.submit_write(envelope).await.unwrap();
        assert!(result.accepted);
        assert_ne!(result.index(0), 0);
        assert_eq!(result.index(1), 0);
        assert_eq!(agent.committed().uint_at("/strata/Agency/Definition"), Some(1));
        assert_eq!(agent.committed().bool_at("/strata/Target/Marker"), Some(true));
    }

    #[tokio::test]
    async fn old_and_is_array_preconditions() {
        let agent = MemoryAgent::leading(Duration::ZERO);
        agent.write_committed("/strata/Target/FailedServers", json!(["PRMR-a"]));

        let result = agent
            .submit_write(write(|b| {
                b.set("/strata/Target/FailedServers", json!({ "PRMR-a": {} }))
                    .is_array("/strata/Target/FailedServers", true);
            }))
            .await
            .unwrap();
        assert_ne!(result.index(0), 0);

        // Second run: no longer an array, precondition rejects.
        let result = agent
            .submit_write(write(|b| {
                b.set("/strata/Target/FailedServers", json!({}))
                    .is_array("/strata/Target/FailedServers", true);
            }))
            .await
            .unwrap();
        assert_eq!(result.index(0), 0);

        let result = agent
            .submit_write(write(|b| {
                b.delete("/strata/Current/Foxxmaster")
                    .eq("/strata/Target/FailedServers", json!({ "PRMR-a": {} }));
            }))
            .await
            .unwrap();
        assert_ne!(result.index(0), 0);
    }

    #[tokio::test]
    async fn merge_is_shallow() {
        let agent = MemoryAgent::leading(Duration::ZERO);
        agent.write_committed("/strata/Supervision/State", json!({ "Mode": "Normal" }));
        let mut fields = Map::new();
        fields.insert("Timestamp".to_string(), json!("2026-01-01T00:00:00Z"));
        agent
            .submit_write(write(|b| {
                b.merge("/strata/Supervision/State", fields);
            }))
            .await
            .unwrap();
        let node = agent.committed();
        assert_eq!(node.string_at("/strata/Supervision/State/Mode"), Some("Normal"));
        assert!(node.has("/strata/Supervision/State/Timestamp"));
    }

    #[tokio::test]
    async fn read_transactions_mirror_full_paths() {
        let agent = MemoryAgent::leading(Duration::ZERO);
        agent.write_committed("/strata/Sync/LatestID", json!(30_000));

        let mut envelope = write(|b| {
            b.increment("/strata/Sync/LatestID", 10_000);
        });
        envelope.push_read(vec!["/strata/Sync/LatestID".to_string()]);

        let result = agent.submit_write(envelope).await.unwrap();
        assert_eq!(
            result.results[1]
                .pointer("/strata/Sync/LatestID")
                .and_then(Value::as_u64),
            Some(40_000)
        );
    }

    #[tokio::test]
    async fn transient_tree_is_separate_and_unconditional() {
        let agent = MemoryAgent::leading(Duration::ZERO);
        agent
            .submit_transient(write(|b| {
                b.set("/strata/Supervision/Health/PRMR-a", json!({ "Status": "GOOD" }));
            }))
            .await
            .unwrap();
        assert!(agent.transient().has("/strata/Supervision/Health/PRMR-a"));
        assert!(!agent.committed().has("/strata/Supervision/Health/PRMR-a"));
    }

    #[tokio::test]
    async fn followers_reject_writes() {
        let agent = MemoryAgent::new();
        let result = agent
            .submit_write(write(|b| {
                b.set("/strata/X", json!(1));
            }))
            .await;
        assert!(matches!(result, Err(AgencyError::NotLeader)));
    }

    #[test]
    fn leader_for_tracks_tenure() {
        let agent = MemoryAgent::new();
        assert_eq!(agent.leader_for(), Duration::ZERO);
        agent.set_leader_for(Duration::from_secs(30));
        assert!(agent.leader_for() >= Duration::from_secs(30));
        agent.set_leader(false);
        assert_eq!(agent.leader_for(), Duration::ZERO);
    }
}
