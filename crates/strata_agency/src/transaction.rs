//! Conditional transaction envelopes for the agency store.
//!
//! An [`Envelope`] is an ordered list of transactions. Each write transaction
//! is a set of operations plus preconditions; the consensus layer applies it
//! atomically and only if every precondition holds on the committed state.
//! Transactions in one envelope are independent: a rejected one does not roll
//! back the others. Read transactions name paths whose committed values are
//! returned alongside the write results.

use serde_json::{json, Map, Value};

use crate::error::AgencyError;
use crate::node::normalize_path;

/// A single mutation of the committed (or transient) tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Set { path: String, value: Value },
    Delete { path: String },
    Increment { path: String, step: u64 },
    Merge { path: String, value: Map<String, Value> },
}

impl Operation {
    pub fn path(&self) -> &str {
        match self {
            Operation::Set { path, .. }
            | Operation::Delete { path }
            | Operation::Increment { path, .. }
            | Operation::Merge { path, .. } => path,
        }
    }

    fn to_wire(&self) -> Value {
        match self {
            Operation::Set { value, .. } => json!({ "op": "set", "new": value }),
            Operation::Delete { .. } => json!({ "op": "delete" }),
            Operation::Increment { step, .. } => json!({ "op": "increment", "step": step }),
            Operation::Merge { value, .. } => json!({ "op": "merge", "new": value }),
        }
    }
}

/// An assertion that must hold on the committed tree for a write transaction
/// to be applied.
#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    /// `empty == true` asserts the path is absent, `false` that it exists.
    OldEmpty { path: String, empty: bool },
    /// The committed value equals the given one.
    Old { path: String, value: Value },
    /// Whether the committed value is an array.
    IsArray { path: String, is_array: bool },
}

impl Precondition {
    pub fn path(&self) -> &str {
        match self {
            Precondition::OldEmpty { path, .. }
            | Precondition::Old { path, .. }
            | Precondition::IsArray { path, .. } => path,
        }
    }

    fn to_wire(&self) -> Value {
        match self {
            Precondition::OldEmpty { empty, .. } => json!({ "oldEmpty": empty }),
            Precondition::Old { value, .. } => json!({ "old": value }),
            Precondition::IsArray { is_array, .. } => json!({ "isArray": is_array }),
        }
    }
}

/// Operations plus preconditions, applied as one atomic unit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteTransaction {
    pub operations: Vec<Operation>,
    pub preconditions: Vec<Precondition>,
}

impl WriteTransaction {
    /// Append another transaction's operations and preconditions to this one,
    /// so both commit in the same atomic unit.
    pub fn merge(&mut self, other: WriteTransaction) {
        self.operations.extend(other.operations);
        self.preconditions.extend(other.preconditions);
    }
}

/// One element of an envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Transaction {
    Write(WriteTransaction),
    Read(Vec<String>),
}

/// An ordered list of transactions submitted to the agency in one round.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub transactions: Vec<Transaction>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// An envelope holding a single write transaction.
    pub fn of_write(write: WriteTransaction) -> Self {
        Self {
            transactions: vec![Transaction::Write(write)],
        }
    }

    pub fn push_write(&mut self, write: WriteTransaction) {
        self.transactions.push(Transaction::Write(write));
    }

    pub fn push_read(&mut self, paths: Vec<String>) {
        let paths = paths.iter().map(|p| normalize_path(p)).collect();
        self.transactions.push(Transaction::Read(paths));
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// The nested-array JSON form the consensus layer speaks:
    /// `[[{path: op}, {path: precondition}], [path, ...], ...]`.
    pub fn to_wire(&self) -> Value {
        let mut out = Vec::with_capacity(self.transactions.len());
        for transaction in &self.transactions {
            match transaction {
                Transaction::Write(write) => {
                    let mut operations = Map::new();
                    for op in &write.operations {
                        operations.insert(op.path().to_string(), op.to_wire());
                    }
                    let mut tuple = vec![Value::Object(operations)];
                    if !write.preconditions.is_empty() {
                        let mut preconditions = Map::new();
                        for prec in &write.preconditions {
                            preconditions.insert(prec.path().to_string(), prec.to_wire());
                        }
                        tuple.push(Value::Object(preconditions));
                    }
                    out.push(Value::Array(tuple));
                }
                Transaction::Read(paths) => {
                    out.push(json!(paths));
                }
            }
        }
        Value::Array(out)
    }
}

/// Builder for a single write transaction.
///
/// Paths are normalized as they are added. [`TransactionBuilder::build`] fails
/// with [`AgencyError::BadEnvelope`] only on obvious structural errors; wire
/// level rejection is surfaced by the consensus layer.
#[derive(Debug, Default)]
pub struct TransactionBuilder {
    operations: Vec<Operation>,
    preconditions: Vec<Precondition>,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: impl AsRef<str>, value: Value) -> &mut Self {
        self.operations.push(Operation::Set {
            path: normalize_path(path.as_ref()),
            value,
        });
        self
    }

    pub fn delete(&mut self, path: impl AsRef<str>) -> &mut Self {
        self.operations.push(Operation::Delete {
            path: normalize_path(path.as_ref()),
        });
        self
    }

    pub fn increment(&mut self, path: impl AsRef<str>, step: u64) -> &mut Self {
        self.operations.push(Operation::Increment {
            path: normalize_path(path.as_ref()),
            step,
        });
        self
    }

    pub fn merge(&mut self, path: impl AsRef<str>, value: Map<String, Value>) -> &mut Self {
        self.operations.push(Operation::Merge {
            path: normalize_path(path.as_ref()),
            value,
        });
        self
    }

    pub fn old_empty(&mut self, path: impl AsRef<str>, empty: bool) -> &mut Self {
        self.preconditions.push(Precondition::OldEmpty {
            path: normalize_path(path.as_ref()),
            empty,
        });
        self
    }

    pub fn eq(&mut self, path: impl AsRef<str>, value: Value) -> &mut Self {
        self.preconditions.push(Precondition::Old {
            path: normalize_path(path.as_ref()),
            value,
        });
        self
    }

    pub fn is_array(&mut self, path: impl AsRef<str>, is_array: bool) -> &mut Self {
        self.preconditions.push(Precondition::IsArray {
            path: normalize_path(path.as_ref()),
            is_array,
        });
        self
    }

    pub fn build(self) -> Result<WriteTransaction, AgencyError> {
        if self.operations.is_empty() {
            return Err(AgencyError::BadEnvelope(
                "write transaction has no operations".to_string(),
            ));
        }
        for op in &self.operations {
            if op.path() == "/" {
                return Err(AgencyError::BadEnvelope(
                    "operations may not target the root".to_string(),
                ));
            }
        }
        Ok(WriteTransaction {
            operations: self.operations,
            preconditions: self.preconditions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_operations_and_preconditions() {
        let mut builder = TransactionBuilder::new();
        builder
            .set("/Target/ToDo/17", json!({ "type": "addFollower" }))
            .delete("Target/Failed/9")
            .increment("/Plan/Version", 1)
            .old_empty("/Target/ToDo/17", true)
            .eq("/Plan/Version", json!(7))
            .is_array("/Target/FailedServers", false);
        let write = builder.build().expect("valid transaction");
        assert_eq!(write.operations.len(), 3);
        assert_eq!(write.preconditions.len(), 3);
        assert_eq!(write.operations[1].path(), "/Target/Failed/9");
    }

    #[test]
    fn rejects_structural_errors() {
        let builder = TransactionBuilder::new();
        assert!(matches!(
            builder.build(),
            Err(AgencyError::BadEnvelope(_))
        ));

        let mut builder = TransactionBuilder::new();
        builder.delete("//");
        assert!(matches!(
            builder.build(),
            Err(AgencyError::BadEnvelope(_))
        ));
    }

    #[test]
    fn wire_form_is_nested_arrays() {
        let mut builder = TransactionBuilder::new();
        builder
            .set("/Agency/Definition", json!(1))
            .old_empty("/Agency/Definition", true);
        let mut envelope = Envelope::of_write(builder.build().unwrap());
        envelope.push_read(vec!["/Sync/LatestID".to_string()]);

        assert_eq!(
            envelope.to_wire(),
            json!([
                [
                    { "/Agency/Definition": { "op": "set", "new": 1 } },
                    { "/Agency/Definition": { "oldEmpty": true } }
                ],
                ["/Sync/LatestID"]
            ])
        );
    }

    #[test]
    fn wire_form_omits_empty_preconditions() {
        let mut builder = TransactionBuilder::new();
        builder.delete("/Shutdown");
        let envelope = Envelope::of_write(builder.build().unwrap());
        assert_eq!(
            envelope.to_wire(),
            json!([[{ "/Shutdown": { "op": "delete" } }]])
        );
    }

    #[test]
    fn merge_combines_atomic_units() {
        let mut health = TransactionBuilder::new();
        health.set("/Supervision/Health/PRMR-a", json!({ "Status": "FAILED" }));
        let mut health = health.build().unwrap();

        let mut job = TransactionBuilder::new();
        job.set("/Target/ToDo/3", json!({ "type": "failedServer" }))
            .old_empty("/Target/FailedServers/PRMR-a", true);
        health.merge(job.build().unwrap());

        assert_eq!(health.operations.len(), 2);
        assert_eq!(health.preconditions.len(), 1);
    }
}
