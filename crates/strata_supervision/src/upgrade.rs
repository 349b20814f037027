//! One-shot agency schema migration, run on the first leader tick per term.
//!
//! Every step is guarded either by an "only if" predicate on the snapshot or
//! by a precondition in the emitted transaction, so replaying the envelope
//! after a successful run is a no-op.

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};
use strata_agency::{Envelope, Node, TransactionBuilder};

use crate::config::SupervisionConfig;
use crate::health::HealthRecord;
use crate::jobs::object_entries;
use crate::paths;

/// Assemble the full migration envelope for the given snapshot.
pub fn build_upgrade_envelope(config: &SupervisionConfig, snapshot: &Node) -> Envelope {
    let mut envelope = Envelope::new();
    upgrade_zero(config, snapshot, &mut envelope);
    fix_prototype_chain(config, snapshot, &mut envelope);
    upgrade_one(config, snapshot, &mut envelope);
    upgrade_health_records(config, snapshot, &mut envelope);
    envelope
}

/// `/Target/FailedServers` used to be an array of ids; convert it to an
/// object keyed by id.
fn upgrade_zero(config: &SupervisionConfig, snapshot: &Node, envelope: &mut Envelope) {
    let Some(failed) = snapshot.value_at(paths::TARGET_FAILED_SERVERS) else {
        return;
    };
    let Some(entries) = failed.as_array() else {
        return;
    };
    let mut converted = Map::new();
    for entry in entries {
        if let Some(id) = entry.as_str() {
            converted.insert(id.to_string(), json!({}));
        }
    }
    let mut builder = TransactionBuilder::new();
    builder
        .set(
            config.prefixed(paths::TARGET_FAILED_SERVERS),
            Value::Object(converted),
        )
        .is_array(config.prefixed(paths::TARGET_FAILED_SERVERS), true);
    if let Ok(write) = builder.build() {
        envelope.push_write(write);
    }
}

/// Collapse transitive `distributeShardsLike` chains onto their final
/// prototype, guarded by the chain still looking the same.
fn fix_prototype_chain(config: &SupervisionConfig, snapshot: &Node, envelope: &mut Envelope) {
    for (database, collections) in snapshot.children(paths::PLAN_COLLECTIONS) {
        for (collection, body) in object_entries(collections) {
            let Some(prototype) = body.get("distributeShardsLike").and_then(Value::as_str) else {
                continue;
            };
            if prototype.is_empty() {
                continue;
            }
            let resolved = resolve_prototype(snapshot, database, prototype);
            if resolved == prototype {
                continue;
            }
            let path = config.prefixed(&format!(
                "{}/{database}/{collection}/distributeShardsLike",
                paths::PLAN_COLLECTIONS
            ));
            let mut builder = TransactionBuilder::new();
            builder
                .set(&path, json!(resolved))
                .eq(&path, json!(prototype));
            if let Ok(write) = builder.build() {
                envelope.push_write(write);
            }
        }
    }
}

/// Follow the prototype chain until a collection without
/// `distributeShardsLike`; cycles resolve to the starting point so no fix is
/// emitted for them.
fn resolve_prototype(snapshot: &Node, database: &str, start: &str) -> String {
    let mut seen = BTreeSet::new();
    let mut current = start.to_string();
    loop {
        if !seen.insert(current.clone()) {
            tracing::warn!(
                database = %database,
                collection = %start,
                "distributeShardsLike chain is cyclic; leaving it untouched"
            );
            return start.to_string();
        }
        let next = snapshot.string_at(&format!(
            "{}/{database}/{current}/distributeShardsLike",
            paths::PLAN_COLLECTIONS
        ));
        match next {
            Some(next) if !next.is_empty() => current = next.to_string(),
            _ => return current,
        }
    }
}

/// First-generation schema marker plus empty job queues.
fn upgrade_one(config: &SupervisionConfig, snapshot: &Node, envelope: &mut Envelope) {
    if snapshot.has(paths::AGENCY_DEFINITION) {
        return;
    }
    let mut builder = TransactionBuilder::new();
    builder
        .set(config.prefixed(paths::AGENCY_DEFINITION), json!(1))
        .set(config.prefixed(paths::TARGET_TODO), json!({}))
        .set(config.prefixed(paths::TARGET_PENDING), json!({}))
        .old_empty(config.prefixed(paths::AGENCY_DEFINITION), true);
    if let Ok(write) = builder.build() {
        envelope.push_write(write);
    }
}

/// Rewrite version-1 health records in the current format.
fn upgrade_health_records(config: &SupervisionConfig, snapshot: &Node, envelope: &mut Envelope) {
    let mut builder = TransactionBuilder::new();
    let mut rewrites = 0usize;
    for (server_id, stored) in snapshot.children(paths::SUPERVISION_HEALTH) {
        let mut record = HealthRecord::default();
        record.update_from(&Node::from_value(stored.clone()));
        if record.version != 1 || record.short_name.is_empty() || record.endpoint.is_empty() {
            continue;
        }
        builder.set(
            config.prefixed(&format!("{}/{server_id}", paths::SUPERVISION_HEALTH)),
            record.to_value(),
        );
        rewrites += 1;
    }
    if rewrites == 0 {
        return;
    }
    if let Ok(write) = builder.build() {
        envelope.push_write(write);
    }
}
