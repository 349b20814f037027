//! Shared fixture helpers for supervision integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use strata_agency::MemoryAgent;
use strata_supervision::health::timestamp;
use strata_supervision::{SupervisionConfig, Supervisor};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A leader agent with stable tenure and an initialized supervision root.
pub fn cluster_agent() -> Arc<MemoryAgent> {
    init_tracing();
    let agent = Arc::new(MemoryAgent::leading(Duration::from_secs(30)));
    agent.write_committed("/strata/Supervision/State", json!({}));
    agent
}

pub fn supervisor(agent: &Arc<MemoryAgent>) -> Supervisor {
    Supervisor::new(agent.clone(), SupervisionConfig::default())
}

/// Declare a server in the plan, register its coordinates, and map its short
/// name, the way the bootstrap of a real member does.
pub fn seed_server(agent: &MemoryAgent, id: &str, ordinal: u32) {
    let role_key = match &id[..4] {
        "PRMR" => "DBServers",
        "CRDN" => "Coordinators",
        "SNGL" => "Singles",
        other => panic!("unknown role prefix {other}"),
    };
    agent.write_committed(&format!("/strata/Plan/{role_key}/{id}"), json!("none"));
    agent.write_committed(
        &format!("/strata/Current/ServersRegistered/{id}"),
        json!({
            "endpoint": format!("tcp://10.0.0.{ordinal}:8529"),
            "host": format!("host-{ordinal}"),
        }),
    );
    agent.write_committed(
        &format!("/strata/Target/MapUniqueToShortID/{id}/ShortName"),
        json!(format!("Server{ordinal:04}")),
    );
}

/// Emit a fresh heartbeat for a server into the transient tree.
pub fn heartbeat(agent: &MemoryAgent, id: &str) {
    agent.write_transient(
        &format!("/strata/Sync/ServerStates/{id}"),
        json!({ "time": timestamp(Utc::now()), "status": "SERVING" }),
    );
}

pub fn heartbeat_all(agent: &MemoryAgent, ids: &[&str]) {
    for id in ids {
        heartbeat(agent, id);
    }
}

/// Rewrite the transient health record of a server as if its last
/// acknowledged heartbeat happened `seconds` ago, without changing the
/// heartbeat itself. This is how a frozen server looks to the evaluator.
pub fn age_last_acked(agent: &MemoryAgent, id: &str, seconds: i64) {
    let path = format!("/strata/Supervision/Health/{id}");
    let mut record = agent
        .transient()
        .value_at(&path)
        .cloned()
        .expect("transient health record exists");
    record["LastAcked"] = Value::String(timestamp(Utc::now() - ChronoDuration::seconds(seconds)));
    agent.write_transient(&path, record);
}

pub fn committed_health_status(agent: &MemoryAgent, id: &str) -> Option<String> {
    agent
        .committed()
        .string_at(&format!("/strata/Supervision/Health/{id}/Status"))
        .map(str::to_string)
}

/// All ToDo job records, key order.
pub fn todo_jobs(agent: &MemoryAgent) -> Vec<Value> {
    agent
        .committed()
        .children("/strata/Target/ToDo")
        .values()
        .cloned()
        .collect()
}
