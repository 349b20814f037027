//! Per-role health evaluation and the corrective actions it triggers.
//!
//! One pass covers one role class: sweep out health records for servers no
//! longer planned, then judge every planned server from its transient
//! heartbeat. A status transition is persisted in the same atomic unit as
//! whatever job the transition triggers, so the record and the job commit or
//! miss together; the refreshed record always goes to the transient tree
//! afterwards.

use chrono::{DateTime, Utc};
use serde_json::json;
use strata_agency::{Agent, Envelope, Node, TransactionBuilder, WriteTransaction};

use crate::config::SupervisionConfig;
use crate::health::{parse_timestamp, timestamp, HealthRecord, HealthStatus, ServerRole};
use crate::jobs::{ActiveFailover, FailedServer, Scheduler};
use crate::paths;

/// Check every planned server of one role class.
pub async fn check_role(
    agent: &dyn Agent,
    config: &SupervisionConfig,
    snapshot: &Node,
    transient: &Node,
    role: ServerRole,
    scheduler: &mut Scheduler,
) {
    sweep_stale_records(agent, config, snapshot, role).await;

    let plan_prefix = format!("/Plan/{}", role.plan_key());
    for server_id in snapshot.children(&plan_prefix).keys() {
        if let Err(err) =
            check_server(agent, config, snapshot, transient, server_id, scheduler).await
        {
            tracing::warn!(server = %server_id, error = %err, "health check failed");
        }
    }
}

/// Drop health records whose server left the plan, one bundled write.
async fn sweep_stale_records(
    agent: &dyn Agent,
    config: &SupervisionConfig,
    snapshot: &Node,
    role: ServerRole,
) {
    let stale = stale_health_entries(snapshot, role);
    if stale.is_empty() {
        return;
    }
    let mut builder = TransactionBuilder::new();
    for server_id in &stale {
        builder.delete(config.prefixed(&format!("{}/{server_id}", paths::SUPERVISION_HEALTH)));
    }
    let Ok(write) = builder.build() else {
        return;
    };
    match agent.submit_write(Envelope::of_write(write)).await {
        Ok(result) if result.accepted => {
            tracing::debug!(?role, removed = stale.len(), "removed unplanned health records");
        }
        Ok(_) | Err(_) => {
            tracing::debug!(?role, "health record sweep not accepted; retrying next tick");
        }
    }
}

/// Health records of this role class with no matching plan entry.
pub(crate) fn stale_health_entries(snapshot: &Node, role: ServerRole) -> Vec<String> {
    let planned = snapshot.children(&format!("/Plan/{}", role.plan_key()));
    snapshot
        .children(paths::SUPERVISION_HEALTH)
        .keys()
        .filter(|id| ServerRole::of(id) == Some(role))
        .filter(|id| !planned.contains_key(*id))
        .cloned()
        .collect()
}

async fn check_server(
    agent: &dyn Agent,
    config: &SupervisionConfig,
    snapshot: &Node,
    transient: &Node,
    server_id: &str,
    scheduler: &mut Scheduler,
) -> anyhow::Result<()> {
    // The short name registers asynchronously to the server itself; without
    // it there is nothing meaningful to record yet.
    let short_name_path = format!(
        "{}/{server_id}/ShortName",
        paths::TARGET_MAP_UNIQUE_TO_SHORT_ID
    );
    let Some(short_name) = snapshot.string_at(&short_name_path) else {
        tracing::info!(server = %server_id, "short name not yet available; skipping health check");
        return Ok(());
    };

    let registered = format!("{}/{server_id}", paths::CURRENT_SERVERS_REGISTERED);
    let endpoint = snapshot
        .string_at(&format!("{registered}/endpoint"))
        .unwrap_or_default();
    let host_id = snapshot
        .string_at(&format!("{registered}/host"))
        .unwrap_or_default();

    let mut transist = HealthRecord::new(short_name, endpoint, host_id);
    let mut persist = transist.clone();
    let health_path = format!("{}/{server_id}", paths::SUPERVISION_HEALTH);
    if let Some(stored) = transient.node_at(&health_path) {
        transist.update_from(&stored);
    }
    if let Some(stored) = snapshot.node_at(&health_path) {
        persist.update_from(&stored);
    }

    let sync_prefix = format!("{}/{server_id}", paths::SYNC_SERVER_STATES);
    let (sync_time, sync_status) = if transient.has(&sync_prefix) {
        (
            transient
                .string_at(&format!("{sync_prefix}/time"))
                .unwrap_or_default()
                .to_string(),
            transient
                .string_at(&format!("{sync_prefix}/status"))
                .unwrap_or("UNKNOWN")
                .to_string(),
        )
    } else {
        (timestamp(DateTime::<Utc>::UNIX_EPOCH), "UNKNOWN".to_string())
    };

    evaluate_heartbeat(config, Utc::now(), &mut transist, &sync_time, &sync_status);

    let changed = transist.status_diff(&persist);
    let action = if changed {
        handle_on_status(config, snapshot, &persist, &mut transist, server_id, scheduler)
    } else {
        None
    };

    // The transient record carries everything just observed; the persisted
    // one mirrors it on transitions.
    persist = transist.clone();

    let mut report = TransactionBuilder::new();
    report.set(config.prefixed(&health_path), transist.to_value());
    let transient_report = Envelope::of_write(report.build()?);

    if !changed {
        agent.submit_transient(transient_report).await?;
        return Ok(());
    }

    let mut builder = TransactionBuilder::new();
    builder.set(config.prefixed(&health_path), persist.to_value());
    let mut write = builder.build()?;
    if let Some(job) = action {
        write.merge(job);
    }
    match agent.submit_write(Envelope::of_write(write)).await {
        Ok(result) if result.accepted && result.index(0) != 0 => {
            agent.submit_transient(transient_report).await?;
        }
        Ok(_) => {
            tracing::debug!(
                server = %server_id,
                "health transition write rejected; recomputing next tick"
            );
        }
        Err(err) => {
            tracing::debug!(server = %server_id, error = %err, "health transition write failed");
        }
    }
    Ok(())
}

/// Fold the observed heartbeat into the transient record and judge status.
///
/// A changed sync time counts as a fresh heartbeat and resets the
/// acknowledgement clock; otherwise the age of the previous acknowledgement
/// decides.
pub(crate) fn evaluate_heartbeat(
    config: &SupervisionConfig,
    now: DateTime<Utc>,
    transist: &mut HealthRecord,
    sync_time: &str,
    sync_status: &str,
) {
    let last_acked = if sync_time != transist.sync_time {
        now
    } else {
        parse_timestamp(&transist.last_acked)
    };
    transist.last_acked = timestamp(last_acked);
    transist.sync_time = sync_time.to_string();
    transist.sync_status = sync_status.to_string();

    let elapsed = (now - last_acked).num_milliseconds() as f64 / 1000.0;
    transist.status = Some(if elapsed <= config.ok_threshold {
        HealthStatus::Good
    } else if elapsed <= config.grace_period {
        HealthStatus::Bad
    } else {
        HealthStatus::Failed
    });
}

/// Dispatch a status transition by server role.
///
/// Returns the operations and preconditions to merge into the persistent
/// health write; independent writes (the Foxxmaster reset) go through the
/// scheduler instead.
pub(crate) fn handle_on_status(
    config: &SupervisionConfig,
    snapshot: &Node,
    persist: &HealthRecord,
    transist: &mut HealthRecord,
    server_id: &str,
    scheduler: &mut Scheduler,
) -> Option<WriteTransaction> {
    match ServerRole::of(server_id) {
        Some(ServerRole::DbServer) => {
            handle_db_server(config, snapshot, persist, transist, server_id, scheduler)
        }
        Some(ServerRole::Coordinator) => {
            handle_coordinator(config, snapshot, transist, server_id, scheduler);
            None
        }
        Some(ServerRole::Single) => {
            handle_single(config, snapshot, persist, transist, server_id, scheduler)
        }
        None => {
            tracing::error!(server = %server_id, "unknown server type; no supervision action taken");
            None
        }
    }
}

fn handle_db_server(
    config: &SupervisionConfig,
    snapshot: &Node,
    persist: &HealthRecord,
    transist: &mut HealthRecord,
    server_id: &str,
    scheduler: &mut Scheduler,
) -> Option<WriteTransaction> {
    let failed_path = format!("{}/{server_id}", paths::TARGET_FAILED_SERVERS);
    if transist.status == Some(HealthStatus::Good) {
        if snapshot.has(&failed_path) {
            let mut builder = TransactionBuilder::new();
            builder.delete(config.prefixed(&failed_path));
            return builder.build().ok();
        }
        None
    } else if persist.status == Some(HealthStatus::Good)
        && transist.status != Some(HealthStatus::Good)
    {
        // Hysteresis: a single bad tick cannot open a failed-server job.
        transist.status = Some(HealthStatus::Bad);
        None
    } else if persist.status == Some(HealthStatus::Bad)
        && transist.status == Some(HealthStatus::Failed)
        && !snapshot.has(&failed_path)
    {
        let Some(job_id) = scheduler.claim_job_id() else {
            tracing::debug!(server = %server_id, "no job id available; deferring failed-server job");
            return None;
        };
        match FailedServer::new(job_id, server_id).create_transaction(config) {
            Ok(write) => Some(write),
            Err(err) => {
                tracing::error!(server = %server_id, error = %err, "failed-server job build failed");
                None
            }
        }
    } else {
        None
    }
}

fn handle_coordinator(
    config: &SupervisionConfig,
    snapshot: &Node,
    transist: &HealthRecord,
    server_id: &str,
    scheduler: &mut Scheduler,
) {
    if transist.status != Some(HealthStatus::Failed) {
        return;
    }
    // A failed Foxxmaster is simply vacated; coordinators get no
    // reconfiguration job.
    if snapshot.string_at(paths::CURRENT_FOXXMASTER) == Some(server_id) {
        let mut builder = TransactionBuilder::new();
        builder.set(config.prefixed(paths::CURRENT_FOXXMASTER), json!(""));
        if let Ok(write) = builder.build() {
            scheduler.submit_transaction(write);
        }
    }
}

fn handle_single(
    config: &SupervisionConfig,
    snapshot: &Node,
    persist: &HealthRecord,
    transist: &mut HealthRecord,
    server_id: &str,
    scheduler: &mut Scheduler,
) -> Option<WriteTransaction> {
    let failed_path = format!("{}/{server_id}", paths::TARGET_FAILED_SERVERS);
    if transist.status == Some(HealthStatus::Good) {
        if snapshot.has(&failed_path) {
            let mut builder = TransactionBuilder::new();
            builder.delete(config.prefixed(&failed_path));
            return builder.build().ok();
        }
        None
    } else if persist.status == Some(HealthStatus::Good)
        && transist.status != Some(HealthStatus::Good)
    {
        transist.status = Some(HealthStatus::Bad);
        None
    } else if persist.status == Some(HealthStatus::Bad)
        && transist.status == Some(HealthStatus::Failed)
        && !snapshot.has(&failed_path)
    {
        let Some(job_id) = scheduler.claim_job_id() else {
            tracing::debug!(server = %server_id, "no job id available; deferring failover job");
            return None;
        };
        match ActiveFailover::new(job_id, server_id).create_transaction(config) {
            Ok(write) => Some(write),
            Err(err) => {
                tracing::error!(server = %server_id, error = %err, "failover job build failed");
                None
            }
        }
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn config() -> SupervisionConfig {
        SupervisionConfig::default()
    }

    fn record(status: Option<HealthStatus>) -> HealthRecord {
        let mut record = HealthRecord::new("DBServer0001", "tcp://10.0.0.1:8529", "h1");
        record.status = status;
        record.sync_status = "SERVING".to_string();
        record
    }

    #[test]
    fn fresh_heartbeat_is_good() {
        let now = Utc::now();
        let mut transist = record(None);
        transist.sync_time = "old".to_string();
        evaluate_heartbeat(&config(), now, &mut transist, "new", "SERVING");
        assert_eq!(transist.status, Some(HealthStatus::Good));
        assert_eq!(transist.last_acked, timestamp(now));
        assert_eq!(transist.sync_time, "new");
    }

    #[test]
    fn stale_heartbeat_ages_through_bad_into_failed() {
        let now = Utc::now();

        let mut transist = record(None);
        transist.sync_time = "frozen".to_string();
        transist.last_acked = timestamp(now - ChronoDuration::seconds(3));
        evaluate_heartbeat(&config(), now, &mut transist, "frozen", "SERVING");
        assert_eq!(transist.status, Some(HealthStatus::Bad));

        let mut transist = record(None);
        transist.sync_time = "frozen".to_string();
        transist.last_acked = timestamp(now - ChronoDuration::seconds(60));
        evaluate_heartbeat(&config(), now, &mut transist, "frozen", "SERVING");
        assert_eq!(transist.status, Some(HealthStatus::Failed));
    }

    #[test]
    fn unreadable_last_acked_counts_as_ancient() {
        let now = Utc::now();
        let mut transist = record(None);
        transist.sync_time = "frozen".to_string();
        transist.last_acked = "not a timestamp".to_string();
        evaluate_heartbeat(&config(), now, &mut transist, "frozen", "SERVING");
        assert_eq!(transist.status, Some(HealthStatus::Failed));
    }

    #[test]
    fn good_server_clears_failure_marker() {
        let snapshot = Node::from_value(json!({
            "Target": { "FailedServers": { "PRMR-a": {} } },
        }));
        let persist = record(Some(HealthStatus::Failed));
        let mut transist = record(Some(HealthStatus::Good));
        let mut scheduler = Scheduler::new(100, 10_000);
        let write = handle_on_status(
            &config(),
            &snapshot,
            &persist,
            &mut transist,
            "PRMR-a",
            &mut scheduler,
        )
        .expect("clears the marker");
        assert_eq!(write.operations.len(), 1);
        assert_eq!(
            write.operations[0].path(),
            "/strata/Target/FailedServers/PRMR-a"
        );
        // The queued failed-server job is left to its own state machine.
        assert!(scheduler.take_envelopes().is_empty());
    }

    #[test]
    fn first_degradation_only_downgrades_to_bad() {
        let snapshot = Node::new();
        let persist = record(Some(HealthStatus::Good));
        let mut transist = record(Some(HealthStatus::Failed));
        let mut scheduler = Scheduler::new(100, 10_000);
        let write = handle_on_status(
            &config(),
            &snapshot,
            &persist,
            &mut transist,
            "PRMR-a",
            &mut scheduler,
        );
        assert!(write.is_none());
        assert_eq!(transist.status, Some(HealthStatus::Bad));
    }

    #[test]
    fn sustained_failure_opens_a_job() {
        let snapshot = Node::new();
        let persist = record(Some(HealthStatus::Bad));
        let mut transist = record(Some(HealthStatus::Failed));
        let mut scheduler = Scheduler::new(100, 10_000);
        let write = handle_on_status(
            &config(),
            &snapshot,
            &persist,
            &mut transist,
            "PRMR-a",
            &mut scheduler,
        )
        .expect("job transaction");
        let wire = Envelope::of_write(write).to_wire();
        assert_eq!(
            wire[0][0]["/strata/Target/ToDo/100"]["new"]["type"],
            json!("failedServer")
        );
        assert!(wire[0][0]["/strata/Target/FailedServers/PRMR-a"]["new"].is_object());
    }

    #[test]
    fn no_second_job_while_marker_exists() {
        let snapshot = Node::from_value(json!({
            "Target": { "FailedServers": { "PRMR-a": {} } },
        }));
        let persist = record(Some(HealthStatus::Bad));
        let mut transist = record(Some(HealthStatus::Failed));
        let mut scheduler = Scheduler::new(100, 10_000);
        let write = handle_on_status(
            &config(),
            &snapshot,
            &persist,
            &mut transist,
            "PRMR-a",
            &mut scheduler,
        );
        assert!(write.is_none());
        assert_eq!(scheduler.cursor(), 100);
    }

    #[test]
    fn failed_foxxmaster_is_vacated() {
        let snapshot = Node::from_value(json!({
            "Current": { "Foxxmaster": "CRDN-1" },
        }));
        let persist = record(Some(HealthStatus::Good));
        let mut transist = record(Some(HealthStatus::Failed));
        let mut scheduler = Scheduler::new(100, 10_000);
        let write = handle_on_status(
            &config(),
            &snapshot,
            &persist,
            &mut transist,
            "CRDN-1",
            &mut scheduler,
        );
        assert!(write.is_none());
        let envelopes = scheduler.take_envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(
            envelopes[0].to_wire()[0][0]["/strata/Current/Foxxmaster"]["new"],
            json!("")
        );
    }

    #[test]
    fn other_coordinators_do_not_touch_foxxmaster() {
        let snapshot = Node::from_value(json!({
            "Current": { "Foxxmaster": "CRDN-1" },
        }));
        let persist = record(Some(HealthStatus::Good));
        let mut transist = record(Some(HealthStatus::Failed));
        let mut scheduler = Scheduler::new(100, 10_000);
        handle_on_status(
            &config(),
            &snapshot,
            &persist,
            &mut transist,
            "CRDN-2",
            &mut scheduler,
        );
        assert!(scheduler.take_envelopes().is_empty());
    }

    #[test]
    fn failed_single_opens_failover_job() {
        let snapshot = Node::new();
        let persist = record(Some(HealthStatus::Bad));
        let mut transist = record(Some(HealthStatus::Failed));
        let mut scheduler = Scheduler::new(100, 10_000);
        let write = handle_on_status(
            &config(),
            &snapshot,
            &persist,
            &mut transist,
            "SNGL-a",
            &mut scheduler,
        )
        .expect("job transaction");
        let wire = Envelope::of_write(write).to_wire();
        assert_eq!(
            wire[0][0]["/strata/Target/ToDo/100"]["new"]["type"],
            json!("activeFailover")
        );
    }

    #[test]
    fn unknown_prefixes_take_no_action() {
        let snapshot = Node::new();
        let persist = record(Some(HealthStatus::Bad));
        let mut transist = record(Some(HealthStatus::Failed));
        let mut scheduler = Scheduler::new(100, 10_000);
        let write = handle_on_status(
            &config(),
            &snapshot,
            &persist,
            &mut transist,
            "AGNT-x",
            &mut scheduler,
        );
        assert!(write.is_none());
        assert_eq!(scheduler.cursor(), 100);
    }

    #[test]
    fn sweep_finds_only_unplanned_records_of_the_role() {
        let snapshot = Node::from_value(json!({
            "Plan": {
                "DBServers": { "PRMR-a": "none" },
                "Coordinators": { "CRDN-1": "none" },
            },
            "Supervision": {
                "Health": {
                    "PRMR-a": {},
                    "PRMR-gone": {},
                    "CRDN-1": {},
                    "CRDN-gone": {},
                },
            },
        }));
        assert_eq!(
            stale_health_entries(&snapshot, ServerRole::DbServer),
            vec!["PRMR-gone"]
        );
        assert_eq!(
            stale_health_entries(&snapshot, ServerRole::Coordinator),
            vec!["CRDN-gone"]
        );
        assert!(stale_health_entries(&snapshot, ServerRole::Single).is_empty());
    }
}
