//! Per-server health records and role classification.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use strata_agency::Node;

use crate::paths;

/// Health of a cluster member as judged by the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Good,
    Bad,
    Failed,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Good => "GOOD",
            HealthStatus::Bad => "BAD",
            HealthStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "GOOD" => Some(HealthStatus::Good),
            "BAD" => Some(HealthStatus::Bad),
            "FAILED" => Some(HealthStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role class encoded in the first four characters of a server id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerRole {
    DbServer,
    Coordinator,
    Single,
}

impl ServerRole {
    /// Classify a server id by its prefix; `None` for unknown prefixes.
    pub fn of(server_id: &str) -> Option<Self> {
        match server_id.get(..4) {
            Some("PRMR") => Some(ServerRole::DbServer),
            Some("CRDN") => Some(ServerRole::Coordinator),
            Some("SNGL") => Some(ServerRole::Single),
            _ => None,
        }
    }

    /// Key of this role's membership list under `/Plan`.
    pub fn plan_key(self) -> &'static str {
        match self {
            ServerRole::DbServer => "DBServers",
            ServerRole::Coordinator => "Coordinators",
            ServerRole::Single => "Singles",
        }
    }

    /// All roles, in the order the supervisor checks them.
    pub fn all() -> [ServerRole; 3] {
        [
            ServerRole::DbServer,
            ServerRole::Coordinator,
            ServerRole::Single,
        ]
    }
}

/// The persisted health datum for one server.
///
/// `version` records the on-disk schema vintage the record was parsed from:
/// 2 is the current format, 1 the heartbeat-keyed legacy format, 0 a blank
/// record. Serialization always emits version 2.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HealthRecord {
    pub short_name: String,
    pub endpoint: String,
    pub host_id: String,
    pub status: Option<HealthStatus>,
    pub sync_status: String,
    pub sync_time: String,
    pub last_acked: String,
    pub version: u8,
}

impl HealthRecord {
    pub fn new(short_name: &str, endpoint: &str, host_id: &str) -> Self {
        Self {
            short_name: short_name.to_string(),
            endpoint: endpoint.to_string(),
            host_id: host_id.to_string(),
            ..Self::default()
        }
    }

    /// Absorb a stored record, detecting its schema version.
    ///
    /// `short_name` and `endpoint` are set once: once non-empty they are
    /// never overwritten by later observations.
    pub fn update_from(&mut self, node: &Node) {
        self.version = 0;
        if self.short_name.is_empty() {
            if let Some(value) = node.string_at("/ShortName") {
                self.short_name = value.to_string();
            }
        }
        if self.endpoint.is_empty() {
            if let Some(value) = node.string_at("/Endpoint") {
                self.endpoint = value.to_string();
            }
        }
        let Some(status) = node.string_at("/Status") else {
            return;
        };
        self.status = HealthStatus::parse(status);
        if let Some(sync_status) = node.string_at("/SyncStatus") {
            self.version = 2;
            self.sync_status = sync_status.to_string();
            if let Some(sync_time) = node.string_at("/SyncTime") {
                self.sync_time = sync_time.to_string();
            }
            if let Some(last_acked) = node.string_at("/LastAcked") {
                self.last_acked = last_acked.to_string();
            }
        } else if let Some(sync_status) = node.string_at("/LastHeartbeatStatus") {
            self.version = 1;
            self.sync_status = sync_status.to_string();
            if let Some(sync_time) = node.string_at("/LastHeartbeatSent") {
                self.sync_time = sync_time.to_string();
            }
            if let Some(last_acked) = node.string_at("/LastHeartbeatAcked") {
                self.last_acked = last_acked.to_string();
            }
        }
        if let Some(host) = node.string_at("/Host") {
            self.host_id = host.to_string();
        }
    }

    /// Serialize in the current (version 2) format.
    ///
    /// A record without a sync time gets a wall-clock `Timestamp` instead
    /// and no `LastAcked`.
    pub fn to_value(&self) -> Value {
        let status = self.status.map(HealthStatus::as_str).unwrap_or("");
        let mut out = json!({
            "ShortName": self.short_name,
            "Endpoint": self.endpoint,
            "Host": self.host_id,
            "SyncStatus": self.sync_status,
            "Status": status,
        });
        let fields = out.as_object_mut().expect("record serializes as object");
        if self.sync_time.is_empty() {
            fields.insert("Timestamp".to_string(), json!(timestamp(Utc::now())));
        } else {
            fields.insert("SyncTime".to_string(), json!(self.sync_time));
            fields.insert("LastAcked".to_string(), json!(self.last_acked));
        }
        out
    }

    /// Whether the observable state differs from another record's.
    pub fn status_diff(&self, other: &HealthRecord) -> bool {
        self.status != other.status || self.sync_status != other.sync_status
    }
}

/// Status recorded under `/Supervision/Health/<id>` in the given snapshot.
pub fn recorded_status(snapshot: &Node, server_id: &str) -> Option<HealthStatus> {
    snapshot
        .string_at(&format!("{}/{}/Status", paths::SUPERVISION_HEALTH, server_id))
        .and_then(HealthStatus::parse)
}

/// RFC 3339 rendering used for all supervisor timestamps.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Lenient timestamp parse; anything unreadable collapses to the epoch,
/// which downstream age checks treat as infinitely old.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
