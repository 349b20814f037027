//! Agency path layout touched by the supervisor.
//!
//! All constants are relative to the agency prefix; snapshots are rooted at
//! the prefix, so reads use these directly while writes go through
//! [`crate::SupervisionConfig::prefixed`].

pub const SYNC_SERVER_STATES: &str = "/Sync/ServerStates";
pub const SYNC_LATEST_ID: &str = "/Sync/LatestID";

pub const SUPERVISION: &str = "/Supervision";
pub const SUPERVISION_HEALTH: &str = "/Supervision/Health";
pub const SUPERVISION_STATE: &str = "/Supervision/State";
pub const SUPERVISION_MAINTENANCE: &str = "/Supervision/Maintenance";
/// Block markers for shards with an in-flight move.
pub const BLOCKED_SHARDS: &str = "/Supervision/Shards";
/// Block markers for servers being drained.
pub const BLOCKED_SERVERS: &str = "/Supervision/DBServers";

pub const TARGET_TODO: &str = "/Target/ToDo";
pub const TARGET_PENDING: &str = "/Target/Pending";
pub const TARGET_FINISHED: &str = "/Target/Finished";
pub const TARGET_FAILED: &str = "/Target/Failed";
pub const TARGET_FAILED_SERVERS: &str = "/Target/FailedServers";
pub const TARGET_NUMBER_OF_DBSERVERS: &str = "/Target/NumberOfDBServers";
pub const TARGET_MAP_UNIQUE_TO_SHORT_ID: &str = "/Target/MapUniqueToShortID";
pub const TARGET_TO_BE_CLEANED: &str = "/Target/ToBeCleanedServers";
pub const TARGET_CLEANED: &str = "/Target/CleanedServers";

pub const PLAN_DBSERVERS: &str = "/Plan/DBServers";
pub const PLAN_SINGLES: &str = "/Plan/Singles";
pub const PLAN_COLLECTIONS: &str = "/Plan/Collections";
pub const PLAN_VERSION: &str = "/Plan/Version";
pub const PLAN_ASYNC_REPLICATION_LEADER: &str = "/Plan/AsyncReplication/Leader";

pub const CURRENT_SERVERS_REGISTERED: &str = "/Current/ServersRegistered";
pub const CURRENT_FOXXMASTER: &str = "/Current/Foxxmaster";
pub const CURRENT_COLLECTIONS: &str = "/Current/Collections";

pub const AGENCY_DEFINITION: &str = "/Agency/Definition";
pub const SHUTDOWN: &str = "/Shutdown";
