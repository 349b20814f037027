//! Error taxonomy for agency interactions.

use thiserror::Error;

/// Failures surfaced by the agency client layer.
///
/// Rejected preconditions are not errors: they come back as a zero commit
/// index inside an accepted [`crate::WriteResult`], because the callers of
/// this crate are retry-driven and recompute their writes from the next
/// snapshot.
#[derive(Debug, Error)]
pub enum AgencyError {
    /// The envelope failed structural validation before it was submitted.
    #[error("bad transaction envelope: {0}")]
    BadEnvelope(String),

    /// The local agent is not the leader of the consensus group.
    #[error("not the agency leader")]
    NotLeader,

    /// The consensus layer failed to process the request.
    #[error("agency store error: {0}")]
    Store(String),
}
