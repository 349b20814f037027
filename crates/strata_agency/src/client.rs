//! The agent-facing API the supervision layer consumes.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AgencyError;
use crate::node::Node;
use crate::transaction::Envelope;

/// Result of submitting an envelope to the agency.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteResult {
    /// Whether the envelope was accepted by the leader at all. Individual
    /// transactions can still be rejected by their preconditions.
    pub accepted: bool,
    /// Commit index per transaction, aligned with the envelope. Zero means
    /// the transaction's preconditions failed (or it was a read).
    pub indices: Vec<u64>,
    /// Read-transaction results, aligned with the envelope; `Null` for
    /// write transactions. Each result is an object mirroring the full path
    /// of every requested key.
    pub results: Vec<Value>,
}

impl WriteResult {
    /// Commit index of the transaction at `position`, zero when rejected.
    pub fn index(&self, position: usize) -> u64 {
        self.indices.get(position).copied().unwrap_or(0)
    }
}

/// Access to the consensus store, as seen from inside the agency process.
///
/// Reads return owned snapshot copies: implementations take the consensus
/// layer's read lock, copy the requested subtree, and release the lock before
/// returning, so callers never hold store locks across ticks.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Committed state below `prefix`. Missing prefixes read as empty trees.
    async fn read_snapshot(&self, prefix: &str) -> Result<Node, AgencyError>;

    /// Leader-local uncommitted state below `prefix` (heartbeat buffer).
    async fn read_transient(&self, prefix: &str) -> Result<Node, AgencyError>;

    /// Submit a conditional envelope for replication.
    async fn submit_write(&self, envelope: Envelope) -> Result<WriteResult, AgencyError>;

    /// Submit a conditional envelope and wait until its writes are
    /// replicated to a quorum. Returns whether replication was confirmed.
    async fn submit_write_and_wait(&self, envelope: Envelope) -> Result<bool, AgencyError>;

    /// Leader-local write; never replicated, dropped on leadership change.
    async fn submit_transient(&self, envelope: Envelope) -> Result<(), AgencyError>;

    fn is_leader(&self) -> bool;

    /// How long the local agent has been leading; zero when not leading.
    fn leader_for(&self) -> Duration;

    /// Whether post-election leadership preparation has finished and the
    /// local snapshot is known to be up to date.
    fn prepare_leadership_done(&self) -> bool;
}
