//! Agency store client primitives.
//!
//! The agency is the replicated key/value store that acts as the cluster's
//! source of truth. This crate provides the pieces higher layers need to talk
//! to it: a path-addressed read-only [`Node`] view over a store snapshot, the
//! conditional [`Envelope`] write model, the [`Agent`] trait the supervision
//! layer consumes, and an in-memory agent used for tests and single-process
//! embeddings.

mod client;
mod error;
mod memory;
mod node;
mod transaction;

pub use client::{Agent, WriteResult};
pub use error::AgencyError;
pub use memory::MemoryAgent;
pub use node::{normalize_path, Node};
pub use transaction::{
    Envelope, Operation, Precondition, Transaction, TransactionBuilder, WriteTransaction,
};
