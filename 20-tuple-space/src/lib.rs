//! Replicated Linda-style tuple space.
//!
//! Clients talk to a single coordinator (the frontend), which fans every
//! operation out to a fixed set of replicas and aggregates their replies.
//! Each replica keeps a full copy of the space; there is no central sequencer.
//!
//! # Architecture
//!
//! - **Replica**: a [`store::TupleStore`] behind a [`replica::ReplicaServer`].
//!   Every mutation runs inside the replica's own critical section, and blocking
//!   READ/TAKE/lock calls park until a PUT wakes them.
//! - **Coordinator**: [`coordinator::Coordinator`] issues concurrent calls to the
//!   replicas through [`transport::ReplicaClient`] and waits on the
//!   [`collector::ResponseCollector`] for exactly as many replies as the operation
//!   needs.
//! - **TAKE**: two voter replicas, picked from the client id, reserve candidate
//!   tuples for the client. Only a tuple reserved at *both* voters may be removed,
//!   and removal is then applied at every replica.
//!
//! # Modules
//!
//! - [`tuple`]: patterns and tuple validation
//! - [`store`]: per-replica blocking store with per-tuple lock state
//! - [`message`]: JSON-line wire protocol
//! - [`replica`]: replica service and TCP server
//! - [`transport`]: coordinator-to-replica calls (TCP or in-process)
//! - [`collector`]: ledger of asynchronous replies with "wait for N"
//! - [`topology`]: replica set and voter pairs
//! - [`config`]: coordinator tuning knobs
//! - [`coordinator`]: PUT/READ/TAKE/DUMP orchestration
//! - [`frontend`]: client-facing server and typed client
//! - [`protocol`], [`client`], [`cli`]: the interactive shell and command line

pub mod cli;
pub mod client;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod frontend;
pub mod message;
pub mod protocol;
pub mod replica;
pub mod store;
pub mod topology;
pub mod transport;
pub mod tuple;

/// Identifies a client of the tuple space. Drives voter selection for TAKE.
pub type ClientId = u64;

/// Position of a replica in the fixed replica list (0-based).
pub type ReplicaId = usize;

/// Logical client-visible operation, unique per coordinator instance.
pub type RequestId = u64;

/// Locking round within one TAKE. Every other operation uses round 0.
pub type RetryId = u32;
