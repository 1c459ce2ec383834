//! Core library for `quorum`.
//!
//! Implements the orchestration protocol that sits above an HA vault cluster:
//! splitting the master secret among recipient identities, distributing one
//! encrypted share per recipient, coordinating the per-node unseal, rolling
//! gossip/TLS material out to every node, and sequencing the whole bootstrap.
//!
//! The storage engine, the consensus store, and the transport to nodes are
//! external collaborators reached through the traits in [`backend`]. The
//! [`local`] module provides an in-process implementation of all of them for
//! tests and demos.

pub mod backend;
pub mod barrier;
pub mod bootstrap;
pub mod cluster;
pub mod crypto;
pub mod distribution;
pub mod error;
pub mod identity;
pub mod local;
pub mod node;
pub mod policy;
pub mod rollout;
pub mod seal;
pub mod splitter;
pub mod tls;
pub mod unseal;
