//! Core rule reconciliation engine
//!
//! Leaves first:
//!
//! - [`error`]: Error types shared by every layer
//! - [`property`]: Property vocabulary and per-family syntax tables
//! - [`canonical`]: Value canonicalization for addresses, ports, states, marks
//! - [`rule`]: Provider-agnostic rule model and divergence checks
//! - [`parser`]: Dump text → rules
//! - [`serializer`]: Rules → argument vectors
//! - [`position`]: Insert-position resolution from name order
//! - [`backend`]: Command execution and persistence per family
//! - [`enumerator`]: Live rule snapshots
//! - [`rule_constraints`]: Field-combination rules for desired rules
//! - [`manifest`]: Desired-state documents
//! - [`chain`]: Chain create/destroy/policy across families
//! - [`reconcile`]: The convergence driver

pub mod backend;
pub mod canonical;
pub mod chain;
pub mod enumerator;
pub mod error;
pub mod manifest;
pub mod parser;
pub mod position;
pub mod property;
pub mod reconcile;
pub mod rule;
pub mod rule_constraints;
pub mod serializer;

#[cfg(test)]
pub mod test_helpers;
