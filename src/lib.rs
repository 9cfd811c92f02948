//! fwconverge - declarative convergence for iptables-family firewalls
//!
//! Reads the live rule set through the save tools, compares it against a
//! declared manifest and issues the minimal insert/replace/delete commands to
//! converge, keeping rules of a chain in ascending name order.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, dump parser, serializer, reconciler, chain manager
//! - [`audit`] - Audit logging for all mutating operations
//! - [`validators`] - Input validation for declared values
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Privilege escalation for the firewall tools
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Desired rules are validated before any command runs
//! - Commands are built as argument vectors, never through a shell
//! - Only configured firewall tools may be run with privileges
//! - Persisted rule files are written with 0600 permissions
//! - A failed persist is reported separately from a failed change

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::manifest::Manifest;
pub use core::property::Family;
pub use core::reconcile::{Outcome, Reconciler};
pub use core::rule::{Action, Rule};
