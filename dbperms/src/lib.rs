//! dbperms - row-level permission predicate injection for SQL statements
//!
//! Statements pass through an interceptor chain; the permission interceptor
//! resolves the policy declared for the executing operation and rewrites the
//! SQL with the matching row filters before the host executes it.

pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod hooks;
pub mod policy;
pub mod registry;
pub mod sql_rewrite;
