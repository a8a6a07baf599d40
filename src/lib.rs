//! quarry - federated query execution over tables, knowledge bases and models
//!
//! This crate provides:
//! - A planner turning parsed statements into step DAGs with filter pushdown
//! - A bounded-parallel executor with in-memory relational operators
//! - Vector knowledge bases (in-memory or Qdrant) with hybrid ranking
//! - A batching, rate-limited inference gateway for models and agents
//! - A tick-driven job scheduler with watermarks persisted in SQLite

pub mod ast;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod embed;
pub mod embedding_backend;
pub mod engine;
pub mod error;
pub mod exec;
pub mod inference;
pub mod kb;
pub mod plan;
pub mod progress;
pub mod rank;
pub mod registry;
pub mod rerank;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod value;
pub mod vector;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use engine::{Engine, StatementOutcome};
pub use error::{Error, Result};
