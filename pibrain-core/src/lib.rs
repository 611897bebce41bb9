//! # pibrain-core
//!
//! Core library for pi-brain - a background knowledge-graph daemon for AI
//! coding-agent session logs.
//!
//! This library provides:
//! - Domain types for nodes, edges, jobs, and aggregated insights
//! - Database storage layer with SQLite (relational rows + dual-write JSON)
//! - The job queue, session watcher, analysis worker pipeline
//! - Connection discovery and pattern/insight aggregation
//! - A cron-driven scheduler for recurring maintenance jobs
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! A session watcher segments incoming session logs into boundary-detected
//! windows and enqueues analysis jobs. Workers invoke an external analyzer
//! binary, persist results as both SQLite rows and JSON files under the data
//! directory, and the connection discoverer and aggregators run on a cron
//! schedule to enrich the resulting graph.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pibrain_core::{Config, StorageEngine};
//!
//! let config = Config::load().expect("failed to load config");
//! let db = StorageEngine::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! ```

pub use config::Config;
pub use db::StorageEngine;
pub use error::{ClassifiedError, Error, ErrorCategory, Result};
pub use types::*;

pub mod aggregate;
pub mod config;
pub mod db;
pub mod discovery;
pub mod embedding;
pub mod error;
pub mod ids;
pub mod logging;
pub mod queue;
pub mod scheduler;
pub mod types;
pub mod watcher;
pub mod worker;
