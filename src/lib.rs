//! Batch Skip-Trace Enrichment Engine
//!
//! This library orchestrates batch contact enrichment against a skip-trace
//! provider: deduplicating input identities, submitting bounded chunks,
//! tracking asynchronous jobs to completion, annotating compliance flags,
//! and rejoining results onto the original rows in input order.
//!
//! # Modules
//!
//! - `breaker`: Circuit breaker guarding provider submissions.
//! - `compliance`: Phone verification, DNC, and TCPA annotation stages.
//! - `config`: Configuration management.
//! - `cost`: Dry-run and post-hoc billing estimates.
//! - `dedup`: Identity deduplication with safety degradation.
//! - `engine`: The run orchestrator.
//! - `errors`: Error handling types.
//! - `flatten`: Nested result to fixed slot-column projection.
//! - `jobs`: Asynchronous job lifecycle tracking.
//! - `models`: Core data models.
//! - `name_match`: Fuzzy name matching and scoring.
//! - `provider`: Skip-trace provider HTTP client.
//! - `rejoin`: Result rejoining onto input rows.
//! - `webhook`: Push-delivery receiver and routing registry.

pub mod breaker;
pub mod compliance;
pub mod config;
pub mod cost;
pub mod dedup;
pub mod engine;
pub mod errors;
pub mod flatten;
pub mod jobs;
pub mod models;
pub mod name_match;
pub mod provider;
pub mod rejoin;
pub mod webhook;

pub use engine::{EnrichmentEngine, RunOutcome, RunSummary};
pub use errors::EngineError;
