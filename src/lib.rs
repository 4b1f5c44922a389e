//! Batch job orchestration and data-collection platform for
//! weather/tourism recommendations (`spec.md` §1).

pub mod api;
pub mod archival;
pub mod cache;
pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod keypool;
pub mod monitor;
pub mod providers;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod telemetry;
pub mod ttl;
pub mod ws;

pub use error::{OrchestratorError, Result};
