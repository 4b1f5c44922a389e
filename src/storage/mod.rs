//! Storage subsystem: policy gating (C4), the async priority queue (C5), and
//! the sqlx repositories (part of the ambient persistence layer).

pub mod policy;
pub mod queue;
pub mod repo;
