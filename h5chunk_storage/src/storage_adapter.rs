//! Storage adapters.
//!
//! Storage adapters can be layered on block stores.

pub mod performance_metrics;
