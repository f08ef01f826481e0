//! Sift: search and indexing layer for annotated datasets over an
//! Elasticsearch-compatible backend.

pub mod bulk;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod query;
pub mod schema;
pub mod server;
pub mod types;
