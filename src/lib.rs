//! Batch Salesforce → MySQL synchronization pipeline.
//!
//! Each configured job authenticates against the Salesforce REST API, pulls
//! a paginated SOQL result set, flattens the nested records into a tabular
//! frame, optionally enriches rows through the Desktop inventory API, and
//! loads the frame into a warehouse table in chunked transactions.

pub mod config;
pub mod enrich;
pub mod job;
pub mod jobs;
pub mod model;
pub mod normalize;
pub mod report;
pub mod retry;
pub mod salesforce;
pub mod warehouse;
