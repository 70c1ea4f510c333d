//! HTTP surface of the ingestion side.

pub mod handlers;
