//! Axum route handlers.
//!
//! - [`research`]: one-click link ingestion (`GET /research`)

pub mod research;
