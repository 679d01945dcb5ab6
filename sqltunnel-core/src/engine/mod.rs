//! DuckDB execution layer.
//!
//! This module provides:
//! - `DuckDbConnection`: pooled connection wrapper with query execution
//! - `cells`: Arrow cell decoding and SQL type names for result sets

pub mod cells;
pub mod connection;

pub use connection::{quote_identifier, DuckDbConnection, QueryResult};
