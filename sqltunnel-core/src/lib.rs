//! Stateful resource-session layer that tunnels SQL driver calls to a
//! DuckDB backend over Arrow Flight.

pub mod breaker;
pub mod capability;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod lob;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod service;
pub mod session;
pub mod sql;
pub mod value;

pub use config::ServerConfig;
pub use error::ServerError;
pub use service::{ProtocolService, TunnelFlightService};
