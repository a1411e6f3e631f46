//! Shared infrastructure for the fleet services: broker adapters, database
//! pool construction, circuit breaker, health/metrics HTTP server, config
//! loading, and shutdown plumbing.
//!
//! Nothing here is service-specific; each service composes these pieces in
//! its own `main`.

pub mod breaker;
pub mod broker;
pub mod config;
pub mod db;
pub mod health;
pub mod shutdown;

pub use breaker::{BreakerState, CircuitBreaker};
pub use broker::{BrokerError, BrokerPublisher, LapinBroker, MemoryBroker};
pub use config::{BrokerConfig, ConfigError, DatabaseConfig, LoggingConfig};
pub use health::Readiness;
pub use shutdown::ShutdownHandle;
