//! service-core: shared infrastructure for the Med Vision gateway.
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod retry;
