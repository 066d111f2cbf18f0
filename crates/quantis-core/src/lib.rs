//! # quantis-core
//!
//! Configuration schema, error taxonomy, and shared identifiers for the
//! Quantis regime-detection and decision engine.

pub mod config;
pub mod error;
pub mod ids;

pub use config::Config;
pub use error::QuantisError;
pub use ids::Instrument;
