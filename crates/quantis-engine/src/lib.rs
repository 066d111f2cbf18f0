//! # quantis-engine
//!
//! Real-time multi-venue tick ingestion, time-varying HMM regime detection
//! with Student-t emissions, SPRT-based hypothesis evaluation, Kelly
//! position sizing, and signal dispatch.

pub mod checkpoint;
pub mod decision;
pub mod dispatch;
pub mod features;
pub mod hmm;
pub mod hypothesis;
pub mod kalman;
pub mod linalg;
pub mod orchestrator;
pub mod replay;
pub mod sizing;
pub mod studentt;
pub mod tick;
pub mod venues;

pub use orchestrator::{InstrumentHealth, Orchestrator, PosteriorRegistry};
