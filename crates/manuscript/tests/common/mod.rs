//! Shared test utilities for manuscript integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs against a temp SQLite file and stub providers
//! - Builders for planner replies, pipeline configs and seeded jobs

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{RecordingProgress, TestHarness};
