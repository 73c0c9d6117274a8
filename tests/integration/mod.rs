//! Integration test suite for handover
//!
//! End-to-end tests that drive the `handover` binary against temporary
//! installation directories. No test needs network access.
//!
//! # Running Integration Tests
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//!
//! - **common**: Installation fixtures and the command builder
//! - **config**: Configuration loading failures
//! - **rollback**: Restoring the previous version
//! - **status**: State reporting
//! - **unpack**: The successor entry point

mod common;
mod config;
mod rollback;
mod status;
mod unpack;
