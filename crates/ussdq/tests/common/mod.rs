//! Shared test utilities for ussdq integration tests.
//!
//! This module provides:
//! - `TestQueue` wiring a store, executor and poller together
//! - `ScriptedBackend` with canned replies and an optional release gate
//! - `FlakyStore` for injecting read and subscription failures

pub mod harness;

pub use harness::{settle, FlakyStore, ScriptedBackend, TestQueue, POLL_INTERVAL};
