//! Integration tests for switchyard.
//!
//! Every test drives a real [`DispatchRuntime`](switchyard_core::runtime::DispatchRuntime)
//! over the in-process loopback transport, so no network is needed.
//!
//! - `regulation_scenario_tests`: endpoints regulated on failure and probed back to normal
//! - `routing_tests`: direct-URL short circuit, group merging, elastic connection subsets
//! - `filter_chain_tests`: filter ordering, request mutation, rejection and async observers
//! - `invocation_mode_tests`: future, callback and oneway calls, timeouts and retries
//! - `connection_tests`: idempotent dialing and liveness eviction
//! - `runtime_tests`: configuration loading, consumer references and shutdown
//! - `support`: shared fixtures
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package tests
//! ```

pub mod support;

#[cfg(test)]
mod regulation_scenario_tests;

#[cfg(test)]
mod routing_tests;

#[cfg(test)]
mod filter_chain_tests;

#[cfg(test)]
mod invocation_mode_tests;

#[cfg(test)]
mod connection_tests;
