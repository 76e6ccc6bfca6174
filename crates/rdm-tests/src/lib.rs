//! Integration tests for the reliable-datagram engine
//!
//! Drives pairs of simulated endpoints through full exchanges: protocol
//! selection, ordering under reordered delivery, RNR and device faults,
//! peer churn and property-based sequences.

pub mod harness;

pub use harness::{data_for, event_for, pattern, test_config, TestPair, SETTLE_ROUNDS};

#[cfg(test)]
mod proptest_protocol;
#[cfg(test)]
mod scenario_tests;
