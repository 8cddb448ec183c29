//! Shared fixtures for WEFT integration tests.

pub mod fixtures;
pub mod test_helpers;
