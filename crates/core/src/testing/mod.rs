//! Shared test utilities for slotserve-core.
//!
//! Enabled for unit tests and, through the `test-utils` feature, for
//! integration tests and downstream crates.

mod mock_backend;

pub use mock_backend::{MockAdapter, MockBackend, MockContext};
