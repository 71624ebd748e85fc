//! Testing utilities and mock implementations
//!
//! Doubles for the bridge's external collaborators, usable from unit tests
//! and from the integration tests under `tests/`.

pub mod mocks;

pub use mocks::*;
