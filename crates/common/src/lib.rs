//! Common utilities for the virtual host controller
//!
//! This crate provides functionality shared by the controller core and its
//! tests: the error taxonomy with its mapping onto wire error codes, logging
//! setup, and test helpers.

pub mod error;
pub mod logging;
pub mod test_utils;

pub use error::{Error, NetworkFailure, Result};
pub use logging::setup_logging;
