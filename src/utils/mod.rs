//! The `utils` module provides definitions shared across the `pubhub` crate:
//! the error types every layer reports through, and logging setup.

pub mod error;
pub mod logging;
