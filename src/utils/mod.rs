//! Utility functions and helpers.

#[cfg(feature = "http")]
pub mod http;
pub mod time;
