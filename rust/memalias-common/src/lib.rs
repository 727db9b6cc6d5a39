//! Core definitions (error type and verification helpers), relied upon by all memalias-* crates.

pub mod error;
pub mod result;

pub use result::Result;
