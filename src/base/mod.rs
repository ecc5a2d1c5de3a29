//! Base types and error handling.
//!
//! Provides the foundational pieces shared by every layer:
//! - [`NetError`]: the single error taxonomy of the crate

pub mod neterror;

pub use neterror::NetError;
