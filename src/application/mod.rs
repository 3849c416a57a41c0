//! Wiring used by the binary and by request handlers of the feature service.

pub mod conditional;
pub mod context;
pub mod error;
