//! Status module
//!
//! Read-only HTTP views over the relay registry.

pub mod handlers;

pub use handlers::CurrentStatusResponse;
