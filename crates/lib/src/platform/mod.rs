//! Platform-specific paths and filesystem permissions.

pub mod immutable;
pub mod paths;
