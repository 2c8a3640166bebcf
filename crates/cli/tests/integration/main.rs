//! End-to-end tests driving the `kiln` binary against a temporary store.

mod common;

#[cfg(unix)]
mod build_tests;
mod store_tests;
