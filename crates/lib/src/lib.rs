//! kiln-lib: a content-addressed build engine.
//!
//! A [`recipe::RecipeGraph`] describes how to produce artifacts from other
//! artifacts. The [`engine::Engine`] realizes the graph against a
//! [`store::Store`]: every recipe's outputs are reused from an earlier
//! result, fetched from a [`substitute::Substituter`], or built by the
//! [`sandbox::SandboxedExecutor`], with independent recipes running in
//! parallel. Store paths are locked per path ([`lock`]), so several
//! processes can share one store, and [`gc`] reclaims whatever no root
//! reaches.

pub mod config;
pub mod consts;
pub mod engine;
pub mod gc;
pub mod lock;
pub mod placeholder;
pub mod platform;
pub mod recipe;
pub mod sandbox;
pub mod scheduler;
pub mod signal;
pub mod store;
pub mod substitute;
pub mod util;

pub use engine::Engine;
