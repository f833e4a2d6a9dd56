//! Shared test utilities for xtts-core.
//!
//! A tiny decoder configuration and a deterministic checkpoint for it, used by
//! unit tests and the integration tests under `tests/`.

mod tiny_config;
mod weights;

pub use tiny_config::tiny_config;
pub use weights::{full_weight_set, tiny_model};
