pub mod config;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod kv_cache;
pub mod layers;
pub mod loader;
pub mod models;
pub mod multimodal;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::XttsGptConfig;
pub use error::{ModelError, Result};
