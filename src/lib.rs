//! Session-oriented, concurrent LLM inference behind a C plugin ABI.
//!
//! A [`Backend`] turns one loaded model and its KV cache into a multi-session
//! service: bounded admission, a priority queue with a worker thread for
//! overflowing turns, idle/LRU session eviction, context shifting and
//! pressure-driven cache cleanup, and hot model swaps with automatic restore.
//!
//! The native engine sits behind [`engine::InferenceEngine`]. With the
//! default `candle` feature, [`engine::candle::CandleEngine`] runs GGUF Llama
//! and Qwen2 models and [`ffi`] exports the C entry points.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
#[cfg(feature = "candle")]
pub mod ffi;
pub mod gate;
pub mod logging;
pub mod memory;
pub mod model;
pub mod queue;
pub mod session;

pub use backend::{Backend, BackendOptions, BackendStatus, Submission, TaskTicket};
pub use config::BackendConfig;
pub use error::{BackendError, ErrorCode, Result};
pub use session::SessionId;

pub fn backend_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
