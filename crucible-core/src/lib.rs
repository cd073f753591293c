//! Crucible Core - unified inference facade for autoregressive language models
//!
//! This crate implements the model-agnostic half of an inference stack:
//! - Streaming token generation with sliding-context management
//! - Runtime backend dispatch by model-file magic, with a designated fallback
//! - A fixed-capacity session pool with LRU eviction to per-slot files
//! - Snapshot, restore and stream serialization of live sessions
//!
//! Concrete model implementations live behind the [`backend`] traits and are
//! either registered directly or discovered as shared libraries at runtime.

pub mod backend;
pub mod dispatch;
pub mod dynamic;
pub mod error;
pub mod params;
pub mod pool;
pub mod sampler;
pub mod session;

pub use backend::{BackendDescriptor, BackendModule, Model, Token};
pub use dispatch::BackendRegistry;
pub use dynamic::DynamicBackend;
pub use error::{Error, Result};
pub use params::{MirostatMode, SessionParams};
pub use pool::InferencePool;
pub use sampler::Sampler;
pub use session::{Session, Snapshot};
