//! Candle-backed GGUF backend for crucible.
//!
//! Identifies GGUF model files by magic and serves them with candle's
//! quantized llama implementation. Register it statically with
//! [`CandleBackend::new`], or build the cdylib and drop it into the
//! directory named by `CRUCIBLE_BACKEND_PATH` to have the facade discover
//! it at runtime.

mod model;

use std::fs::File;
use std::ops::RangeInclusive;
use std::path::Path;

use crucible_core::backend::{self, BackendDescriptor, BackendModule, Model};
use crucible_core::{Result, SessionParams};

pub use model::CandleModel;

/// "GGUF" read as a little-endian word.
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// GGUF container versions this backend accepts.
pub const GGUF_VERSIONS: RangeInclusive<u32> = 1..=3;

/// The backend module. `fallback` controls whether the dispatcher treats it
/// as the catch-all for unidentified files.
pub struct CandleBackend {
    fallback: bool,
}

impl CandleBackend {
    pub fn new() -> Self {
        Self { fallback: false }
    }

    /// A copy registered as the process fallback.
    pub fn fallback() -> Self {
        Self { fallback: true }
    }
}

impl Default for CandleBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendModule for CandleBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor {
            name: "candle-gguf",
            is_fallback: self.fallback,
        }
    }

    fn identify(&self, header: &[u8]) -> bool {
        backend::magic(header) == Some(GGUF_MAGIC)
            && backend::version(header).is_some_and(|v| GGUF_VERSIONS.contains(&v))
    }

    fn construct(
        &self,
        path: &Path,
        file: File,
        params: &SessionParams,
    ) -> Result<Box<dyn Model>> {
        let model = CandleModel::load(path, file, params)?;
        Ok(Box::new(model))
    }
}

crucible_core::declare_backend!(CandleBackend::fallback());
