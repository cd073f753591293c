//! The backend contract.
//!
//! A backend module identifies model files by their header and constructs the
//! per-session [`Model`] the session core drives. The core has no
//! compile-time knowledge of any concrete backend; everything it needs is in
//! these two traits.

use std::fs::File;
use std::path::Path;

use rand::rngs::StdRng;

use crate::error::Result;
use crate::params::SessionParams;

/// Token id in a model's vocabulary.
pub type Token = i32;

/// Header length the facade reads before dispatch.
pub const HEADER_LEN: usize = 8;

/// 32-bit little-endian magic at offset 0, if the header is long enough.
pub fn magic(header: &[u8]) -> Option<u32> {
    header.get(..4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// 32-bit little-endian version word at offset 4, if present.
pub fn version(header: &[u8]) -> Option<u32> {
    header.get(4..8).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Static facts about a backend module.
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub name: &'static str,
    /// A fallback is consulted only when no other backend claims the file.
    pub is_fallback: bool,
}

/// A loadable backend implementation.
pub trait BackendModule: Send + Sync {
    fn descriptor(&self) -> BackendDescriptor;

    /// Pure predicate over the first bytes of a model file.
    fn identify(&self, header: &[u8]) -> bool;

    /// Build a model from the file. Takes ownership of the already-open
    /// handle; the cursor is at the start of the file.
    fn construct(
        &self,
        path: &Path,
        file: File,
        params: &SessionParams,
    ) -> Result<Box<dyn Model>>;
}

/// Per-session operations the session core calls.
///
/// Evaluation overwrites: feeding positions `[past, past + n)` replaces any
/// state previously held for those positions and invalidates everything
/// after them.
pub trait Model: Send {
    /// Feed `tokens` at positions `[past, past + tokens.len())` and refresh
    /// the logits for the last position.
    fn evaluate(&mut self, tokens: &[Token], past: usize, n_threads: u32) -> Result<()>;

    /// Next-token distribution of the last evaluated position.
    fn logits(&self) -> &[f32];

    /// `first` is set on the first append of a session; leading-space
    /// handling differs between the two cases for some tokenizers.
    fn tokenize(&self, text: &str, first: bool) -> Result<Vec<Token>>;

    /// Text of a single token.
    fn token_text(&self, token: Token) -> Result<String>;

    /// End-of-text token, if the vocabulary advertises one.
    fn eot(&self) -> Option<Token>;

    /// Amortized per-token memory use, measured by the construction-time
    /// probe evaluation.
    fn mem_per_token(&self) -> usize;

    /// Opaque state blob sufficient to resume exactly where the model left
    /// off: cache, logits, whatever the backend keeps internally.
    fn state_bytes(&self) -> Result<Vec<u8>>;

    fn restore_state(&mut self, bytes: &[u8]) -> Result<()>;

    fn mirostat_available(&self) -> bool {
        false
    }

    /// One adaptive sampling step. `None` means unsupported; the session
    /// falls back to top-k/top-p.
    fn mirostat_sample(
        &mut self,
        _params: &SessionParams,
        _rng: &mut StdRng,
    ) -> Option<Result<Token>> {
        None
    }
}
