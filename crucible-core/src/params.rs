//! Session configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which adaptive sampler to prefer when the backend offers one.
///
/// A session silently falls back to top-k/top-p sampling when the backend
/// does not support the requested mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MirostatMode {
    #[default]
    Off,
    V1,
    V2,
}

/// Parameters for a single inference session, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    /// RNG seed. 0 derives a seed from the wall clock at construction.
    pub seed: u32,
    /// Worker threads handed to the backend. 0 means half the hardware
    /// concurrency.
    pub n_threads: u32,
    /// Context window, in tokens.
    pub n_ctx: u32,
    /// Prefix held fixed across scrolls. Must be smaller than `n_ctx`.
    pub n_ctx_window_top_bar: u32,
    /// Tokens per evaluation batch.
    pub n_batch: u32,
    /// How far back the repetition penalty looks.
    pub n_repeat_last: u32,
    /// 1.0 disables the penalty.
    pub repeat_penalty: f32,
    /// End-of-text tokens to swallow before stopping generation.
    pub n_eos_ignores: u32,
    /// Enables the post-bar retention branch on context overflow when
    /// non-zero; 0.0 drops everything after the top bar.
    pub scroll_keep: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub temp: f32,
    pub mirostat_learning_rate: f32,
    pub mirostat_target_entropy: f32,
    pub prefer_mirostat: MirostatMode,
    /// Backend hint: layers to offload to the GPU.
    pub n_gpu_layers: u32,
    /// Backend hint: lock weights in memory.
    pub use_mlock: bool,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            seed: 0,
            n_threads: 0,
            n_ctx: 2012,
            n_ctx_window_top_bar: 0,
            n_batch: 8,
            n_repeat_last: 0,
            repeat_penalty: 1.0,
            n_eos_ignores: 0,
            scroll_keep: 0.0,
            top_k: 40,
            top_p: 0.9,
            temp: 0.72,
            mirostat_learning_rate: 0.1,
            mirostat_target_entropy: 5.0,
            prefer_mirostat: MirostatMode::Off,
            n_gpu_layers: 0,
            use_mlock: true,
        }
    }
}

impl SessionParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_ctx == 0 {
            return Err(Error::InvalidArgument("n_ctx must be positive".into()));
        }
        if self.n_ctx_window_top_bar >= self.n_ctx {
            return Err(Error::InvalidArgument(
                "n_ctx_window_top_bar must be smaller than n_ctx".into(),
            ));
        }
        if self.n_batch == 0 {
            return Err(Error::InvalidArgument("n_batch must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.scroll_keep) {
            return Err(Error::InvalidArgument(
                "scroll_keep must lie in [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Replaces the 0 placeholders with concrete values.
    pub(crate) fn resolve(&mut self) {
        if self.seed == 0 {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(1);
            self.seed = (now as u32).max(1);
        }
        if self.n_threads == 0 {
            let hw = std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(2);
            self.n_threads = (hw / 2).max(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = SessionParams::default();
        assert_eq!(params.n_ctx, 2012);
        assert_eq!(params.n_batch, 8);
        assert_eq!(params.top_k, 40);
        assert_eq!(params.top_p, 0.9);
        assert_eq!(params.temp, 0.72);
        assert_eq!(params.prefer_mirostat, MirostatMode::Off);
        assert!(params.use_mlock);
        params.validate().unwrap();
    }

    #[test]
    fn test_top_bar_must_fit() {
        let params = SessionParams {
            n_ctx: 16,
            n_ctx_window_top_bar: 16,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_zero_batch_rejected() {
        let params = SessionParams {
            n_batch: 0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_resolve_fills_placeholders() {
        let mut params = SessionParams::default();
        params.resolve();
        assert_ne!(params.seed, 0);
        assert_ne!(params.n_threads, 0);
    }

    #[test]
    fn test_resolve_keeps_explicit_values() {
        let mut params = SessionParams {
            seed: 42,
            n_threads: 3,
            ..Default::default()
        };
        params.resolve();
        assert_eq!(params.seed, 42);
        assert_eq!(params.n_threads, 3);
    }
}
