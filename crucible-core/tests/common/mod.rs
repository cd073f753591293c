//! A deterministic in-memory backend for exercising the facade.
//!
//! Tokenization is one token per byte. After evaluation the logits put
//! nearly all mass on a single "target" token that walks the printable
//! ASCII range, so generation is fully predictable: ..., 'A', 'B', 'C', ...
//! wrapping from '_' back to ' '. A configurable stride makes the model
//! emit end-of-text whenever the context length is a multiple of it.

#![allow(dead_code)]

use std::fs::File;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::rngs::StdRng;

use crucible_core::backend::{BackendDescriptor, BackendModule, Model, Token};
use crucible_core::{dispatch, BackendRegistry, Error, Result, SessionParams};

pub const MOCK_MAGIC: u32 = u32::from_le_bytes(*b"MOCK");
pub const MOCK_EOT: Token = 0;
pub const VOCAB: usize = 256;

#[derive(Default)]
pub struct MockBackend {
    /// Total tokens fed across every model this module constructed.
    pub fed: Arc<AtomicUsize>,
    /// Emit end-of-text whenever the context length is a multiple of this.
    pub eot_stride: Option<usize>,
    /// Advertise (and stub) the adaptive sampler.
    pub mirostat: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_eot_stride(stride: usize) -> Self {
        Self {
            eot_stride: Some(stride),
            ..Self::default()
        }
    }

    pub fn with_mirostat() -> Self {
        Self {
            mirostat: true,
            ..Self::default()
        }
    }

    pub fn fed_tokens(&self) -> usize {
        self.fed.load(Ordering::SeqCst)
    }
}

impl BackendModule for MockBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor {
            name: "mock",
            is_fallback: false,
        }
    }

    fn identify(&self, header: &[u8]) -> bool {
        crucible_core::backend::magic(header) == Some(MOCK_MAGIC)
    }

    fn construct(
        &self,
        _path: &Path,
        _file: File,
        _params: &SessionParams,
    ) -> Result<Box<dyn Model>> {
        Ok(Box::new(MockModel {
            history: Vec::new(),
            logits: vec![0.0; VOCAB],
            mem_per_token: 0,
            fed: self.fed.clone(),
            eot_stride: self.eot_stride,
            mirostat: self.mirostat,
        }))
    }
}

pub struct MockModel {
    history: Vec<Token>,
    logits: Vec<f32>,
    mem_per_token: usize,
    fed: Arc<AtomicUsize>,
    eot_stride: Option<usize>,
    mirostat: bool,
}

impl MockModel {
    fn target(&self) -> usize {
        if let Some(stride) = self.eot_stride {
            if !self.history.is_empty() && self.history.len() % stride == 0 {
                return MOCK_EOT as usize;
            }
        }
        let last = self.history.last().copied().unwrap_or(31);
        (32 + (i64::from(last) - 31).rem_euclid(64)) as usize
    }

    fn refresh_logits(&mut self) {
        let target = self.target();
        for (id, logit) in self.logits.iter_mut().enumerate() {
            *logit = -((id as f32) - (target as f32)).abs() * 0.01;
        }
        self.logits[target] = 10.0;
    }
}

impl Model for MockModel {
    fn evaluate(&mut self, tokens: &[Token], past: usize, _n_threads: u32) -> Result<()> {
        self.history.truncate(past);
        self.history.extend_from_slice(tokens);
        self.fed.fetch_add(tokens.len(), Ordering::SeqCst);
        if self.mem_per_token == 0 {
            self.mem_per_token = 64;
        }
        self.refresh_logits();
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn tokenize(&self, text: &str, _first: bool) -> Result<Vec<Token>> {
        Ok(text.bytes().map(Token::from).collect())
    }

    fn token_text(&self, token: Token) -> Result<String> {
        u8::try_from(token)
            .map(|byte| (byte as char).to_string())
            .map_err(|_| Error::EvalFailed(format!("token {token} outside mock vocabulary")))
    }

    fn eot(&self) -> Option<Token> {
        Some(MOCK_EOT)
    }

    fn mem_per_token(&self) -> usize {
        self.mem_per_token
    }

    fn state_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(self.history.len() as u32)?;
        for &token in &self.history {
            out.write_i32::<LittleEndian>(token)?;
        }
        for &logit in &self.logits {
            out.write_f32::<LittleEndian>(logit)?;
        }
        Ok(out)
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<()> {
        let mut input = Cursor::new(bytes);
        let history_len = input.read_u32::<LittleEndian>()? as usize;
        let mut history = Vec::with_capacity(history_len);
        for _ in 0..history_len {
            history.push(input.read_i32::<LittleEndian>()?);
        }
        let mut logits = vec![0.0f32; VOCAB];
        for logit in &mut logits {
            *logit = input.read_f32::<LittleEndian>()?;
        }
        self.history = history;
        self.logits = logits;
        Ok(())
    }

    fn mirostat_available(&self) -> bool {
        self.mirostat
    }

    fn mirostat_sample(
        &mut self,
        _params: &SessionParams,
        _rng: &mut StdRng,
    ) -> Option<Result<Token>> {
        self.mirostat.then(|| Ok(b'*' as Token))
    }
}

/// Registry holding just the given backend.
pub fn registry_with(backend: MockBackend) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(backend));
    registry
}

/// Register a plain mock in the global registry, once per test binary.
pub fn ensure_global_mock() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        dispatch::global().write().register(Arc::new(MockBackend::new()));
    });
}

/// A unique scratch directory under the system temp dir.
pub fn scratch_dir(tag: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "crucible-test-{}-{}-{}",
        std::process::id(),
        tag,
        COUNTER.fetch_add(1, Ordering::SeqCst),
    ));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

/// Write a file the mock backend identifies.
pub fn mock_model_file(dir: &Path) -> PathBuf {
    let path = dir.join("weights.mock");
    let mut file = File::create(&path).expect("create mock model file");
    file.write_all(&MOCK_MAGIC.to_le_bytes()).unwrap();
    file.write_all(&1u32.to_le_bytes()).unwrap();
    path
}

/// Printable-ASCII prompt of the given byte length.
pub fn ascii_prompt(len: usize) -> String {
    (0..len).map(|i| ((i % 64) as u8 + 32) as char).collect()
}

/// Callback that cancels after allowing `budget` ticks.
pub fn budget_ticks(budget: usize) -> impl FnMut(&str) -> bool {
    let mut remaining = budget;
    move |_: &str| {
        if remaining == 0 {
            return false;
        }
        remaining -= 1;
        remaining > 0
    }
}
