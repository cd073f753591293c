//! The inference session.
//!
//! A session owns the prompt text, the evaluated token sequence and the
//! sampler, and drives a backend [`Model`] through prompt appending, batched
//! evaluation, sliding-context scrolling and streaming generation. All
//! progress callbacks are cooperative tick points: returning `false` cancels
//! the operation in flight and leaves the session consistent.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info};

use crate::backend::{Model, Token, HEADER_LEN};
use crate::dispatch::{self, BackendRegistry};
use crate::error::{Error, Result};
use crate::params::{MirostatMode, SessionParams};
use crate::sampler::Sampler;

/// Post-bar fraction of the context retained by a scroll.
const SCROLL_RETENTION: f32 = 0.4;

/// Input of the construction-time memory probe.
const PROBE_TOKENS: [Token; 4] = [0, 1, 2, 3];

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// In-memory copy of a session's full state.
///
/// A snapshot can only be restored into the session that produced it.
pub struct Snapshot {
    state: Vec<u8>,
    tokens: Vec<Token>,
    prompt: String,
    origin: u64,
}

impl Snapshot {
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn context_size(&self) -> usize {
        self.tokens.len()
    }
}

/// A live inference session bound to one loaded model.
pub struct Session {
    params: SessionParams,
    model: Box<dyn Model>,
    prompt: String,
    tokens: Vec<Token>,
    /// Tokenized but not yet fed to the backend; left over from a cancelled
    /// operation and drained by the next append or run.
    pending: Vec<Token>,
    sampler: Sampler,
    mem_per_token: usize,
    eot: Option<Token>,
    newline: Option<Token>,
    scroll_callback: Option<Box<dyn FnMut(f32) -> bool + Send>>,
    last_error: Option<String>,
    identity: u64,
}

impl Session {
    /// Open a model file, dispatching to a backend from the global registry.
    pub fn open(path: impl AsRef<Path>, params: SessionParams) -> Result<Self> {
        let registry = dispatch::global().read();
        Self::open_with(&registry, path.as_ref(), params)
    }

    /// Like [`Session::open`], against an explicit registry.
    pub fn open_with(
        registry: &BackendRegistry,
        path: &Path,
        params: SessionParams,
    ) -> Result<Self> {
        params.validate()?;
        let load_failed = |reason: String| Error::LoadFailed {
            path: path.to_path_buf(),
            reason,
        };
        let mut file = File::open(path).map_err(|e| load_failed(e.to_string()))?;
        let mut header = [0u8; HEADER_LEN];
        let got = read_header(&mut file, &mut header).map_err(|e| load_failed(e.to_string()))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| load_failed(e.to_string()))?;
        let backend = registry.select(&header[..got])?;
        info!(
            backend = backend.descriptor().name,
            model = %path.display(),
            "opening session"
        );
        let model = backend.construct(path, file, &params)?;
        Self::from_model(model, params)
    }

    /// Wrap an already-constructed model: seed the RNG, run the memory
    /// probe, resolve the end-of-text token.
    pub fn from_model(mut model: Box<dyn Model>, mut params: SessionParams) -> Result<Self> {
        params.validate()?;
        params.resolve();
        let sampler = Sampler::new(u64::from(params.seed));
        model.evaluate(&PROBE_TOKENS, 0, params.n_threads)?;
        let mem_per_token = model.mem_per_token();
        let eot = model.eot();
        debug!(mem_per_token, ?eot, "session ready");
        Ok(Self {
            params,
            model,
            prompt: String::new(),
            tokens: Vec::new(),
            pending: Vec::new(),
            sampler,
            mem_per_token,
            eot,
            newline: None,
            scroll_callback: None,
            last_error: None,
            identity: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Progress callback for the re-evaluation pass inside a scroll.
    pub fn set_scroll_callback(&mut self, callback: impl FnMut(f32) -> bool + Send + 'static) {
        self.scroll_callback = Some(Box::new(callback));
    }

    /// Tokenize `text` and feed it to the model in batches.
    ///
    /// `on_tick` receives a progress percentage between batches; returning
    /// `false` cancels cleanly: evaluated tokens stay valid, the remainder
    /// waits for the next call. Empty `text` is rejected unless such a
    /// remainder exists, in which case the call resumes it.
    pub fn append(&mut self, text: &str, mut on_tick: impl FnMut(f32) -> bool) -> Result<()> {
        let result = self.append_inner(text, &mut on_tick);
        self.remember(result)
    }

    /// [`Session::append`] without a progress callback.
    pub fn append_text(&mut self, text: &str) -> Result<()> {
        self.append(text, |_| true)
    }

    /// Generate until `end` appears, a callback cancels, or the model emits
    /// end-of-text past the configured tolerance.
    ///
    /// `on_pre_tick` fires after a token's text is accumulated but before it
    /// is evaluated, `on_post_tick` after evaluation. When the end marker
    /// terminates generation it is stripped from the returned string but
    /// kept in the prompt.
    pub fn run(
        &mut self,
        end: &str,
        mut on_pre_tick: impl FnMut(&str) -> bool,
        mut on_post_tick: impl FnMut(&str) -> bool,
    ) -> Result<String> {
        let result = self.run_inner(end, &mut on_pre_tick, &mut on_post_tick);
        self.remember(result)
    }

    /// [`Session::run`] without callbacks.
    pub fn generate(&mut self, end: &str) -> Result<String> {
        self.run(end, |_| true, |_| true)
    }

    /// Number of tokens currently in context.
    pub fn context_size(&self) -> usize {
        self.tokens.len()
    }

    /// The canonical text accumulated so far: every append plus everything
    /// generated.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Amortized per-token memory use measured at construction.
    pub fn mem_per_token(&self) -> usize {
        self.mem_per_token
    }

    pub fn is_mirostat_available(&self) -> bool {
        self.model.mirostat_available()
    }

    /// Message of the most recent failed operation, for callers whose
    /// transport cannot carry structured errors.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Copy the full session state into memory.
    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            state: self.model.state_bytes()?,
            tokens: self.tokens.clone(),
            prompt: self.prompt.clone(),
            origin: self.identity,
        })
    }

    /// Restore a snapshot taken from this session.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        let result = self.restore_inner(snapshot);
        self.remember(result)
    }

    /// Write the session state to `sink` in the little-endian stream format.
    pub fn serialize(&self, sink: &mut dyn Write) -> Result<()> {
        let state = self.model.state_bytes()?;
        sink.write_u32::<LittleEndian>(self.params.n_ctx)?;
        sink.write_u32::<LittleEndian>(self.tokens.len() as u32)?;
        sink.write_u32::<LittleEndian>(self.prompt.len() as u32)?;
        sink.write_u32::<LittleEndian>(state.len() as u32)?;
        for &token in &self.tokens {
            sink.write_i32::<LittleEndian>(token)?;
        }
        sink.write_all(self.prompt.as_bytes())?;
        sink.write_all(&state)?;
        Ok(())
    }

    /// Replace all session state from a stream written by
    /// [`Session::serialize`]. On any read error the session is unchanged.
    pub fn deserialize(&mut self, source: &mut dyn Read) -> Result<()> {
        let result = self.deserialize_inner(source);
        self.remember(result)
    }

    fn append_inner(&mut self, text: &str, on_tick: &mut dyn FnMut(f32) -> bool) -> Result<()> {
        if text.is_empty() && self.pending.is_empty() {
            return Err(Error::InvalidArgument(
                "append requires a non-empty prompt".into(),
            ));
        }
        if !text.is_empty() {
            let first = self.prompt.is_empty();
            let new_tokens = self.model.tokenize(text, first)?;
            self.prompt.push_str(text);
            self.pending.extend(new_tokens);
        }
        self.feed_pending(on_tick)
    }

    fn run_inner(
        &mut self,
        end: &str,
        on_pre_tick: &mut dyn FnMut(&str) -> bool,
        on_post_tick: &mut dyn FnMut(&str) -> bool,
    ) -> Result<String> {
        if self.tokens.is_empty() && self.pending.is_empty() {
            return Err(Error::InvalidArgument(
                "run requires at least one successful append".into(),
            ));
        }
        // Catch up on work a cancelled append left behind
        if !self.pending.is_empty() {
            self.feed_pending(&mut |_| true)?;
        }

        let mut out = String::new();
        let mut cancelled = false;
        let mut eos_count = 0u32;
        while !cancelled && (end.is_empty() || !out.contains(end)) {
            let mut id = self.sample_next()?;
            if self.eot == Some(id) {
                if eos_count == self.params.n_eos_ignores {
                    break;
                }
                eos_count += 1;
                id = self.newline_token()?;
            }
            self.tokens.push(id);
            // a scroll re-primes the cache, new token included
            let scrolled = self.window_scroll()?;

            let piece = self.model.token_text(id)?;
            out.push_str(&piece);
            self.prompt.push_str(&piece);

            if !on_pre_tick(&piece) {
                cancelled = true;
                if !scrolled {
                    // Not evaluated; park it so the cache stays coherent
                    self.tokens.pop();
                    self.pending.push(id);
                }
            } else if !scrolled {
                let past = self.tokens.len() - 1;
                self.model
                    .evaluate(&self.tokens[past..], past, self.params.n_threads)?;
            }
            if !on_post_tick(&piece) {
                cancelled = true;
            }
        }

        if !cancelled && !end.is_empty() {
            if let Some(pos) = out.find(end) {
                out.truncate(pos);
            }
        }
        Ok(out)
    }

    fn restore_inner(&mut self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.origin != self.identity {
            return Err(Error::SnapshotMismatch);
        }
        self.model.restore_state(&snapshot.state)?;
        self.tokens = snapshot.tokens.clone();
        self.prompt = snapshot.prompt.clone();
        self.pending.clear();
        Ok(())
    }

    fn deserialize_inner(&mut self, source: &mut dyn Read) -> Result<()> {
        // Read and check the whole stream before touching any state
        let n_ctx = source.read_u32::<LittleEndian>()?;
        if n_ctx != self.params.n_ctx {
            return Err(Error::ContextMismatch {
                session: self.params.n_ctx,
                stream: n_ctx,
            });
        }
        let token_count = source.read_u32::<LittleEndian>()? as usize;
        let prompt_len = source.read_u32::<LittleEndian>()? as usize;
        let state_len = source.read_u32::<LittleEndian>()? as usize;
        if token_count > n_ctx as usize {
            return Err(Error::invalid_data("token count exceeds context size"));
        }
        let mut tokens = Vec::with_capacity(token_count);
        for _ in 0..token_count {
            tokens.push(source.read_i32::<LittleEndian>()?);
        }
        let mut prompt_bytes = vec![0u8; prompt_len];
        source.read_exact(&mut prompt_bytes)?;
        let prompt = String::from_utf8(prompt_bytes)
            .map_err(|_| Error::invalid_data("prompt is not valid UTF-8"))?;
        let mut state = vec![0u8; state_len];
        source.read_exact(&mut state)?;

        self.model.restore_state(&state)?;
        self.tokens = tokens;
        self.prompt = prompt;
        self.pending.clear();
        Ok(())
    }

    /// Move pending tokens into the context and evaluate them, scrolling
    /// first if the window would overflow.
    fn feed_pending(&mut self, on_tick: &mut dyn FnMut(f32) -> bool) -> Result<()> {
        let start = self.tokens.len();
        self.tokens.append(&mut self.pending);
        if self.window_scroll()? {
            // the scroll already re-primed the cache over the shorter sequence
            return Ok(());
        }
        self.evaluate_tokens(start, on_tick)
    }

    /// Feed `tokens[start..]` to the model: full batches while they last,
    /// then one token at a time. Cancellation parks the unfed remainder in
    /// `pending` and reports success.
    fn evaluate_tokens(&mut self, start: usize, on_tick: &mut dyn FnMut(f32) -> bool) -> Result<()> {
        let total = self.tokens.len() - start;
        if total == 0 {
            return Ok(());
        }
        let n_batch = self.params.n_batch as usize;
        let mut it = start;
        while self.tokens.len() - it >= n_batch {
            let next = it + n_batch;
            self.model
                .evaluate(&self.tokens[it..next], it, self.params.n_threads)?;
            it = next;
            let progress = (it - start) as f32 / total as f32 * 100.0;
            if !on_tick(progress) {
                self.park_unevaluated(it);
                return Ok(());
            }
        }
        while it < self.tokens.len() {
            self.model
                .evaluate(&self.tokens[it..it + 1], it, self.params.n_threads)?;
            it += 1;
        }
        on_tick(100.0);
        Ok(())
    }

    /// Keep `[0, fed)` in context; everything after waits in `pending`.
    fn park_unevaluated(&mut self, fed: usize) {
        let mut rest: Vec<Token> = self.tokens.split_off(fed);
        rest.append(&mut self.pending);
        self.pending = rest;
    }

    /// Bound the context window, re-priming the cache when it overflows.
    ///
    /// Returns whether scrolling happened, in which case every remaining
    /// token has been re-evaluated from position zero.
    fn window_scroll(&mut self) -> Result<bool> {
        let n_ctx = self.params.n_ctx as usize;
        if self.tokens.len() <= n_ctx {
            return Ok(false);
        }
        let top_bar = self.params.n_ctx_window_top_bar as usize;
        if self.params.scroll_keep > 0.0 {
            let keep = ((self.tokens.len() - top_bar) as f32 * SCROLL_RETENTION) as usize;
            let keep = keep.min(n_ctx - top_bar);
            let tail: Vec<Token> = self.tokens[self.tokens.len() - keep..].to_vec();
            self.tokens.truncate(top_bar);
            self.tokens.extend(tail);
        } else {
            self.tokens.truncate(top_bar);
        }
        debug!(len = self.tokens.len(), "scrolled context window");
        let mut callback = self.scroll_callback.take();
        let result = self.evaluate_tokens(0, &mut |progress| {
            callback.as_mut().map_or(true, |cb| cb(progress))
        });
        self.scroll_callback = callback;
        result?;
        Ok(true)
    }

    fn sample_next(&mut self) -> Result<Token> {
        if self.params.prefer_mirostat != MirostatMode::Off && self.model.mirostat_available() {
            if let Some(sampled) = self
                .model
                .mirostat_sample(&self.params, self.sampler.rng_mut())
            {
                return sampled;
            }
        }
        let recent_start = self
            .tokens
            .len()
            .saturating_sub(self.params.n_repeat_last as usize);
        Ok(self.sampler.sample(
            self.model.logits(),
            &self.tokens[recent_start..],
            &self.params,
        ))
    }

    fn newline_token(&mut self) -> Result<Token> {
        if let Some(token) = self.newline {
            return Ok(token);
        }
        let token = self
            .model
            .tokenize("\n", false)?
            .first()
            .copied()
            .ok_or_else(|| Error::EvalFailed("tokenizer produced no newline token".into()))?;
        self.newline = Some(token);
        Ok(token)
    }

    fn remember<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.last_error = Some(err.to_string());
        }
        result
    }
}

fn read_header(file: &mut File, header: &mut [u8]) -> std::io::Result<usize> {
    let mut got = 0;
    while got < header.len() {
        let n = file.read(&mut header[got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    Ok(got)
}
