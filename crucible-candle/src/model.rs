//! GGUF loading and the per-session model state.
//!
//! The cache held by candle's quantized llama cannot be exported, so the
//! state blob carries the fed token history plus the last logits; restoring
//! replays the history through the model to rebuild the cache, then puts
//! the recorded logits back.

use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::quantized_llama::ModelWeights;
use rand::rngs::StdRng;
use rand::Rng;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crucible_core::backend::{Model, Token};
use crucible_core::{Error, MirostatMode, Result, SessionParams};

/// Tokens replayed per forward pass when rebuilding the cache.
const REPLAY_CHUNK: usize = 512;

pub struct CandleModel {
    weights: ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
    logits: Vec<f32>,
    /// Everything fed so far, kept replayable for state restores.
    history: Vec<Token>,
    eot: Option<Token>,
    mem_per_token: usize,
    /// Mirostat v2 running surprise target.
    mirostat_mu: Option<f32>,
}

impl CandleModel {
    pub fn load(path: &Path, mut file: File, params: &SessionParams) -> Result<Self> {
        let fail = |reason: String| Error::LoadFailed {
            path: path.to_path_buf(),
            reason,
        };

        let content = gguf_file::Content::read(&mut file).map_err(|e| fail(e.to_string()))?;
        let arch = content
            .metadata
            .get("general.architecture")
            .and_then(|v| v.to_string().ok())
            .cloned()
            .unwrap_or_else(|| "llama".to_string());
        let block_count = metadata_u32(&content, &format!("{arch}.block_count")).unwrap_or(0);
        let embedding_length =
            metadata_u32(&content, &format!("{arch}.embedding_length")).unwrap_or(0);
        let eot = metadata_u32(&content, "tokenizer.ggml.eos_token_id").map(|id| id as Token);

        let device = pick_device(params);
        let weights = ModelWeights::from_gguf(content, &mut file, &device)
            .map_err(|e| fail(e.to_string()))?;

        let tokenizer_path = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("tokenizer.json");
        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| fail(e.to_string()))?;

        // K and V per layer per position, f16
        let mem_per_token = block_count as usize * embedding_length as usize * 2 * 2;

        info!(
            arch = %arch,
            block_count,
            embedding_length,
            model = %path.display(),
            "loaded gguf model"
        );
        Ok(Self {
            weights,
            tokenizer,
            device,
            logits: Vec::new(),
            history: Vec::new(),
            eot,
            mem_per_token,
            mirostat_mu: None,
        })
    }

    fn feed(&mut self, tokens: &[Token], past: usize) -> Result<()> {
        let eval_failed = |e: candle_core::Error| Error::EvalFailed(e.to_string());
        let ids: Vec<u32> = tokens.iter().map(|&t| t as u32).collect();
        let input = Tensor::new(ids.as_slice(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(eval_failed)?;
        let logits = self.weights.forward(&input, past).map_err(eval_failed)?;
        self.logits = logits
            .squeeze(0)
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_vec1())
            .map_err(eval_failed)?;
        Ok(())
    }
}

impl Model for CandleModel {
    fn evaluate(&mut self, tokens: &[Token], past: usize, _n_threads: u32) -> Result<()> {
        self.history.truncate(past);
        self.history.extend_from_slice(tokens);
        self.feed(tokens, past)
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn tokenize(&self, text: &str, first: bool) -> Result<Vec<Token>> {
        let encoding = self
            .tokenizer
            .encode(text, first)
            .map_err(|e| Error::InvalidArgument(format!("tokenizer: {e}")))?;
        Ok(encoding.get_ids().iter().map(|&id| id as Token).collect())
    }

    fn token_text(&self, token: Token) -> Result<String> {
        self.tokenizer
            .decode(&[token as u32], false)
            .map_err(|e| Error::InvalidArgument(format!("tokenizer: {e}")))
    }

    fn eot(&self) -> Option<Token> {
        self.eot
    }

    fn mem_per_token(&self) -> usize {
        self.mem_per_token
    }

    fn state_bytes(&self) -> Result<Vec<u8>> {
        encode_state(&self.history, &self.logits)
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<()> {
        let (history, logits) = decode_state(bytes)?;
        debug!(tokens = history.len(), "replaying history to rebuild cache");
        let mut past = 0;
        for chunk in history.chunks(REPLAY_CHUNK) {
            self.feed(chunk, past)?;
            past += chunk.len();
        }
        // the recorded distribution wins over the replayed one
        self.history = history;
        self.logits = logits;
        Ok(())
    }

    fn mirostat_available(&self) -> bool {
        true
    }

    fn mirostat_sample(
        &mut self,
        params: &SessionParams,
        rng: &mut StdRng,
    ) -> Option<Result<Token>> {
        if params.prefer_mirostat != MirostatMode::V2 {
            return None;
        }
        let tau = params.mirostat_target_entropy;
        let eta = params.mirostat_learning_rate;
        let mu = self.mirostat_mu.get_or_insert(2.0 * tau);

        let temp = if params.temp > 0.0 { params.temp } else { 1.0 };
        let mut probs: Vec<(usize, f32)> = softmax_scaled(&self.logits, temp)
            .into_iter()
            .enumerate()
            .collect();
        probs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        // discard candidates whose surprise exceeds mu, always keeping one
        let cutoff = probs
            .iter()
            .position(|(_, p)| -p.log2() > *mu)
            .unwrap_or(probs.len())
            .max(1);
        probs.truncate(cutoff);

        let sum: f32 = probs.iter().map(|(_, p)| p).sum();
        let draw: f32 = rng.gen::<f32>() * sum;
        let mut cumsum = 0.0;
        let mut chosen = probs[probs.len() - 1];
        for &(idx, p) in &probs {
            cumsum += p;
            if cumsum >= draw {
                chosen = (idx, p);
                break;
            }
        }

        let observed = -chosen.1.log2();
        *mu -= eta * (observed - tau);
        Some(Ok(chosen.0 as Token))
    }
}

fn metadata_u32(content: &gguf_file::Content, key: &str) -> Option<u32> {
    content.metadata.get(key).and_then(|v| v.to_u32().ok())
}

fn pick_device(params: &SessionParams) -> Device {
    #[cfg(feature = "cuda")]
    if params.n_gpu_layers > 0 {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }
    #[cfg(feature = "metal")]
    if params.n_gpu_layers > 0 {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }
    let _ = params;
    Device::Cpu
}

fn softmax_scaled(logits: &[f32], temp: f32) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| ((l - max) / temp).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

fn encode_state(history: &[Token], logits: &[f32]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(8 + history.len() * 4 + logits.len() * 4);
    out.write_u32::<LittleEndian>(history.len() as u32)?;
    for &token in history {
        out.write_i32::<LittleEndian>(token)?;
    }
    out.write_u32::<LittleEndian>(logits.len() as u32)?;
    for &logit in logits {
        out.write_f32::<LittleEndian>(logit)?;
    }
    Ok(out)
}

fn decode_state(bytes: &[u8]) -> Result<(Vec<Token>, Vec<f32>)> {
    let mut input = Cursor::new(bytes);
    let history_len = input.read_u32::<LittleEndian>()? as usize;
    let mut history = Vec::with_capacity(history_len);
    for _ in 0..history_len {
        history.push(input.read_i32::<LittleEndian>()?);
    }
    let logits_len = input.read_u32::<LittleEndian>()? as usize;
    let mut logits = Vec::with_capacity(logits_len);
    for _ in 0..logits_len {
        logits.push(input.read_f32::<LittleEndian>()?);
    }
    Ok((history, logits))
}
