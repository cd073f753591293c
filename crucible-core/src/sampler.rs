//! Token sampling over raw logits.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::Token;
use crate::params::SessionParams;

/// Token sampler with configurable parameters.
///
/// Owns the session RNG, so identical seeds and inputs reproduce identical
/// token streams.
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub(crate) fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Sample one token id from `logits`, penalizing ids in `recent`.
    ///
    /// Zero temperature or `top_k == 1` short-circuits to argmax.
    pub fn sample(&mut self, logits: &[f32], recent: &[Token], params: &SessionParams) -> Token {
        let mut logits = logits.to_vec();
        if params.repeat_penalty != 1.0 {
            apply_repeat_penalty(&mut logits, params.repeat_penalty, recent);
        }

        if params.temp <= 0.0 || params.top_k == 1 {
            return argmax(&logits);
        }

        for logit in &mut logits {
            *logit /= params.temp;
        }
        let probs = softmax(&logits);

        // Rank once, then truncate by k and by nucleus mass
        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        if params.top_k > 0 {
            indexed.truncate(params.top_k as usize);
        }
        if params.top_p > 0.0 && params.top_p < 1.0 {
            let mut cumsum = 0.0f32;
            let mut cutoff = indexed.len();
            for (i, (_, p)) in indexed.iter().enumerate() {
                cumsum += p;
                if cumsum >= params.top_p {
                    cutoff = i + 1;
                    break;
                }
            }
            indexed.truncate(cutoff);
        }

        let sum: f32 = indexed.iter().map(|(_, p)| p).sum();
        let r: f32 = self.rng.gen::<f32>() * sum;
        let mut cumsum = 0.0;
        for (idx, p) in &indexed {
            cumsum += p;
            if cumsum >= r {
                return *idx as Token;
            }
        }
        indexed.last().map(|(idx, _)| *idx as Token).unwrap_or(0)
    }
}

/// Positive logits are divided by the penalty, negative ones multiplied.
fn apply_repeat_penalty(logits: &mut [f32], penalty: f32, recent: &[Token]) {
    for &token in recent {
        if token < 0 {
            continue;
        }
        if let Some(logit) = logits.get_mut(token as usize) {
            *logit = if *logit >= 0.0 {
                *logit / penalty
            } else {
                *logit * penalty
            };
        }
    }
}

fn argmax(logits: &[f32]) -> Token {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as Token)
        .unwrap_or(0)
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greedy_params() -> SessionParams {
        SessionParams {
            top_k: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let mut sampler = Sampler::new(7);
        let logits = [0.1, 3.0, 0.2, 1.5];
        assert_eq!(sampler.sample(&logits, &[], &greedy_params()), 1);
    }

    #[test]
    fn test_zero_temperature_is_greedy() {
        let mut sampler = Sampler::new(7);
        let params = SessionParams {
            temp: 0.0,
            ..Default::default()
        };
        let logits = [0.4, 0.1, 0.9];
        assert_eq!(sampler.sample(&logits, &[], &params), 2);
    }

    #[test]
    fn test_same_seed_same_draws() {
        let params = SessionParams {
            seed: 42,
            top_k: 4,
            top_p: 1.0,
            temp: 1.0,
            ..Default::default()
        };
        let logits: Vec<f32> = (0..32).map(|i| (i as f32 * 0.37).sin()).collect();
        let mut a = Sampler::new(42);
        let mut b = Sampler::new(42);
        for _ in 0..16 {
            assert_eq!(
                a.sample(&logits, &[], &params),
                b.sample(&logits, &[], &params)
            );
        }
    }

    #[test]
    fn test_repeat_penalty_demotes_recent() {
        let mut sampler = Sampler::new(7);
        let params = SessionParams {
            top_k: 1,
            repeat_penalty: 100.0,
            n_repeat_last: 8,
            ..Default::default()
        };
        let logits = [1.0, 2.0, 1.9];
        // token 1 leads, but a harsh penalty hands the draw to token 2
        assert_eq!(sampler.sample(&logits, &[1], &params), 2);
    }

    #[test]
    fn test_top_p_keeps_nucleus() {
        // one token carries nearly all the mass; a tight nucleus must pick it
        let mut sampler = Sampler::new(9);
        let params = SessionParams {
            top_k: 0,
            top_p: 0.5,
            temp: 1.0,
            ..Default::default()
        };
        let mut logits = vec![0.0f32; 16];
        logits[5] = 12.0;
        for _ in 0..32 {
            assert_eq!(sampler.sample(&logits, &[], &params), 5);
        }
    }
}
