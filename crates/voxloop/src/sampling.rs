//! Token sampling over a logit vector.
//!
//! The primitives mirror the usual llama-style chain: repetition penalties,
//! then top-k, top-p and temperature, then a weighted random pick. A
//! temperature of zero or below picks greedily instead.

use crate::model::Token;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: Token,
    pub logit: f32,
    pub p: f32,
}

/// Candidate tokens for one sampling step.
#[derive(Debug, Clone)]
pub struct Candidates {
    data: Vec<TokenData>,
    sorted: bool,
}

impl Candidates {
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| TokenData {
                id: id as Token,
                logit,
                p: 0.0,
            })
            .collect();
        Self {
            data,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[TokenData] {
        &self.data
    }

    pub fn logit(&self, id: Token) -> Option<f32> {
        self.data.iter().find(|d| d.id == id).map(|d| d.logit)
    }

    pub fn set_logit(&mut self, id: Token, logit: f32) {
        if let Some(d) = self.data.iter_mut().find(|d| d.id == id) {
            d.logit = logit;
        }
    }

    fn sort_desc(&mut self) {
        if !self.sorted {
            self.data
                .sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));
            self.sorted = true;
        }
    }
}

/// Sort by logit and fill in normalized probabilities.
pub fn softmax(c: &mut Candidates) {
    if c.is_empty() {
        return;
    }
    c.sort_desc();
    let max = c.data[0].logit;
    let mut sum = 0.0f32;
    for d in c.data.iter_mut() {
        d.p = (d.logit - max).exp();
        sum += d.p;
    }
    for d in c.data.iter_mut() {
        d.p /= sum;
    }
}

/// Divide positive logits (multiply negative ones) of recently seen tokens by `penalty`.
pub fn repetition_penalty(c: &mut Candidates, last_tokens: &[Token], penalty: f32) {
    if last_tokens.is_empty() || penalty == 1.0 {
        return;
    }
    let seen: HashSet<Token> = last_tokens.iter().copied().collect();
    for d in c.data.iter_mut() {
        if seen.contains(&d.id) {
            if d.logit <= 0.0 {
                d.logit *= penalty;
            } else {
                d.logit /= penalty;
            }
        }
    }
    c.sorted = false;
}

/// Subtract `count * alpha_frequency + alpha_presence` from every recently seen token.
pub fn frequency_presence_penalty(
    c: &mut Candidates,
    last_tokens: &[Token],
    alpha_frequency: f32,
    alpha_presence: f32,
) {
    if last_tokens.is_empty() || (alpha_frequency == 0.0 && alpha_presence == 0.0) {
        return;
    }
    let mut counts: HashMap<Token, usize> = HashMap::new();
    for &t in last_tokens {
        *counts.entry(t).or_default() += 1;
    }
    for d in c.data.iter_mut() {
        if let Some(&count) = counts.get(&d.id) {
            d.logit -= count as f32 * alpha_frequency + alpha_presence;
        }
    }
    c.sorted = false;
}

/// Keep the `k` most likely candidates (never fewer than `min_keep`).
pub fn top_k(c: &mut Candidates, k: usize, min_keep: usize) {
    let k = if k == 0 { c.len() } else { k.max(min_keep).min(c.len()) };
    c.sort_desc();
    c.data.truncate(k);
}

/// Keep the smallest prefix whose cumulative probability reaches `p`.
pub fn top_p(c: &mut Candidates, p: f32, min_keep: usize) {
    if p >= 1.0 || c.is_empty() {
        return;
    }
    softmax(c);
    let mut cumulative = 0.0f32;
    let mut keep = c.len();
    for (i, d) in c.data.iter().enumerate() {
        cumulative += d.p;
        if cumulative >= p && i + 1 >= min_keep {
            keep = i + 1;
            break;
        }
    }
    c.data.truncate(keep);
}

pub fn temperature(c: &mut Candidates, temp: f32) {
    for d in c.data.iter_mut() {
        d.logit /= temp;
    }
}

pub fn sample_greedy(c: &Candidates) -> Option<Token> {
    c.data
        .iter()
        .max_by(|a, b| a.logit.partial_cmp(&b.logit).unwrap_or(std::cmp::Ordering::Equal))
        .map(|d| d.id)
}

/// Weighted random pick by softmax probability.
pub fn sample_stochastic<R: Rng + ?Sized>(c: &mut Candidates, rng: &mut R) -> Option<Token> {
    if c.is_empty() {
        return None;
    }
    softmax(c);
    let r: f32 = rng.gen();
    let mut cumulative = 0.0f32;
    for d in &c.data {
        cumulative += d.p;
        if r < cumulative {
            return Some(d.id);
        }
    }
    c.data.last().map(|d| d.id)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Zero the end-of-sequence logit so replies only end at an anti-prompt or the step cap.
    pub suppress_eos: bool,
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            top_p: 0.80,
            temperature: 0.30,
            repeat_penalty: 1.1764,
            repeat_last_n: 256,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            suppress_eos: false,
            seed: None,
        }
    }
}

/// Picks one next token per generation step.
pub struct Sampler {
    config: SamplingConfig,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Sample the next token. `history` is the evaluated token history; its
    /// tail feeds the repetition penalties. The newline logit is never penalized.
    pub fn sample(&mut self, logits: &[f32], history: &[Token], eos: Token, nl: Token) -> Option<Token> {
        let mut candidates = Candidates::from_logits(logits);
        if self.config.suppress_eos {
            candidates.set_logit(eos, 0.0);
        }

        let nl_logit = candidates.logit(nl);
        let window = &history[history.len().saturating_sub(self.config.repeat_last_n)..];
        repetition_penalty(&mut candidates, window, self.config.repeat_penalty);
        frequency_presence_penalty(
            &mut candidates,
            window,
            self.config.frequency_penalty,
            self.config.presence_penalty,
        );
        if let Some(logit) = nl_logit {
            candidates.set_logit(nl, logit);
        }

        if self.config.temperature <= 0.0 {
            return sample_greedy(&candidates);
        }
        top_k(&mut candidates, self.config.top_k, 1);
        top_p(&mut candidates, self.config.top_p, 1);
        temperature(&mut candidates, self.config.temperature);
        sample_stochastic(&mut candidates, &mut self.rng)
    }
}
