//! Per-step probability pipeline and the categorical sampler.
//!
//! For each decoding step the raw logits are turned into a distribution by:
//! 1. temperature, composition bias, per-position bias and global omission
//! 2. optional profile blend
//! 3. optional log-odds gate (strict `>` with 0.001 leakage)
//! 4. hard omission and renormalization
use super::configs::{DesignConfig, ProfileConfig};
use super::utilities::{get_score, NUM_LETTERS};
use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::ops::softmax_last_dim;
use candle_transformers::generation::{LogitsProcessor, Sampling};

const OMIT_PENALTY: f64 = 1e8;
const GATE_LEAK: f64 = 0.001;

/// Run-level sampling settings, prepared once per temperature.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub temperature: f64,
    /// [21]
    pub bias_global: Tensor,
    /// [21] 1 = forbidden
    pub omit_global: Tensor,
    pub profile: ProfileConfig,
}

impl SamplingParams {
    pub fn new(config: &DesignConfig, temperature: f64, device: &Device) -> Result<Self> {
        let bias = config
            .bias_vector()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let omit = config
            .omit_mask()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?
            .map(|o| if o { 1f32 } else { 0f32 });
        Ok(Self {
            temperature,
            bias_global: Tensor::from_slice(&bias, NUM_LETTERS, device)?,
            omit_global: Tensor::from_slice(&omit, NUM_LETTERS, device)?,
            profile: config.profile.clone(),
        })
    }

    /// No biases, omissions or profiles.
    pub fn plain(temperature: f64, device: &Device) -> Result<Self> {
        Ok(Self {
            temperature,
            bias_global: Tensor::zeros(NUM_LETTERS, DType::F32, device)?,
            omit_global: Tensor::zeros(NUM_LETTERS, DType::F32, device)?,
            profile: ProfileConfig::default(),
        })
    }
}

/// Per-position auxiliaries of one step, one row per batch entry.
#[derive(Debug, Clone)]
pub struct StepAux {
    /// [B, 21]
    pub bias: Tensor,
    /// [B, 21]
    pub omit: Tensor,
    /// [B]
    pub pssm_coef: Tensor,
    /// [B, 21]
    pub pssm_bias: Tensor,
    /// [B, 21]
    pub pssm_log_odds: Tensor,
}

/// Turn step logits [B,21] into sampling probabilities [B,21].
pub fn step_probabilities(logits: &Tensor, params: &SamplingParams, aux: &StepAux) -> Result<Tensor> {
    let t = params.temperature;
    let z = ((logits / t)?.broadcast_add(&(&params.bias_global / t)?)? + (&aux.bias / t)?)?
        .broadcast_sub(&(&params.omit_global * OMIT_PENALTY)?)?;
    let mut probs = softmax_last_dim(&z)?;

    if params.profile.bias_flag {
        let w = (aux.pssm_coef.unsqueeze(D::Minus1)? * params.profile.multi)?;
        probs = ((&probs * (1.0 - &w)?.broadcast_as(probs.shape())?)?
            + aux.pssm_bias.broadcast_mul(&w)?)?;
    }

    if params.profile.log_odds_flag {
        let gate = aux
            .pssm_log_odds
            .gt(params.profile.threshold)?
            .to_dtype(DType::F32)?;
        let gated = ((&probs * gate)? + (&probs * GATE_LEAK)?)?;
        probs = renormalize(&gated)?;
    }

    let omit = aux.omit.broadcast_maximum(&params.omit_global)?;
    renormalize(&(&probs * (1.0 - omit)?)?)
}

fn renormalize(p: &Tensor) -> Result<Tensor> {
    p.broadcast_div(&p.sum_keepdim(D::Minus1)?)
}

/// True when every entry is finite and every row has positive mass.
pub fn is_finite_distribution(probs: &Tensor) -> Result<bool> {
    let values = probs.flatten_all()?.to_vec1::<f32>()?;
    if values.iter().any(|v| !v.is_finite()) {
        return Ok(false);
    }
    let sums = probs.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(sums.iter().all(|&s| s > 0.0))
}

/// Categorical draws, greedy or multinomial, from a seeded processor.
pub struct Sampler {
    processor: LogitsProcessor,
}

impl Sampler {
    pub fn new(seed: u64, greedy: bool) -> Self {
        let sampling = if greedy {
            Sampling::ArgMax
        } else {
            Sampling::All { temperature: 1.0 }
        };
        Self {
            processor: LogitsProcessor::from_sampling(seed, sampling),
        }
    }

    /// One symbol per row of `probs` [B,21].
    pub fn draw(&mut self, probs: &Tensor) -> Result<Vec<u32>> {
        let log_p = probs.log()?;
        let b = log_p.dim(0)?;
        (0..b)
            .map(|row| self.processor.sample(&log_p.get(row)?))
            .collect()
    }
}

/// Sequence scores used in reports.
#[derive(Debug, Clone)]
pub struct SequenceScores {
    /// [B] mean NLL over designed positions
    pub score: Tensor,
    /// [B] mean NLL over all valid positions
    pub global_score: Tensor,
}

pub fn sequence_scores(
    s: &Tensor,
    log_probs: &Tensor,
    mask: &Tensor,
    design_mask: &Tensor,
) -> Result<SequenceScores> {
    let (score, _) = get_score(s, log_probs, design_mask)?;
    let (global_score, _) = get_score(s, log_probs, mask)?;
    Ok(SequenceScores {
        score,
        global_score,
    })
}
