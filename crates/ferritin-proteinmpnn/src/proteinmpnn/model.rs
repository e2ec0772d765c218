//! A message passing protein design neural network
//! that samples sequences diffusing conditional probabilities.
//!
//! The encoder and the dense decoder passes are plain functions of immutable
//! tensors. Incremental decoding state lives in
//! [`DecodingSession`](super::session::DecodingSession).
use super::configs::ProteinMPNNConfig;
use super::featurizer::ProteinFeatures;
use super::proteinfeatures::ProteinFeaturesModel;
use super::utilities::{cat_neighbors_nodes, gather_nodes};
use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::ops::log_softmax;
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

const LAYER_NORM_EPS: f64 = 1e-5;

/// Dense decoder output.
#[derive(Clone, Debug)]
pub struct ScoreOutput {
    /// [B, L, 21]
    pub log_probs: Tensor,
    /// [B, L, 21]
    pub logits: Tensor,
}

/// Encoder embeddings. Carries no sequence information, so one encoding
/// serves every sample and temperature of a run.
#[derive(Clone, Debug)]
pub struct EncodedStructure {
    /// [B, L, H]
    pub h_v: Tensor,
    /// [B, L, K, H]
    pub h_e: Tensor,
    /// [B, L, K] u32
    pub e_idx: Tensor,
}

impl EncodedStructure {
    pub fn repeat_batch(&self, b: usize) -> Result<Self> {
        Ok(Self {
            h_v: self.h_v.repeat((b, 1, 1))?,
            h_e: self.h_e.repeat((b, 1, 1, 1))?,
            e_idx: self.e_idx.repeat((b, 1, 1))?,
        })
    }

    /// Encoder-side decoder input `[h_E, 0, h_V]` per edge.
    pub(crate) fn h_exv_encoder(&self) -> Result<Tensor> {
        let h_ex_encoder = cat_neighbors_nodes(&self.h_v.zeros_like()?, &self.h_e, &self.e_idx)?;
        cat_neighbors_nodes(&self.h_v, &h_ex_encoder, &self.e_idx)
    }
}

#[derive(Clone, Debug)]
struct PositionWiseFeedForward {
    w_in: Linear,
    w_out: Linear,
}

impl PositionWiseFeedForward {
    fn new(vb: VarBuilder, dim_input: usize, dim_feedforward: usize) -> Result<Self> {
        let w_in = linear(dim_input, dim_feedforward, vb.pp("W_in"))?;
        let w_out = linear(dim_feedforward, dim_input, vb.pp("W_out"))?;
        Ok(Self { w_in, w_out })
    }
}

impl Module for PositionWiseFeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.w_in.forward(x)?.gelu_erf()?.apply(&self.w_out)
    }
}

/// `W3(gelu(W2(gelu(W1(x)))))`
fn message(w1: &Linear, w2: &Linear, w3: &Linear, x: &Tensor) -> Result<Tensor> {
    w1.forward(x)?
        .gelu_erf()?
        .apply(w2)?
        .gelu_erf()?
        .apply(w3)
}

/// `[h_V_i, h_E_ij]` along the last axis, with `h_V_i` broadcast over neighbours.
fn cat_self_edges(h_v: &Tensor, h_e: &Tensor) -> Result<Tensor> {
    let (b, l, k, _) = h_e.dims4()?;
    let h_v_expand = h_v.unsqueeze(D::Minus2)?.expand((b, l, k, h_v.dim(D::Minus1)?))?;
    Tensor::cat(&[&h_v_expand, h_e], D::Minus1)?.contiguous()
}

fn apply_mask(h: Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    match mask {
        Some(mask) => mask.unsqueeze(D::Minus1)?.broadcast_mul(&h),
        None => Ok(h),
    }
}

#[derive(Clone, Debug)]
pub struct EncLayer {
    scale: f64,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
    w1: Linear,
    w2: Linear,
    w3: Linear,
    w11: Linear,
    w12: Linear,
    w13: Linear,
    dense: PositionWiseFeedForward,
}

impl EncLayer {
    pub fn load(vb: VarBuilder, config: &ProteinMPNNConfig, layer: usize) -> Result<Self> {
        let vb = vb.pp(layer);
        let num_hidden = config.hidden_dim;
        let num_in = config.hidden_dim * 2;
        Ok(Self {
            scale: config.scale_factor,
            norm1: layer_norm(num_hidden, LAYER_NORM_EPS, vb.pp("norm1"))?,
            norm2: layer_norm(num_hidden, LAYER_NORM_EPS, vb.pp("norm2"))?,
            norm3: layer_norm(num_hidden, LAYER_NORM_EPS, vb.pp("norm3"))?,
            w1: linear(num_hidden + num_in, num_hidden, vb.pp("W1"))?,
            w2: linear(num_hidden, num_hidden, vb.pp("W2"))?,
            w3: linear(num_hidden, num_hidden, vb.pp("W3"))?,
            w11: linear(num_hidden + num_in, num_hidden, vb.pp("W11"))?,
            w12: linear(num_hidden, num_hidden, vb.pp("W12"))?,
            w13: linear(num_hidden, num_hidden, vb.pp("W13"))?,
            dense: PositionWiseFeedForward::new(vb.pp("dense"), num_hidden, num_hidden * 4)?,
        })
    }

    pub fn forward(
        &self,
        h_v: &Tensor,
        h_e: &Tensor,
        e_idx: &Tensor,
        mask_v: Option<&Tensor>,
        mask_attend: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let h_ev = cat_self_edges(h_v, &cat_neighbors_nodes(h_v, h_e, e_idx)?)?;
        let h_message = apply_mask(message(&self.w1, &self.w2, &self.w3, &h_ev)?, mask_attend)?;
        let dh = (h_message.sum(D::Minus2)? / self.scale)?;
        let h_v = self.norm1.forward(&(h_v + dh)?)?;

        let dh = self.dense.forward(&h_v)?;
        let h_v = self.norm2.forward(&(&h_v + dh)?)?;
        let h_v = apply_mask(h_v, mask_v)?;

        let h_ev = cat_self_edges(&h_v, &cat_neighbors_nodes(&h_v, h_e, e_idx)?)?;
        let h_message = message(&self.w11, &self.w12, &self.w13, &h_ev)?;
        let h_e = self.norm3.forward(&(h_e + h_message)?)?;
        Ok((h_v, h_e))
    }
}

#[derive(Clone, Debug)]
pub struct DecLayer {
    scale: f64,
    norm1: LayerNorm,
    norm2: LayerNorm,
    w1: Linear,
    w2: Linear,
    w3: Linear,
    dense: PositionWiseFeedForward,
}

impl DecLayer {
    pub fn load(vb: VarBuilder, config: &ProteinMPNNConfig, layer: usize) -> Result<Self> {
        let vb = vb.pp(layer);
        let num_hidden = config.hidden_dim;
        let num_in = config.hidden_dim * 3;
        Ok(Self {
            scale: config.scale_factor,
            norm1: layer_norm(num_hidden, LAYER_NORM_EPS, vb.pp("norm1"))?,
            norm2: layer_norm(num_hidden, LAYER_NORM_EPS, vb.pp("norm2"))?,
            w1: linear(num_hidden + num_in, num_hidden, vb.pp("W1"))?,
            w2: linear(num_hidden, num_hidden, vb.pp("W2"))?,
            w3: linear(num_hidden, num_hidden, vb.pp("W3"))?,
            dense: PositionWiseFeedForward::new(vb.pp("dense"), num_hidden, num_hidden * 4)?,
        })
    }

    /// `h_v` [B,M,H], `h_e` [B,M,K,3H]. `M` is `L` for dense passes and 1 for a
    /// single decoding step.
    pub fn forward(
        &self,
        h_v: &Tensor,
        h_e: &Tensor,
        mask_v: Option<&Tensor>,
        mask_attend: Option<&Tensor>,
    ) -> Result<Tensor> {
        let h_ev = cat_self_edges(h_v, h_e)?;
        let h_message = apply_mask(message(&self.w1, &self.w2, &self.w3, &h_ev)?, mask_attend)?;
        let dh = (h_message.sum(D::Minus2)? / self.scale)?;
        let h_v = self.norm1.forward(&(h_v + dh)?)?;
        let dh = self.dense.forward(&h_v)?;
        let h_v = self.norm2.forward(&(&h_v + dh)?)?;
        apply_mask(h_v, mask_v)
    }
}

/// Causal masks from per-position ranks.
///
/// `mask_bw[b,i,k] = mask_i · [rank(E_idx[b,i,k]) < rank(i)]`, `mask_fw` is the
/// complement times `mask_i`. Both are [B,L,K,1].
pub fn order_masks(ranks: &Tensor, mask: &Tensor, e_idx: &Tensor) -> Result<(Tensor, Tensor)> {
    let rank_nb = gather_nodes(&ranks.unsqueeze(D::Minus1)?, e_idx)?.squeeze(D::Minus1)?;
    let mask_attend = rank_nb
        .broadcast_lt(&ranks.unsqueeze(D::Minus1)?)?
        .to_dtype(DType::F32)?
        .unsqueeze(D::Minus1)?;
    let mask_1d = mask.unsqueeze(D::Minus1)?.unsqueeze(D::Minus1)?;
    let mask_bw = mask_1d.broadcast_mul(&mask_attend)?;
    let mask_fw = mask_1d.broadcast_mul(&(1.0 - &mask_attend)?)?;
    Ok((mask_bw, mask_fw))
}

/// Ranks tensor [B,L] f32 from per-row rank vectors.
pub fn ranks_tensor(ranks: &[Vec<u32>], device: &candle_core::Device) -> Result<Tensor> {
    let l = ranks.first().map_or(0, Vec::len);
    let flat: Vec<f32> = ranks.iter().flatten().map(|&r| r as f32).collect();
    Tensor::from_vec(flat, (ranks.len(), l), device)
}

// https://github.com/dauparas/ProteinMPNN/blob/main/protein_mpnn_utils.py
#[derive(Clone, Debug)]
pub struct ProteinMPNN {
    config: ProteinMPNNConfig,
    decoder_layers: Vec<DecLayer>,
    encoder_layers: Vec<EncLayer>,
    features: ProteinFeaturesModel,
    w_e: Linear,
    w_out: Linear,
    w_s: Embedding,
}

impl ProteinMPNN {
    pub fn load(vb: VarBuilder, config: &ProteinMPNNConfig) -> Result<Self> {
        let encoder_layers = (0..config.num_encoder_layers)
            .map(|i| EncLayer::load(vb.pp("encoder_layers"), config, i))
            .collect::<Result<Vec<_>>>()?;
        let decoder_layers = (0..config.num_decoder_layers)
            .map(|i| DecLayer::load(vb.pp("decoder_layers"), config, i))
            .collect::<Result<Vec<_>>>()?;
        let w_e = linear(config.edge_features, config.hidden_dim, vb.pp("W_e"))?;
        let w_out = linear(config.hidden_dim, config.num_letters, vb.pp("W_out"))?;
        let w_s = embedding(config.vocab, config.hidden_dim, vb.pp("W_s"))?;
        let features = ProteinFeaturesModel::load(vb.pp("features"), config)?;
        Ok(Self {
            config: config.clone(),
            decoder_layers,
            encoder_layers,
            features,
            w_e,
            w_out,
            w_s,
        })
    }

    pub fn config(&self) -> &ProteinMPNNConfig {
        &self.config
    }

    pub(crate) fn decoder_layers(&self) -> &[DecLayer] {
        &self.decoder_layers
    }

    /// Sequence embeddings `W_s(s)`.
    pub fn embed_sequence(&self, s: &Tensor) -> Result<Tensor> {
        self.w_s.forward(s)
    }

    /// Raw output logits for node states [..., H].
    pub fn logits(&self, h_v: &Tensor) -> Result<Tensor> {
        self.w_out.forward(h_v)
    }

    /// Gaussian coordinate noise with std `augment_eps`, drawn from `rng`.
    fn perturb(&self, x: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
        let eps = self.config.augment_eps;
        if eps <= 0.0 {
            return Ok(x.clone());
        }
        let normal = Normal::new(0f32, eps as f32).map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let noise: Vec<f32> = (0..x.elem_count()).map(|_| normal.sample(rng)).collect();
        x + Tensor::from_vec(noise, x.shape(), x.device())?
    }

    pub fn encode(&self, features: &ProteinFeatures, rng: &mut StdRng) -> Result<EncodedStructure> {
        let x = self.perturb(&features.x, rng)?;
        let mask = &features.mask;
        let (e, e_idx) =
            self.features
                .forward(&x, mask, &features.residue_idx, &features.chain_encoding)?;
        let (b, l, _, _) = e.dims4()?;
        let mut h_v = Tensor::zeros((b, l, self.config.hidden_dim), DType::F32, e.device())?;
        let mut h_e = self.w_e.forward(&e)?;
        let mask_attend = gather_nodes(&mask.unsqueeze(D::Minus1)?, &e_idx)?
            .squeeze(D::Minus1)?
            .broadcast_mul(&mask.unsqueeze(D::Minus1)?)?;
        for layer in &self.encoder_layers {
            let (new_h_v, new_h_e) = layer.forward(&h_v, &h_e, &e_idx, Some(mask), Some(&mask_attend))?;
            h_v = new_h_v;
            h_e = new_h_e;
        }
        Ok(EncodedStructure { h_v, h_e, e_idx })
    }

    /// Dense forced pass of `s` [B,L] under the order given by `ranks`
    /// [B,L] (lower rank decodes earlier).
    pub fn score(
        &self,
        features: &ProteinFeatures,
        encoded: &EncodedStructure,
        s: &Tensor,
        ranks: &Tensor,
    ) -> Result<ScoreOutput> {
        let mask = &features.mask;
        let EncodedStructure { h_v, h_e, e_idx } = encoded;
        let (mask_bw, mask_fw) = order_masks(ranks, mask, e_idx)?;

        let h_s = self.w_s.forward(s)?;
        let h_es = cat_neighbors_nodes(&h_s, h_e, e_idx)?;
        let h_exv_encoder_fw = encoded.h_exv_encoder()?.broadcast_mul(&mask_fw)?;

        let mut h_v = h_v.clone();
        for layer in &self.decoder_layers {
            let h_esv = cat_neighbors_nodes(&h_v, &h_es, e_idx)?
                .broadcast_mul(&mask_bw)?
                .add(&h_exv_encoder_fw)?;
            h_v = layer.forward(&h_v, &h_esv, Some(mask), None)?;
        }
        let logits = self.w_out.forward(&h_v)?;
        let log_probs = log_softmax(&logits, D::Minus1)?;
        Ok(ScoreOutput { log_probs, logits })
    }

    /// Single pass without sequence conditioning. Returns log-probs [B,L,21].
    pub fn unconditional_probs(
        &self,
        features: &ProteinFeatures,
        encoded: &EncodedStructure,
    ) -> Result<Tensor> {
        let mask = &features.mask;
        let mask_fw = mask.unsqueeze(D::Minus1)?.unsqueeze(D::Minus1)?;
        let h_exv_encoder_fw = encoded.h_exv_encoder()?.broadcast_mul(&mask_fw)?;
        let mut h_v = encoded.h_v.clone();
        for layer in &self.decoder_layers {
            h_v = layer.forward(&h_v, &h_exv_encoder_fw, Some(mask), None)?;
        }
        log_softmax(&self.w_out.forward(&h_v)?, D::Minus1)
    }

    /// `p(s_i | rest of the sequence, backbone)` for every position, by decoding
    /// `i` last. With `backbone_only`, `p(s_i | backbone)` by decoding it first.
    ///
    /// `order` is a permutation of `0..L` used for the remaining positions.
    pub fn conditional_probs(
        &self,
        features: &ProteinFeatures,
        encoded: &EncodedStructure,
        order: &[usize],
        backbone_only: bool,
    ) -> Result<Tensor> {
        let (b, l) = features.s.dims2()?;
        let device = features.device();
        let mut rows = Vec::with_capacity(l);
        for idx in 0..l {
            let mut ranks = vec![0u32; l];
            let mut rank = if backbone_only { 1 } else { 0 };
            for &j in order.iter().filter(|&&j| j != idx) {
                ranks[j] = rank;
                rank += 1;
            }
            ranks[idx] = if backbone_only { 0 } else { rank };
            let ranks = ranks_tensor(&vec![ranks; b], device)?;
            let out = self.score(features, encoded, &features.s, &ranks)?;
            rows.push(out.log_probs.narrow(1, idx, 1)?);
        }
        Tensor::cat(&rows, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::{StructureConstraints, StructureRecord};
    use crate::proteinmpnn::featurizer::{featurize, FeaturizeOptions};
    use candle_core::Device;
    use candle_nn::VarMap;
    use ferritin_test_data::TestStructure;
    use rand::SeedableRng;

    fn small_config() -> ProteinMPNNConfig {
        ProteinMPNNConfig {
            hidden_dim: 16,
            edge_features: 16,
            node_features: 16,
            k_neighbors: 8,
            ..ProteinMPNNConfig::proteinmpnn()
        }
    }

    fn setup() -> (ProteinMPNN, ProteinFeatures) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ProteinMPNN::load(vb, &small_config()).unwrap();
        let record = StructureRecord::from_json(&TestStructure::helix("h", "A", 12).to_json()).unwrap();
        let features = featurize(
            &record,
            &StructureConstraints::default(),
            &FeaturizeOptions::default(),
            &device,
        )
        .unwrap();
        (model, features)
    }

    #[test]
    fn test_order_masks() {
        let device = Device::Cpu;
        let ranks = Tensor::new(&[[2f32, 0.0, 1.0]], &device).unwrap();
        let mask = Tensor::new(&[[1f32, 1.0, 0.0]], &device).unwrap();
        let e_idx = Tensor::new(&[[[0u32, 1, 2], [1, 0, 2], [2, 1, 0]]], &device).unwrap();
        let (bw, fw) = order_masks(&ranks, &mask, &e_idx).unwrap();
        let bw: Vec<f32> = bw.flatten_all().unwrap().to_vec1().unwrap();
        let fw: Vec<f32> = fw.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(bw, vec![0., 1., 1., 0., 0., 0., 0., 0., 0.]);
        assert_eq!(fw, vec![1., 0., 0., 1., 1., 1., 0., 0., 0.]);
    }

    #[test]
    fn test_shapes() {
        let (model, features) = setup();
        let mut rng = StdRng::seed_from_u64(0);
        let enc = model.encode(&features, &mut rng).unwrap();
        assert_eq!(enc.h_v.dims(), &[1, 12, 16]);
        assert_eq!(enc.h_e.dims(), &[1, 12, 8, 16]);

        let ranks = ranks_tensor(&[(0..12).collect()], &Device::Cpu).unwrap();
        let out = model.score(&features, &enc, &features.s, &ranks).unwrap();
        assert_eq!(out.log_probs.dims(), &[1, 12, 21]);

        let probs = out.log_probs.exp().unwrap().sum(D::Minus1).unwrap();
        for p in probs.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((p - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_replicate_batch_matches_single_row() {
        let (model, features) = setup();
        let mut rng = StdRng::seed_from_u64(0);
        let enc = model.encode(&features, &mut rng).unwrap();
        let order: Vec<u32> = (0..12).rev().collect();
        let single = model
            .score(&features, &enc, &features.s, &ranks_tensor(&[order.clone()], &Device::Cpu).unwrap())
            .unwrap();

        let batch = features.repeat_batch(2).unwrap();
        let enc2 = enc.repeat_batch(2).unwrap();
        let ranks = ranks_tensor(&[order.clone(), order], &Device::Cpu).unwrap();
        let out = model.score(&batch, &enc2, &batch.s, &ranks).unwrap();
        assert_eq!(out.log_probs.dims(), &[2, 12, 21]);
        let expected = single.log_probs.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for row in 0..2 {
            let got = out.log_probs.get(row).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            for (a, b) in got.iter().zip(expected.iter()) {
                assert!((a - b).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_first_position_ignores_sequence() {
        let (model, features) = setup();
        let mut rng = StdRng::seed_from_u64(0);
        let enc = model.encode(&features, &mut rng).unwrap();
        let order: Vec<usize> = (0..12).collect();
        let backbone = model
            .conditional_probs(&features, &enc, &order, true)
            .unwrap();
        // decoding first with no earlier neighbours equals the unconditional pass
        let uncond = model.unconditional_probs(&features, &enc).unwrap();
        let diff = (backbone - uncond)
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "{diff}");
    }
}
