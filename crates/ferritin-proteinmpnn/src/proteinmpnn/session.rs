//! Autoregressive decoding as an explicit session value.
//!
//! A session owns the per-layer node states, the sequence embeddings and the
//! decoded symbols for a batch of replicate rows. Each call to
//! [`DecodingSession::step`] resolves one entry of every row's decoding order
//! and feeds the chosen residues back before returning.
//!
//! Rows may follow different orders but always take the same number of steps.
//! Tie groups of unequal size are padded by re-running the last member, which
//! is harmless because the state a step reads is only updated after the draw.
use super::constraints::{combine_tied_logits, DecodingOrder};
use super::featurizer::ProteinFeatures;
use super::model::{order_masks, ranks_tensor, EncodedStructure, ProteinMPNN};
use super::sampling::{step_probabilities, Sampler, SamplingParams, StepAux};
use super::utilities::{cat_neighbors_nodes, gather_positions, scatter_positions, NUM_LETTERS};
use crate::error::{AtStage, MpnnError, Result, Stage};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::log_softmax;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    /// Step `i` is being computed. A session left here has failed.
    Resolving(usize),
    /// Step `i` is resolved and fed back.
    Resolved(usize),
    Done,
}

/// Where the residue of each designable step comes from.
pub enum SessionMode {
    Sample {
        sampler: Sampler,
        params: SamplingParams,
    },
    /// Feed the given symbols [B][L] instead of sampling.
    Forced(Vec<Vec<u32>>),
}

/// Result of a completed session.
#[derive(Debug, Clone)]
pub struct SessionOutput {
    /// [B, L] u32
    pub s: Tensor,
    /// [B, L, 21] sampling distributions, zero at non-designable positions
    pub probs: Tensor,
    /// [B, L, 21] incremental log-probabilities of the raw model
    pub log_probs: Tensor,
    pub orders: Vec<DecodingOrder>,
}

pub struct DecodingSession<'a> {
    model: &'a ProteinMPNN,
    features: &'a ProteinFeatures,
    structure: String,
    orders: Vec<DecodingOrder>,
    mode: SessionMode,
    state: SessionState,
    num_steps: usize,
    batch: usize,
    len: usize,
    e_idx: Tensor,
    h_e: Tensor,
    h_exv_encoder_fw: Tensor,
    mask_bw: Tensor,
    h_v_stack: Vec<Tensor>,
    h_s: Tensor,
    s: Vec<Vec<u32>>,
    probs: Vec<f32>,
    log_probs: Vec<f32>,
}

fn internal(structure: &str, stage: Stage, msg: String) -> MpnnError {
    MpnnError::Internal {
        structure: structure.to_string(),
        stage,
        source: candle_core::Error::Msg(msg),
    }
}

impl<'a> DecodingSession<'a> {
    pub fn new(
        model: &'a ProteinMPNN,
        features: &'a ProteinFeatures,
        encoded: &EncodedStructure,
        orders: Vec<DecodingOrder>,
        mode: SessionMode,
    ) -> Result<Self> {
        let structure = features.name().to_string();
        let batch = features.batch_size();
        let len = features.seq_len().at_stage(&structure, Stage::Decode)?;
        if orders.len() != batch {
            return Err(internal(
                &structure,
                Stage::Decode,
                format!("{} decoding orders for a batch of {}", orders.len(), batch),
            ));
        }
        let num_steps = orders.first().map_or(0, DecodingOrder::num_steps);
        let context = orders.first().map_or(0, |o| o.context.len());
        if orders
            .iter()
            .any(|o| o.num_steps() != num_steps || o.context.len() != context)
        {
            return Err(internal(
                &structure,
                Stage::Decode,
                "decoding orders differ in step count".into(),
            ));
        }
        if let SessionMode::Forced(seqs) = &mode {
            if seqs.len() != batch || seqs.iter().any(|s| s.len() != len) {
                return Err(internal(
                    &structure,
                    Stage::Decode,
                    "forced sequences do not match the batch".into(),
                ));
            }
        }

        let setup = || -> candle_core::Result<_> {
            let ranks: Vec<Vec<u32>> = orders.iter().map(|o| o.ranks(len)).collect();
            let ranks = ranks_tensor(&ranks, features.device())?;
            let (mask_bw, mask_fw) = order_masks(&ranks, &features.mask, &encoded.e_idx)?;
            let h_exv_encoder_fw = encoded.h_exv_encoder()?.broadcast_mul(&mask_fw)?;
            let mut h_v_stack = vec![encoded.h_v.clone()];
            for _ in model.decoder_layers() {
                h_v_stack.push(encoded.h_v.zeros_like()?);
            }
            let h_s = encoded.h_v.zeros_like()?;
            let s = features.s.to_vec2::<u32>()?;
            Ok((mask_bw, h_exv_encoder_fw, h_v_stack, h_s, s))
        };
        let (mask_bw, h_exv_encoder_fw, h_v_stack, h_s, s) =
            setup().at_stage(&structure, Stage::Decode)?;

        Ok(Self {
            model,
            features,
            structure,
            orders,
            mode,
            state: if num_steps == 0 {
                SessionState::Done
            } else {
                SessionState::Unstarted
            },
            num_steps,
            batch,
            len,
            e_idx: encoded.e_idx.clone(),
            h_e: encoded.h_e.clone(),
            h_exv_encoder_fw,
            mask_bw,
            h_v_stack,
            h_s,
            s,
            probs: vec![0f32; batch * len * NUM_LETTERS],
            log_probs: vec![0f32; batch * len * NUM_LETTERS],
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// Resolve the next entry of every row's order.
    pub fn step(&mut self) -> Result<SessionState> {
        let j = match self.state {
            SessionState::Unstarted => 0,
            SessionState::Resolved(i) => i + 1,
            SessionState::Resolving(i) => {
                return Err(internal(
                    &self.structure,
                    Stage::Decode,
                    format!("session failed while resolving step {i}"),
                ))
            }
            SessionState::Done => {
                return Err(internal(
                    &self.structure,
                    Stage::Decode,
                    "session already finished".into(),
                ))
            }
        };
        self.state = SessionState::Resolving(j);
        self.resolve(j)?;
        self.state = if j + 1 == self.num_steps {
            SessionState::Done
        } else {
            SessionState::Resolved(j)
        };
        Ok(self.state)
    }

    /// Step until done.
    pub fn run(&mut self) -> Result<()> {
        while self.state != SessionState::Done {
            self.step()?;
        }
        Ok(())
    }

    pub fn finish(self) -> Result<SessionOutput> {
        if self.state != SessionState::Done {
            return Err(internal(
                &self.structure,
                Stage::Decode,
                format!("finish called in state {:?}", self.state),
            ));
        }
        let device = self.features.device();
        let (b, l) = (self.batch, self.len);
        let build = || -> candle_core::Result<SessionOutput> {
            let s: Vec<u32> = self.s.iter().flatten().copied().collect();
            Ok(SessionOutput {
                s: Tensor::from_vec(s, (b, l), device)?,
                probs: Tensor::from_vec(self.probs.clone(), (b, l, NUM_LETTERS), device)?,
                log_probs: Tensor::from_vec(self.log_probs.clone(), (b, l, NUM_LETTERS), device)?,
                orders: self.orders.clone(),
            })
        };
        build().at_stage(&self.structure, Stage::Decode)
    }

    /// Run every decoder layer at one position per row (`t` [B] u32) and
    /// return the raw logits [B,21].
    fn decode_position(&mut self, t: &Tensor) -> candle_core::Result<Tensor> {
        let e_idx_t = gather_positions(&self.e_idx, t)?;
        let h_e_t = gather_positions(&self.h_e, t)?;
        let h_es_t = cat_neighbors_nodes(&self.h_s, &h_e_t, &e_idx_t)?;
        let h_exv_encoder_t = gather_positions(&self.h_exv_encoder_fw, t)?;
        let mask_bw_t = gather_positions(&self.mask_bw, t)?;
        let mask_t = gather_positions(&self.features.mask, t)?;

        for (l, layer) in self.model.decoder_layers().iter().enumerate() {
            let h_esv_t = cat_neighbors_nodes(&self.h_v_stack[l], &h_es_t, &e_idx_t)?
                .broadcast_mul(&mask_bw_t)?
                .add(&h_exv_encoder_t)?;
            let h_v_t = gather_positions(&self.h_v_stack[l], t)?;
            let new_h_v = layer.forward(&h_v_t, &h_esv_t, Some(&mask_t), None)?;
            self.h_v_stack[l + 1] = scatter_positions(&self.h_v_stack[l + 1], t, &new_h_v)?;
        }
        let last = self.h_v_stack.len() - 1;
        let h_v_t = gather_positions(&self.h_v_stack[last], t)?.squeeze(1)?;
        self.model.logits(&h_v_t)
    }

    /// Profile, bias and omission rows of a step, averaged (omission: union)
    /// over the real members of each row's group.
    fn step_aux(&self, slots: &[Tensor], lens: &[usize]) -> candle_core::Result<StepAux> {
        let f = self.features;
        let device = f.device();
        let b = self.batch;
        let mut bias = Tensor::zeros((b, NUM_LETTERS), DType::F32, device)?;
        let mut omit = Tensor::zeros((b, NUM_LETTERS), DType::F32, device)?;
        let mut pssm_coef = Tensor::zeros((b, 1), DType::F32, device)?;
        let mut pssm_bias = Tensor::zeros((b, NUM_LETTERS), DType::F32, device)?;
        let mut pssm_log_odds = Tensor::zeros((b, NUM_LETTERS), DType::F32, device)?;
        for (g, t) in slots.iter().enumerate() {
            let w: Vec<f32> = lens
                .iter()
                .map(|&n| if g < n { 1.0 / n as f32 } else { 0.0 })
                .collect();
            let w = Tensor::from_vec(w, (b, 1), device)?;
            let take = |x: &Tensor| -> candle_core::Result<Tensor> { gather_positions(x, t)?.squeeze(1) };
            bias = (bias + take(&f.bias_by_res)?.broadcast_mul(&w)?)?;
            omit = omit.maximum(&take(&f.omit_mask)?)?;
            pssm_coef = (pssm_coef + gather_positions(&f.pssm_coef, t)?.mul(&w)?)?;
            pssm_bias = (pssm_bias + take(&f.pssm_bias)?.broadcast_mul(&w)?)?;
            pssm_log_odds = (pssm_log_odds + take(&f.pssm_log_odds)?.broadcast_mul(&w)?)?;
        }
        Ok(StepAux {
            bias,
            omit,
            pssm_coef: pssm_coef.squeeze(1)?,
            pssm_bias,
            pssm_log_odds,
        })
    }

    fn resolve(&mut self, j: usize) -> Result<()> {
        let structure = self.structure.clone();
        let mut entries: Vec<(bool, Vec<usize>)> = Vec::with_capacity(self.batch);
        for order in &self.orders {
            match order.all_steps().nth(j) {
                Some((design, members)) if !members.is_empty() => {
                    entries.push((design, members.to_vec()))
                }
                _ => {
                    return Err(internal(&structure, Stage::Decode, format!("step {j} is empty")))
                }
            }
        }
        let design = entries[0].0;
        let lens: Vec<usize> = entries.iter().map(|(_, m)| m.len()).collect();
        let slots = lens.iter().copied().max().unwrap_or(1);
        let device = self.features.device().clone();

        // member index per slot, padded with the row's last member
        let slot_positions: Vec<Vec<usize>> = (0..slots)
            .map(|g| entries.iter().map(|(_, m)| m[g.min(m.len() - 1)]).collect())
            .collect();
        let slot_tensors = slot_positions
            .iter()
            .map(|ts| Tensor::from_vec(ts.iter().map(|&t| t as u32).collect::<Vec<_>>(), self.batch, &device))
            .collect::<candle_core::Result<Vec<_>>>()
            .at_stage(&structure, Stage::Decode)?;

        let mut slot_logits = Vec::with_capacity(slots);
        for t in &slot_tensors {
            slot_logits.push(self.decode_position(t).at_stage(&structure, Stage::Decode)?);
        }

        let symbols: Vec<Vec<u32>> = if !design {
            slot_positions
                .iter()
                .map(|ts| ts.iter().enumerate().map(|(b, &t)| self.s[b][t]).collect())
                .collect()
        } else if let SessionMode::Forced(seqs) = &self.mode {
            slot_positions
                .iter()
                .map(|ts| ts.iter().enumerate().map(|(b, &t)| seqs[b][t]).collect())
                .collect()
        } else {
            let draws = self.sample_step(&slot_tensors, &slot_positions, &slot_logits, &lens)?;
            vec![draws; slots]
        };

        // feed back and record
        for (g, t) in slot_tensors.iter().enumerate() {
            let feed = || -> candle_core::Result<(Tensor, Vec<Vec<f32>>)> {
                let sym = Tensor::from_vec(symbols[g].clone(), self.batch, &device)?;
                let emb = self.model.embed_sequence(&sym)?.unsqueeze(1)?;
                let h_s = scatter_positions(&self.h_s, t, &emb)?;
                let log_p = log_softmax(&slot_logits[g], D::Minus1)?.to_vec2::<f32>()?;
                Ok((h_s, log_p))
            };
            let (h_s, log_p) = feed().at_stage(&structure, Stage::Decode)?;
            self.h_s = h_s;
            for b in 0..self.batch {
                if g >= lens[b] {
                    continue;
                }
                let pos = slot_positions[g][b];
                self.s[b][pos] = symbols[g][b];
                let offset = (b * self.len + pos) * NUM_LETTERS;
                self.log_probs[offset..offset + NUM_LETTERS].copy_from_slice(&log_p[b]);
            }
        }
        Ok(())
    }

    fn sample_step(
        &mut self,
        slot_tensors: &[Tensor],
        slot_positions: &[Vec<usize>],
        slot_logits: &[Tensor],
        lens: &[usize],
    ) -> Result<Vec<u32>> {
        let structure = self.structure.clone();
        let device = self.features.device().clone();
        let prepare = || -> candle_core::Result<(Tensor, StepAux)> {
            let logits = Tensor::stack(slot_logits, 1)?;
            let weights: Vec<f32> = (0..self.batch)
                .flat_map(|b| {
                    let graph = &self.features.layouts[b].graph;
                    (0..slot_logits.len()).map(move |g| (g, b, graph))
                })
                .map(|(g, b, graph)| {
                    if g < lens[b] {
                        graph.tie_weight(slot_positions[g][b])
                    } else {
                        0.0
                    }
                })
                .collect();
            let weights = Tensor::from_vec(weights, (self.batch, slot_logits.len()), &device)?;
            let sizes: Vec<f32> = lens.iter().map(|&n| n as f32).collect();
            let sizes = Tensor::from_vec(sizes, self.batch, &device)?;
            let z = combine_tied_logits(&logits, &weights, &sizes)?;
            Ok((z, self.step_aux(slot_tensors, lens)?))
        };
        let (z, aux) = prepare().at_stage(&structure, Stage::Sample)?;

        let SessionMode::Sample { sampler, params } = &mut self.mode else {
            return Err(internal(&structure, Stage::Sample, "session is not sampling".into()));
        };
        let probs = step_probabilities(&z, params, &aux).at_stage(&structure, Stage::Sample)?;
        let rows = probs.to_vec2::<f32>().at_stage(&structure, Stage::Sample)?;
        for (b, row) in rows.iter().enumerate() {
            let total: f32 = row.iter().sum();
            if row.iter().any(|p| !p.is_finite()) || !(total > 0.0) {
                return Err(MpnnError::NonFinite {
                    structure,
                    stage: Stage::Sample,
                    position: slot_positions[0][b],
                });
            }
        }
        let draws = sampler.draw(&probs).at_stage(&structure, Stage::Sample)?;

        for (g, positions) in slot_positions.iter().enumerate() {
            for (b, &pos) in positions.iter().enumerate() {
                if g < lens[b] {
                    let offset = (b * self.len + pos) * NUM_LETTERS;
                    self.probs[offset..offset + NUM_LETTERS].copy_from_slice(&rows[b]);
                }
            }
        }
        Ok(draws)
    }
}

/// Convenience: sample every row of `features` along `orders` to completion.
pub fn sample_batch(
    model: &ProteinMPNN,
    features: &ProteinFeatures,
    encoded: &EncodedStructure,
    orders: Vec<DecodingOrder>,
    sampler: Sampler,
    params: SamplingParams,
) -> Result<SessionOutput> {
    let mut session = DecodingSession::new(
        model,
        features,
        encoded,
        orders,
        SessionMode::Sample { sampler, params },
    )?;
    session.run()?;
    session.finish()
}

/// Host copy of a [B,L] sequence tensor for [`SessionMode::Forced`].
pub fn forced_sequences(s: &Tensor) -> candle_core::Result<Vec<Vec<u32>>> {
    s.to_device(&Device::Cpu)?.to_vec2::<u32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::{StructureConstraints, StructureRecord, TieMember};
    use crate::proteinmpnn::configs::ProteinMPNNConfig;
    use crate::proteinmpnn::featurizer::{featurize, FeaturizeOptions};
    use candle_nn::{VarBuilder, VarMap};
    use ferritin_test_data::TestStructure;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup(constraints: StructureConstraints) -> (ProteinMPNN, ProteinFeatures) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ProteinMPNNConfig {
            hidden_dim: 16,
            edge_features: 16,
            node_features: 16,
            k_neighbors: 8,
            ..ProteinMPNNConfig::proteinmpnn()
        };
        let model = ProteinMPNN::load(vb, &config).unwrap();
        let structure = TestStructure::helix("s", "A", 6).with_helix_chain("B", 6, [10.0, 0.0, 0.0]);
        let record = StructureRecord::from_json(&structure.to_json()).unwrap();
        let features =
            featurize(&record, &constraints, &FeaturizeOptions::default(), &device).unwrap();
        (model, features)
    }

    #[test]
    fn test_state_machine() {
        let (model, features) = setup(StructureConstraints::default());
        let mut rng = StdRng::seed_from_u64(3);
        let encoded = model.encode(&features, &mut rng).unwrap();
        let order = features.layouts[0].graph.schedule(&mut rng);
        let mut session = DecodingSession::new(
            &model,
            &features,
            &encoded,
            vec![order],
            SessionMode::Sample {
                sampler: Sampler::new(1, false),
                params: SamplingParams::plain(0.1, &Device::Cpu).unwrap(),
            },
        )
        .unwrap();
        assert_eq!(session.state(), SessionState::Unstarted);
        assert_eq!(session.num_steps(), 12);
        assert_eq!(session.step().unwrap(), SessionState::Resolved(0));

        let mut other = DecodingSession::new(
            &model,
            &features,
            &encoded,
            vec![features.layouts[0].graph.schedule(&mut rng)],
            SessionMode::Forced(forced_sequences(&features.s).unwrap()),
        )
        .unwrap();
        assert!(other.step().is_ok());
        assert!(matches!(
            DecodingSession::new(
                &model,
                &features,
                &encoded,
                vec![],
                SessionMode::Forced(vec![]),
            ),
            Err(MpnnError::Internal { .. })
        ));

        session.run().unwrap();
        assert_eq!(session.state(), SessionState::Done);
        assert!(session.step().is_err());
        let out = session.finish().unwrap();
        assert_eq!(out.s.dims(), &[1, 12]);
        let sums: Vec<f32> = out.probs.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_finish_requires_done() {
        let (model, features) = setup(StructureConstraints::default());
        let mut rng = StdRng::seed_from_u64(3);
        let encoded = model.encode(&features, &mut rng).unwrap();
        let session = DecodingSession::new(
            &model,
            &features,
            &encoded,
            vec![features.layouts[0].graph.schedule(&mut rng)],
            SessionMode::Forced(forced_sequences(&features.s).unwrap()),
        )
        .unwrap();
        assert!(session.finish().is_err());
    }

    #[test]
    fn test_uneven_ties_across_rows() {
        let constraints = StructureConstraints {
            tied_positions: vec![
                vec![
                    TieMember { chain: "A".into(), position: 1, weight: 1.0 },
                    TieMember { chain: "B".into(), position: 1, weight: 1.0 },
                    TieMember { chain: "B".into(), position: 2, weight: 0.5 },
                ],
                vec![
                    TieMember { chain: "A".into(), position: 4, weight: 1.0 },
                    TieMember { chain: "B".into(), position: 4, weight: 1.0 },
                ],
            ],
            ..Default::default()
        };
        let (model, features) = setup(constraints);
        let batch = features.repeat_batch(4).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let encoded = model.encode(&features, &mut rng).unwrap().repeat_batch(4).unwrap();
        let orders = (0..4).map(|_| batch.layouts[0].graph.schedule(&mut rng)).collect();
        let out = sample_batch(
            &model,
            &batch,
            &encoded,
            orders,
            Sampler::new(5, false),
            SamplingParams::plain(1.0, &Device::Cpu).unwrap(),
        )
        .unwrap();
        for row in out.s.to_vec2::<u32>().unwrap() {
            assert_eq!(row[0], row[6]);
            assert_eq!(row[0], row[7]);
            assert_eq!(row[3], row[9]);
        }
    }
}
