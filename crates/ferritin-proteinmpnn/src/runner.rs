//! Drive structures through featurization, encoding, decoding and scoring.
//!
//! One structure at a time: the whole temperature sweep and every replicate
//! batch of a structure finish before the next one starts. All randomness comes
//! from a single [`StdRng`] seeded from the run seed.
use crate::error::{AtStage, DataError, MpnnError, Result, Stage};
use crate::inputs::{ConstraintSet, StructureRecord};
use crate::proteinmpnn::configs::{DesignConfig, ModelVariant};
use crate::proteinmpnn::constraints::DecodingOrder;
use crate::proteinmpnn::featurizer::{featurize, FeaturizeOptions, ProteinFeatures};
use crate::proteinmpnn::model::{ranks_tensor, EncodedStructure, ProteinMPNN};
use crate::proteinmpnn::outputs::{designed_sequence, DesignRecord, NativeRecord, SequenceScoreArchive};
use crate::proteinmpnn::sampling::{sequence_scores, Sampler, SamplingParams};
use crate::proteinmpnn::session::sample_batch;
use crate::proteinmpnn::utilities::get_seq_rec;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything produced for one structure by a design run.
#[derive(Debug, Clone)]
pub struct StructureDesign {
    pub native: NativeRecord,
    pub samples: Vec<DesignRecord>,
    /// `probs`, `log_probs`, `S` and `mask` when probabilities are saved.
    pub archive: Option<HashMap<String, Tensor>>,
}

/// Counts reported at the end of a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub skipped: usize,
}

pub struct DesignRunner {
    model: ProteinMPNN,
    variant: ModelVariant,
    config: DesignConfig,
    options: FeaturizeOptions,
    device: Device,
    seed: u64,
}

impl DesignRunner {
    /// Validates `config` and fixes the run seed.
    pub fn new(
        model: ProteinMPNN,
        variant: ModelVariant,
        config: DesignConfig,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let options = FeaturizeOptions::new(&config, model.config().ca_only)?;
        let seed = match config.seed {
            Some(seed) => seed,
            None => {
                let mut rng = rand::thread_rng();
                rng.gen_range(0..99999)
            }
        };
        info!("Run seed: {seed}");
        Ok(Self {
            model,
            variant,
            config,
            options,
            device,
            seed,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn config(&self) -> &DesignConfig {
        &self.config
    }

    pub fn model(&self) -> &ProteinMPNN {
        &self.model
    }

    pub fn featurize(&self, record: &StructureRecord, constraints: &ConstraintSet) -> Result<ProteinFeatures> {
        featurize(
            record,
            &constraints.for_structure(&record.name),
            &self.options,
            &self.device,
        )
    }

    /// Featurize each record and hand it to `f` with the run RNG.
    ///
    /// Data errors, from parsing or from `f`, skip the structure with a warning.
    /// Every other error ends the run.
    pub fn for_each_structure<F>(
        &self,
        records: Vec<std::result::Result<StructureRecord, DataError>>,
        constraints: &ConstraintSet,
        mut f: F,
    ) -> Result<BatchSummary>
    where
        F: FnMut(&ProteinFeatures, &mut StdRng) -> Result<()>,
    {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut summary = BatchSummary::default();
        for (line, record) in records.into_iter().enumerate() {
            let outcome = record
                .map_err(|e| MpnnError::data(&format!("line {}", line + 1), e))
                .and_then(|record| self.featurize(&record, constraints))
                .and_then(|features| f(&features, &mut rng));
            match outcome {
                Ok(()) => summary.processed += 1,
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping: {e}");
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            "Processed {} structures, skipped {}",
            summary.processed, summary.skipped
        );
        Ok(summary)
    }

    fn encode(&self, features: &ProteinFeatures, rng: &mut StdRng) -> Result<EncodedStructure> {
        self.model
            .encode(features, rng)
            .at_stage(features.name(), Stage::Encode)
    }

    /// Native score, then `num_seq_per_target` samples per temperature.
    pub fn design(&self, features: &ProteinFeatures, rng: &mut StdRng) -> Result<StructureDesign> {
        let name = features.name().to_string();
        let layout = &features.layouts[0];
        let start = Instant::now();
        let encoded = self.encode(features, rng)?;
        let native = self.score_native(features, &encoded, rng)?;
        info!(
            "{name}: native score {:.4}, global score {:.4}",
            native.score, native.global_score
        );

        let b = self.config.batch_size;
        let batch = features.repeat_batch(b).at_stage(&name, Stage::Featurize)?;
        let design_mask = batch.design_mask().at_stage(&name, Stage::Featurize)?;
        let mut samples = Vec::with_capacity(self.config.temperatures.len() * self.config.num_seq_per_target);
        let (mut all_probs, mut all_log_probs, mut all_s) = (vec![], vec![], vec![]);

        for &temperature in &self.config.temperatures {
            let params = SamplingParams::new(&self.config, temperature, &self.device)
                .at_stage(&name, Stage::Sample)?;
            for j in 0..self.config.num_batches() {
                let encoded = if self.model.config().augment_eps > 0.0 {
                    self.encode(features, rng)?
                } else {
                    encoded.clone()
                };
                let encoded = encoded.repeat_batch(b).at_stage(&name, Stage::Encode)?;
                let orders: Vec<DecodingOrder> = (0..b).map(|_| layout.graph.schedule(rng)).collect();
                let ranks: Vec<Vec<u32>> = orders.iter().map(|o| o.ranks(layout.graph.len())).collect();
                let sampler = Sampler::new(rng.gen(), self.config.greedy);
                let out = sample_batch(&self.model, &batch, &encoded, orders, sampler, params.clone())?;
                debug!("{name}: T={temperature} batch {} sampled", j + 1);

                let rescore = || -> candle_core::Result<_> {
                    let ranks = ranks_tensor(&ranks, &self.device)?;
                    let scored = self.model.score(&batch, &encoded, &out.s, &ranks)?;
                    let scores = sequence_scores(&out.s, &scored.log_probs, &batch.mask, &design_mask)?;
                    let recovery = get_seq_rec(&batch.s, &out.s, &design_mask)?;
                    Ok((
                        scores.score.to_vec1::<f32>()?,
                        scores.global_score.to_vec1::<f32>()?,
                        recovery.to_vec1::<f32>()?,
                        out.s.to_vec2::<u32>()?,
                        scored.log_probs,
                    ))
                };
                let (score, global_score, recovery, symbols, log_probs) =
                    rescore().at_stage(&name, Stage::Score)?;
                let probs = if self.config.save_probs {
                    Some(out.probs.to_vec3::<f32>().at_stage(&name, Stage::Sample)?)
                } else {
                    None
                };

                for (row, s) in symbols.into_iter().enumerate() {
                    samples.push(DesignRecord {
                        name: name.clone(),
                        temperature,
                        sample: j * b + row + 1,
                        sequence: layout.sequence_string(&s),
                        designed_sequence: designed_sequence(layout, &s),
                        symbols: s,
                        score: score[row],
                        global_score: global_score[row],
                        seq_recovery: recovery[row],
                        designed_chains: layout.designed_chains(),
                        fixed_chains: layout.fixed_chains(),
                        probs: probs.as_ref().map(|p| p[row].clone()),
                    });
                }
                if self.config.save_probs {
                    all_probs.push(out.probs);
                    all_log_probs.push(log_probs);
                    all_s.push(out.s);
                }
            }
        }

        let archive = if self.config.save_probs {
            let build = || -> candle_core::Result<HashMap<String, Tensor>> {
                Ok(HashMap::from([
                    ("probs".to_string(), Tensor::cat(&all_probs, 0)?),
                    ("log_probs".to_string(), Tensor::cat(&all_log_probs, 0)?),
                    ("S".to_string(), Tensor::cat(&all_s, 0)?),
                    ("mask".to_string(), features.design_mask()?),
                ]))
            };
            Some(build().at_stage(&name, Stage::Sample)?)
        } else {
            None
        };

        info!(
            "{} sequences of length {} generated in {:.4} seconds",
            samples.len(),
            layout.graph.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(StructureDesign {
            native,
            samples,
            archive,
        })
    }

    fn score_native(
        &self,
        features: &ProteinFeatures,
        encoded: &EncodedStructure,
        rng: &mut StdRng,
    ) -> Result<NativeRecord> {
        let layout = &features.layouts[0];
        let order = layout.graph.schedule(rng);
        let score = || -> candle_core::Result<(f32, f32, Vec<u32>)> {
            let ranks = ranks_tensor(&[order.ranks(layout.graph.len())], &self.device)?;
            let out = self.model.score(features, encoded, &features.s, &ranks)?;
            let scores = sequence_scores(&features.s, &out.log_probs, &features.mask, &features.design_mask()?)?;
            let s = features.s.to_vec2::<u32>()?.remove(0);
            Ok((
                scores.score.to_vec1::<f32>()?[0],
                scores.global_score.to_vec1::<f32>()?[0],
                s,
            ))
        };
        let (score, global_score, s) = score().at_stage(features.name(), Stage::Score)?;
        Ok(NativeRecord {
            name: features.name().to_string(),
            sequence: designed_sequence(layout, &s),
            score,
            global_score,
            designed_chains: layout.designed_chains(),
            fixed_chains: layout.fixed_chains(),
            model_name: self.variant.name(),
            ca_only: self.model.config().ca_only,
            seed: self.seed,
        })
    }

    /// Score `sequences` (label, symbols) against the structure over
    /// `num_batches` batches of random decoding orders.
    pub fn score_sequences(
        &self,
        features: &ProteinFeatures,
        sequences: &[(String, Vec<u32>)],
        rng: &mut StdRng,
    ) -> Result<Vec<SequenceScoreArchive>> {
        let name = features.name().to_string();
        let layout = &features.layouts[0];
        let b = self.config.batch_size;
        let mut archives = Vec::with_capacity(sequences.len());
        for (source, symbols) in sequences {
            let s = Tensor::from_vec(symbols.clone(), (1, symbols.len()), &self.device)
                .and_then(|s| s.repeat((b, 1)))
                .at_stage(&name, Stage::Score)?;
            let batch = features
                .repeat_batch(b)
                .at_stage(&name, Stage::Featurize)?
                .with_sequence(s.clone());
            let (mut score, mut global_score) = (vec![], vec![]);
            for _ in 0..self.config.num_batches() {
                let encoded = self
                    .encode(features, rng)?
                    .repeat_batch(b)
                    .at_stage(&name, Stage::Encode)?;
                let ranks: Vec<Vec<u32>> = (0..b)
                    .map(|_| layout.graph.schedule(rng).ranks(layout.graph.len()))
                    .collect();
                let run = || -> candle_core::Result<(Vec<f32>, Vec<f32>)> {
                    let ranks = ranks_tensor(&ranks, &self.device)?;
                    let out = self.model.score(&batch, &encoded, &s, &ranks)?;
                    let scores = sequence_scores(&s, &out.log_probs, &batch.mask, &batch.design_mask()?)?;
                    Ok((scores.score.to_vec1()?, scores.global_score.to_vec1()?))
                };
                let (sc, gs) = run().at_stage(&name, Stage::Score)?;
                score.extend(sc);
                global_score.extend(gs);
            }
            let (mean, std) = SequenceScoreArchive::mean_std(&score);
            let (g_mean, g_std) = SequenceScoreArchive::mean_std(&global_score);
            info!(
                "Score for {name} from {source}, mean: {mean:.4}, std: {std:.4}, sample size: {},  global score, mean: {g_mean:.4}, std: {g_std:.4}",
                score.len()
            );
            archives.push(SequenceScoreArchive {
                name: name.clone(),
                source: source.clone(),
                seq_str: designed_sequence(layout, symbols),
                symbols: symbols.clone(),
                score,
                global_score,
            });
        }
        Ok(archives)
    }

    /// Parse FASTA sequences against the structure's layout. Sequences that do
    /// not fit are a data error for this structure.
    pub fn parse_sequences(
        &self,
        features: &ProteinFeatures,
        fasta: &[(String, String)],
    ) -> Result<Vec<(String, Vec<u32>)>> {
        let layout = &features.layouts[0];
        let mut sequences = vec![(
            "pdb".to_string(),
            features
                .s
                .to_vec2::<u32>()
                .at_stage(features.name(), Stage::Score)?
                .remove(0),
        )];
        for (i, (_, seq)) in fasta.iter().enumerate() {
            let parsed = layout
                .parse_sequence(seq)
                .map_err(|e| MpnnError::data(features.name(), e))?;
            sequences.push((format!("fasta_{}", i + 1), parsed));
        }
        Ok(sequences)
    }

    /// Log-probabilities [num_batches, L, 21] for every position, conditioned
    /// on the rest of the native sequence or on the backbone alone.
    pub fn conditional_probs(
        &self,
        features: &ProteinFeatures,
        backbone_only: bool,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        let name = features.name();
        info!("Calculating conditional probabilities for {name}");
        let layout = &features.layouts[0];
        let mut rows = Vec::with_capacity(self.config.num_batches());
        for _ in 0..self.config.num_batches() {
            let encoded = self.encode(features, rng)?;
            let order = layout.graph.schedule(rng).flattened();
            rows.push(
                self.model
                    .conditional_probs(features, &encoded, &order, backbone_only)
                    .at_stage(name, Stage::Decode)?,
            );
        }
        Tensor::cat(&rows, 0).at_stage(name, Stage::Decode)
    }

    /// Log-probabilities [num_batches, L, 21] from a single pass without any
    /// sequence information.
    pub fn unconditional_probs(&self, features: &ProteinFeatures, rng: &mut StdRng) -> Result<Tensor> {
        let name = features.name();
        info!("Calculating unconditional probabilities for {name}");
        let mut rows = Vec::with_capacity(self.config.num_batches());
        for _ in 0..self.config.num_batches() {
            let encoded = self.encode(features, rng)?;
            rows.push(
                self.model
                    .unconditional_probs(features, &encoded)
                    .at_stage(name, Stage::Decode)?,
            );
        }
        Tensor::cat(&rows, 0).at_stage(name, Stage::Decode)
    }

    /// `log_p`, `S`, `mask` and `design_mask` for a probability archive.
    pub fn probs_archive(&self, features: &ProteinFeatures, log_p: Tensor) -> Result<HashMap<String, Tensor>> {
        let build = || -> candle_core::Result<HashMap<String, Tensor>> {
            Ok(HashMap::from([
                ("log_p".to_string(), log_p),
                ("S".to_string(), features.s.squeeze(0)?),
                ("mask".to_string(), features.mask.squeeze(0)?),
                ("design_mask".to_string(), features.design_mask()?.squeeze(0)?),
            ]))
        };
        build().at_stage(features.name(), Stage::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proteinmpnn::configs::ProteinMPNNConfig;
    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};
    use ferritin_test_data::TestStructure;

    fn runner(config: DesignConfig) -> DesignRunner {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model_config = ProteinMPNNConfig {
            hidden_dim: 16,
            edge_features: 16,
            node_features: 16,
            k_neighbors: 8,
            ..ProteinMPNNConfig::proteinmpnn()
        };
        let model = ProteinMPNN::load(vb, &model_config).unwrap();
        let variant = ModelVariant::from_name("v_48_020", false, false).unwrap();
        DesignRunner::new(model, variant, config, device).unwrap()
    }

    fn record(name: &str, len: usize) -> StructureRecord {
        StructureRecord::from_json(&TestStructure::helix(name, "A", len).to_json()).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ProteinMPNN::load(vb, &ProteinMPNNConfig::proteinmpnn()).unwrap();
        let variant = ModelVariant::from_name("v_48_020", false, false).unwrap();
        let config = DesignConfig {
            temperatures: vec![0.0],
            ..Default::default()
        };
        assert!(matches!(
            DesignRunner::new(model, variant, config, device),
            Err(MpnnError::Config(_))
        ));
    }

    #[test]
    fn test_design_sweep() {
        let runner = runner(DesignConfig {
            temperatures: vec![0.1, 0.5],
            num_seq_per_target: 4,
            batch_size: 2,
            seed: Some(7),
            save_probs: true,
            ..Default::default()
        });
        let features = runner.featurize(&record("h", 10), &ConstraintSet::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(runner.seed());
        let design = runner.design(&features, &mut rng).unwrap();
        assert_eq!(design.samples.len(), 8);
        assert_eq!(design.native.seed, 7);
        let samples: Vec<usize> = design.samples.iter().map(|r| r.sample).collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 1, 2, 3, 4]);
        for record in &design.samples {
            assert_eq!(record.sequence.len(), 10);
            assert!(record.score.is_finite() && record.score > 0.0);
            assert_eq!(record.probs.as_ref().map(Vec::len), Some(10));
        }
        let archive = design.archive.unwrap();
        assert_eq!(archive["probs"].dims(), &[8, 10, 21]);
        assert_eq!(archive["S"].dims(), &[8, 10]);
    }

    #[test]
    fn test_same_seed_same_designs() {
        let config = DesignConfig {
            num_seq_per_target: 2,
            seed: Some(11),
            temperatures: vec![1.0],
            ..Default::default()
        };
        let run = |runner: &DesignRunner| {
            let features = runner.featurize(&record("h", 10), &ConstraintSet::default()).unwrap();
            let mut rng = StdRng::seed_from_u64(runner.seed());
            runner.design(&features, &mut rng).unwrap().samples
        };
        let a = runner(config.clone());
        let first = run(&a);
        let second = run(&a);
        let seqs = |r: &[DesignRecord]| r.iter().map(|d| d.sequence.clone()).collect::<Vec<_>>();
        assert_eq!(seqs(&first), seqs(&second));
    }

    #[test]
    fn test_batch_skips_data_errors() {
        let runner = runner(DesignConfig {
            max_length: 12,
            seed: Some(1),
            ..Default::default()
        });
        let records = vec![
            Ok(record("short", 8)),
            Ok(record("long", 20)),
            Err(DataError::Malformed("bad line".into())),
            Ok(record("other", 6)),
        ];
        let mut seen = vec![];
        let summary = runner
            .for_each_structure(records, &ConstraintSet::default(), |features, rng| {
                runner.design(features, rng)?;
                seen.push(features.name().to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(summary, BatchSummary { processed: 2, skipped: 2 });
        assert_eq!(seen, vec!["short", "other"]);
    }

    #[test]
    fn test_score_and_probs() {
        let runner = runner(DesignConfig {
            num_seq_per_target: 3,
            seed: Some(2),
            ..Default::default()
        });
        let features = runner.featurize(&record("h", 8), &ConstraintSet::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let fasta = vec![("x".to_string(), "AAAAAAAA".to_string())];
        let sequences = runner.parse_sequences(&features, &fasta).unwrap();
        assert_eq!(sequences[1].0, "fasta_1");
        let archives = runner.score_sequences(&features, &sequences, &mut rng).unwrap();
        assert_eq!(archives.len(), 2);
        assert_eq!(archives[0].score.len(), 3);
        assert_eq!(archives[1].seq_str, "AAAAAAAA");

        let bad = vec![("y".to_string(), "AAA".to_string())];
        assert!(runner.parse_sequences(&features, &bad).unwrap_err().is_recoverable());

        let log_p = runner.conditional_probs(&features, false, &mut rng).unwrap();
        assert_eq!(log_p.dims(), &[3, 8, 21]);
        let log_p = runner.unconditional_probs(&features, &mut rng).unwrap();
        let archive = runner.probs_archive(&features, log_p).unwrap();
        assert_eq!(archive["design_mask"].dims(), &[8]);
    }
}
