//! Protein Featurizer for ProteinMPNN
//!
//! Turns a parsed structure record plus its constraint dictionaries into the
//! fixed-shape tensors consumed by the model:
//! - backbone coordinates, native sequence and validity mask
//! - chain encodings and the residue-index space shared by all chains
//! - designability masks, per-position omissions and biases
//! - profile (PSSM) coefficient, distribution and log-odds
//!
//! Chains are always laid out in alphabetical order of their ids.
use super::configs::DesignConfig;
use super::constraints::{PositionGraph, PositionRecord};
use super::utilities::{aa1to_int, alphabet_index, int_to_aa1, NUM_LETTERS};
use crate::error::{AtStage, DataError, MpnnError, Stage};
use crate::inputs::{Coord, StructureConstraints, StructureRecord};
use candle_core::{Device, Tensor};
use itertools::Itertools;
use std::collections::BTreeSet;

/// Residue-index gap inserted between consecutive chains.
const CHAIN_OFFSET: i64 = 100;
/// Log-odds value that passes any gate threshold.
const NEUTRAL_LOG_ODDS: f32 = 10000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ChainSpan {
    pub id: String,
    pub start: usize,
    pub len: usize,
    pub designed: bool,
}

/// Per-row bookkeeping that does not live in tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct StructureLayout {
    pub name: String,
    pub chains: Vec<ChainSpan>,
    pub graph: PositionGraph,
}

impl StructureLayout {
    /// Number of real (unpadded) residues.
    pub fn len(&self) -> usize {
        self.chains.iter().map(|c| c.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn designed_chains(&self) -> Vec<String> {
        self.chains
            .iter()
            .filter(|c| c.designed)
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn fixed_chains(&self) -> Vec<String> {
        self.chains
            .iter()
            .filter(|c| !c.designed)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Render symbol indices with `/` between chains.
    pub fn sequence_string(&self, s: &[u32]) -> String {
        self.chains
            .iter()
            .map(|c| {
                s[c.start..c.start + c.len]
                    .iter()
                    .map(|&i| int_to_aa1(i))
                    .collect::<String>()
            })
            .join("/")
    }

    /// Parse a `/`-separated (or plain) sequence into symbol indices.
    pub fn parse_sequence(&self, seq: &str) -> Result<Vec<u32>, DataError> {
        let symbols: Vec<u32> = seq
            .chars()
            .filter(|c| *c != '/' && !c.is_whitespace())
            .map(aa1to_int)
            .collect();
        if symbols.len() != self.len() {
            return Err(DataError::SequenceLength {
                found: symbols.len(),
                expected: self.len(),
            });
        }
        Ok(symbols)
    }
}

#[derive(Debug, Clone)]
pub struct ProteinFeatures {
    /// [B, L, A, 3] with A = 4 (N, CA, C, O) or 1 (CA only)
    pub x: Tensor,
    /// [B, L] u32
    pub s: Tensor,
    /// [B, L] residue validity
    pub mask: Tensor,
    /// [B, L] designed chain membership
    pub chain_mask: Tensor,
    /// [B, L] 0 at fixed positions
    pub position_mask: Tensor,
    /// [B, L] i64
    pub chain_encoding: Tensor,
    /// [B, L] i64
    pub residue_idx: Tensor,
    /// [B, L, 21] 1 = forbidden
    pub omit_mask: Tensor,
    /// [B, L, 21]
    pub bias_by_res: Tensor,
    /// [B, L]
    pub pssm_coef: Tensor,
    /// [B, L, 21]
    pub pssm_bias: Tensor,
    /// [B, L, 21]
    pub pssm_log_odds: Tensor,
    pub layouts: Vec<StructureLayout>,
}

/// Structure-independent featurization settings.
#[derive(Debug, Clone)]
pub struct FeaturizeOptions {
    pub ca_only: bool,
    pub max_length: usize,
    pub omit_global: [bool; NUM_LETTERS],
    /// Profile blend weight `m`, only when the blend is switched on.
    pub profile_multi: Option<f64>,
}

impl FeaturizeOptions {
    pub fn new(config: &DesignConfig, ca_only: bool) -> Result<Self, crate::error::ConfigError> {
        Ok(Self {
            ca_only,
            max_length: config.max_length,
            omit_global: config.omit_mask()?,
            profile_multi: config.profile.bias_flag.then_some(config.profile.multi),
        })
    }
}

impl Default for FeaturizeOptions {
    fn default() -> Self {
        Self {
            ca_only: false,
            max_length: usize::MAX,
            omit_global: [false; NUM_LETTERS],
            profile_multi: None,
        }
    }
}

fn check_position(chain: &ChainSpan, position: usize) -> Result<usize, DataError> {
    if position == 0 || position > chain.len {
        return Err(DataError::PositionOutOfRange {
            chain: chain.id.clone(),
            position,
            length: chain.len,
        });
    }
    Ok(chain.start + position - 1)
}

fn check_rows(
    field: &'static str,
    chain: &ChainSpan,
    rows: &[Vec<f32>],
) -> Result<(), DataError> {
    if rows.len() != chain.len {
        return Err(DataError::RowCount {
            field,
            chain: chain.id.clone(),
            found: rows.len(),
            expected: chain.len,
        });
    }
    if let Some(row) = rows.iter().find(|r| r.len() != NUM_LETTERS) {
        return Err(DataError::RowWidth {
            field,
            chain: chain.id.clone(),
            found: row.len(),
        });
    }
    Ok(())
}

/// Every decoding step must leave some residue with probability mass.
///
/// A step covers one position or a whole tie group. Its omission set is the
/// union over members plus the global list. With the profile blend at full
/// weight the step distribution is the member-averaged profile, which must
/// then put mass outside the omission set.
fn check_resolvable(
    graph: &PositionGraph,
    members: &[usize],
    omit: &[f32],
    pssm_coef: &[f32],
    pssm_bias: &[f32],
    options: &FeaturizeOptions,
) -> Result<(), DataError> {
    let Some(&first) = members.first() else {
        return Ok(());
    };
    let record = &graph.positions()[first];
    let omitted: Vec<bool> = (0..NUM_LETTERS)
        .map(|k| options.omit_global[k] || members.iter().any(|&g| omit[g * NUM_LETTERS + k] > 0.0))
        .collect();
    if omitted.iter().all(|&o| o) {
        return Err(DataError::DegenerateOmission {
            chain: record.chain.clone(),
            position: record.chain_index + 1,
        });
    }
    if let Some(multi) = options.profile_multi {
        let n = members.len() as f32;
        let coef = members.iter().map(|&g| pssm_coef[g]).sum::<f32>() / n;
        if multi as f32 * coef >= 1.0 {
            let mass: f32 = (0..NUM_LETTERS)
                .filter(|&k| !omitted[k])
                .map(|k| members.iter().map(|&g| pssm_bias[g * NUM_LETTERS + k]).sum::<f32>() / n)
                .sum();
            if mass <= 0.0 {
                return Err(DataError::DegenerateProfile {
                    chain: record.chain.clone(),
                    position: record.chain_index + 1,
                });
            }
        }
    }
    Ok(())
}

/// Featurize one structure into a batch of size 1.
pub fn featurize(
    record: &StructureRecord,
    constraints: &StructureConstraints,
    options: &FeaturizeOptions,
    device: &Device,
) -> crate::error::Result<ProteinFeatures> {
    let name = record.name.as_str();
    let data = |e: DataError| MpnnError::data(name, e);

    let length = record.len();
    if length > options.max_length {
        return Err(data(DataError::TooLong {
            length,
            max: options.max_length,
        }));
    }
    if let Some(missing) = constraints
        .referenced_chains()
        .into_iter()
        .find(|id| record.chain(id).is_none())
    {
        return Err(data(DataError::UnknownChain(missing.to_string())));
    }

    // chain layout
    let fixed_chains: BTreeSet<&str> = constraints.fixed_chains.iter().map(String::as_str).collect();
    let mut chains = Vec::with_capacity(record.chains.len());
    let mut start = 0;
    for chain in &record.chains {
        let designed = match &constraints.designed_chains {
            Some(designed) => designed.contains(&chain.id),
            None => true,
        } && !fixed_chains.contains(chain.id.as_str());
        chains.push(ChainSpan {
            id: chain.id.clone(),
            start,
            len: chain.len(),
            designed,
        });
        start += chain.len();
    }
    let span = |id: &str| chains.iter().find(|c| c.id == id);

    let atoms = if options.ca_only { 1 } else { 4 };
    let mut x = vec![0f32; length * atoms * 3];
    let mut s = vec![0u32; length];
    let mut mask = vec![0f32; length];
    let mut chain_mask = vec![0f32; length];
    let mut position_mask = vec![1f32; length];
    let mut chain_encoding = vec![0i64; length];
    let mut residue_idx = vec![0i64; length];

    for (rank, (chain, span)) in record.chains.iter().zip(chains.iter()).enumerate() {
        let backbone: [&[Coord]; 4] = [&chain.n, &chain.ca, &chain.c, &chain.o];
        for (i, aa) in chain.sequence.chars().enumerate() {
            let g = span.start + i;
            s[g] = aa1to_int(aa);
            chain_mask[g] = if span.designed { 1.0 } else { 0.0 };
            chain_encoding[g] = rank as i64 + 1;
            residue_idx[g] = CHAIN_OFFSET * rank as i64 + g as i64;

            let coords: Vec<Coord> = if options.ca_only {
                vec![backbone[1][i]]
            } else {
                backbone.iter().map(|atom| atom[i]).collect()
            };
            if coords.iter().all(Option::is_some) {
                mask[g] = 1.0;
                for (a, xyz) in coords.iter().flatten().enumerate() {
                    x[(g * atoms + a) * 3..(g * atoms + a) * 3 + 3].copy_from_slice(xyz);
                }
            }
        }
    }

    for (chain_id, positions) in &constraints.fixed_positions {
        let Some(chain) = span(chain_id) else { continue };
        for &p in positions {
            position_mask[check_position(chain, p).map_err(data)?] = 0.0;
        }
    }

    let mut omit = vec![0f32; length * NUM_LETTERS];
    for (chain_id, entries) in &constraints.omit_positions {
        let Some(chain) = span(chain_id) else { continue };
        for (positions, letters) in entries {
            for &p in positions {
                let g = check_position(chain, p).map_err(data)?;
                for aa in letters.chars().filter(|c| !c.is_whitespace()) {
                    let k = alphabet_index(aa).ok_or_else(|| {
                        data(DataError::Malformed(format!(
                            "'{aa}' is not a residue letter in the omission dictionary"
                        )))
                    })?;
                    omit[g * NUM_LETTERS + k] = 1.0;
                }
            }
        }
    }

    let mut bias_by_res = vec![0f32; length * NUM_LETTERS];
    for (chain_id, rows) in &constraints.bias_by_res {
        let Some(chain) = span(chain_id) else { continue };
        check_rows("bias_by_res", chain, rows).map_err(data)?;
        for (i, row) in rows.iter().enumerate() {
            let g = chain.start + i;
            bias_by_res[g * NUM_LETTERS..(g + 1) * NUM_LETTERS].copy_from_slice(row);
        }
    }

    let mut pssm_coef = vec![0f32; length];
    let mut pssm_bias = vec![0f32; length * NUM_LETTERS];
    let mut pssm_log_odds = vec![NEUTRAL_LOG_ODDS; length * NUM_LETTERS];
    for (chain_id, profile) in &constraints.profiles {
        let Some(chain) = span(chain_id) else { continue };
        if !profile.pssm_coef.is_empty() {
            if profile.pssm_coef.len() != chain.len {
                return Err(data(DataError::RowCount {
                    field: "pssm_coef",
                    chain: chain.id.clone(),
                    found: profile.pssm_coef.len(),
                    expected: chain.len,
                }));
            }
            pssm_coef[chain.start..chain.start + chain.len].copy_from_slice(&profile.pssm_coef);
        }
        for (field, rows, target) in [
            ("pssm_bias", &profile.pssm_bias, &mut pssm_bias),
            ("pssm_log_odds", &profile.pssm_log_odds, &mut pssm_log_odds),
        ] {
            if rows.is_empty() {
                continue;
            }
            check_rows(field, chain, rows).map_err(data)?;
            for (i, row) in rows.iter().enumerate() {
                let g = chain.start + i;
                target[g * NUM_LETTERS..(g + 1) * NUM_LETTERS].copy_from_slice(row);
            }
        }
    }

    // position graph
    let mut positions = Vec::with_capacity(length);
    for chain in &chains {
        for i in 0..chain.len {
            let g = chain.start + i;
            positions.push(PositionRecord {
                chain: chain.id.clone(),
                chain_index: i,
                global_index: g,
                valid: mask[g] > 0.0,
                designable: mask[g] > 0.0 && chain.designed && position_mask[g] > 0.0,
                tie_group: None,
                tie_weight: 1.0,
            });
        }
    }
    let mut ties = Vec::with_capacity(constraints.tied_positions.len());
    for group in &constraints.tied_positions {
        let mut members = Vec::with_capacity(group.len());
        for member in group {
            let chain = span(&member.chain)
                .ok_or_else(|| data(DataError::UnknownChain(member.chain.clone())))?;
            members.push((check_position(chain, member.position).map_err(data)?, member.weight));
        }
        ties.push(members);
    }
    let graph = PositionGraph::new(positions).with_ties(name, ties)?;
    for members in graph.steps() {
        check_resolvable(&graph, &members, &omit, &pssm_coef, &pssm_bias, options).map_err(data)?;
    }

    let build = || -> candle_core::Result<ProteinFeatures> {
        Ok(ProteinFeatures {
            x: Tensor::from_vec(x, (1, length, atoms, 3), device)?,
            s: Tensor::from_vec(s, (1, length), device)?,
            mask: Tensor::from_vec(mask, (1, length), device)?,
            chain_mask: Tensor::from_vec(chain_mask, (1, length), device)?,
            position_mask: Tensor::from_vec(position_mask, (1, length), device)?,
            chain_encoding: Tensor::from_vec(chain_encoding, (1, length), device)?,
            residue_idx: Tensor::from_vec(residue_idx, (1, length), device)?,
            omit_mask: Tensor::from_vec(omit, (1, length, NUM_LETTERS), device)?,
            bias_by_res: Tensor::from_vec(bias_by_res, (1, length, NUM_LETTERS), device)?,
            pssm_coef: Tensor::from_vec(pssm_coef, (1, length), device)?,
            pssm_bias: Tensor::from_vec(pssm_bias, (1, length, NUM_LETTERS), device)?,
            pssm_log_odds: Tensor::from_vec(pssm_log_odds, (1, length, NUM_LETTERS), device)?,
            layouts: vec![StructureLayout {
                name: name.to_string(),
                chains,
                graph,
            }],
        })
    };
    build().at_stage(name, Stage::Featurize)
}

fn repeat_rows(t: &Tensor, b: usize) -> candle_core::Result<Tensor> {
    let mut reps = vec![1usize; t.rank()];
    reps[0] = b;
    t.repeat(reps)
}

fn pad_positions(t: &Tensor, len: usize) -> candle_core::Result<Tensor> {
    let current = t.dim(1)?;
    if current == len {
        Ok(t.clone())
    } else {
        t.pad_with_zeros(1, 0, len - current)
    }
}

impl ProteinFeatures {
    pub fn batch_size(&self) -> usize {
        self.layouts.len()
    }

    pub fn seq_len(&self) -> candle_core::Result<usize> {
        self.s.dim(1)
    }

    pub fn device(&self) -> &Device {
        self.s.device()
    }

    pub fn name(&self) -> &str {
        self.layouts.first().map_or("", |l| l.name.as_str())
    }

    /// Positions the sampler may change: valid, designed chain, not fixed.
    pub fn design_mask(&self) -> candle_core::Result<Tensor> {
        (&self.mask * &self.chain_mask)? * &self.position_mask
    }

    fn map_tensors(
        &self,
        layouts: Vec<StructureLayout>,
        f: impl Fn(&Tensor) -> candle_core::Result<Tensor>,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            x: f(&self.x)?,
            s: f(&self.s)?,
            mask: f(&self.mask)?,
            chain_mask: f(&self.chain_mask)?,
            position_mask: f(&self.position_mask)?,
            chain_encoding: f(&self.chain_encoding)?,
            residue_idx: f(&self.residue_idx)?,
            omit_mask: f(&self.omit_mask)?,
            bias_by_res: f(&self.bias_by_res)?,
            pssm_coef: f(&self.pssm_coef)?,
            pssm_bias: f(&self.pssm_bias)?,
            pssm_log_odds: f(&self.pssm_log_odds)?,
            layouts,
        })
    }

    /// `b` replicate copies of a single-structure batch.
    pub fn repeat_batch(&self, b: usize) -> candle_core::Result<Self> {
        if self.batch_size() != 1 {
            candle_core::bail!("repeat_batch expects a batch of one, got {}", self.batch_size());
        }
        let layouts = vec![self.layouts[0].clone(); b];
        self.map_tensors(layouts, |t| repeat_rows(t, b))
    }

    /// Replace the native sequence, e.g. with sequences read from FASTA.
    pub fn with_sequence(&self, s: Tensor) -> Self {
        Self {
            s,
            ..self.clone()
        }
    }

    /// Pad several feature sets to a common length and stack them.
    ///
    /// Tied feature sets carry per-structure scheduling and are rejected.
    pub fn collate(items: &[ProteinFeatures]) -> crate::error::Result<Self> {
        let Some(first) = items.first() else {
            return Err(MpnnError::data(
                "",
                DataError::Malformed("nothing to collate".into()),
            ));
        };
        if let Some(tied) = items
            .iter()
            .flat_map(|f| f.layouts.iter())
            .find(|l| l.graph.is_tied())
        {
            return Err(MpnnError::data(
                &tied.name,
                DataError::Malformed("tied feature sets cannot be collated".into()),
            ));
        }
        let collate = || -> candle_core::Result<Self> {
            let mut max_len = 0;
            for item in items {
                max_len = max_len.max(item.seq_len()?);
            }
            let layouts = items
                .iter()
                .flat_map(|f| f.layouts.iter())
                .map(|l| StructureLayout {
                    graph: l.graph.padded(max_len),
                    ..l.clone()
                })
                .collect();
            let padded = items
                .iter()
                .map(|item| item.map_tensors(vec![], |t| pad_positions(t, max_len)))
                .collect::<candle_core::Result<Vec<_>>>()?;
            let stack = |get: fn(&Self) -> &Tensor| -> candle_core::Result<Tensor> {
                Tensor::cat(&padded.iter().map(get).collect::<Vec<_>>(), 0)
            };
            Ok(Self {
                x: stack(|f| &f.x)?,
                s: stack(|f| &f.s)?,
                mask: stack(|f| &f.mask)?,
                chain_mask: stack(|f| &f.chain_mask)?,
                position_mask: stack(|f| &f.position_mask)?,
                chain_encoding: stack(|f| &f.chain_encoding)?,
                residue_idx: stack(|f| &f.residue_idx)?,
                omit_mask: stack(|f| &f.omit_mask)?,
                bias_by_res: stack(|f| &f.bias_by_res)?,
                pssm_coef: stack(|f| &f.pssm_coef)?,
                pssm_bias: stack(|f| &f.pssm_bias)?,
                pssm_log_odds: stack(|f| &f.pssm_log_odds)?,
                layouts,
            })
        };
        collate().at_stage(first.name(), Stage::Featurize)
    }
}
