//! Tie groups and decoding-order scheduling.
//!
//! A [`PositionGraph`] is an arena of per-residue records built once during
//! featurization. Tie groups refer to positions by global index, so resolving a
//! group or scheduling an order never touches the chain dictionaries again.
use crate::error::ConfigError;
use candle_core::{Result, Tensor, D};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

#[derive(Debug, Clone, PartialEq)]
pub struct PositionRecord {
    pub chain: String,
    /// 0-based index inside the chain.
    pub chain_index: usize,
    pub global_index: usize,
    pub valid: bool,
    /// Valid, in a designed chain and not fixed.
    pub designable: bool,
    pub tie_group: Option<usize>,
    pub tie_weight: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionGraph {
    positions: Vec<PositionRecord>,
    groups: Vec<Vec<usize>>,
}

impl PositionGraph {
    pub fn new(positions: Vec<PositionRecord>) -> Self {
        Self {
            positions,
            groups: vec![],
        }
    }

    /// Register tie groups given as `(global index, weight)` members.
    ///
    /// Every member must be designable and belong to a single group.
    pub fn with_ties(
        mut self,
        structure: &str,
        groups: Vec<Vec<(usize, f32)>>,
    ) -> std::result::Result<Self, ConfigError> {
        for members in groups {
            let group_id = self.groups.len();
            let mut indices = Vec::with_capacity(members.len());
            for (idx, weight) in members {
                let record = &mut self.positions[idx];
                if !record.designable {
                    return Err(ConfigError::TiedFixedPosition {
                        structure: structure.to_string(),
                        chain: record.chain.clone(),
                        position: record.chain_index + 1,
                    });
                }
                if record.tie_group.is_some() {
                    return Err(ConfigError::OverlappingTies {
                        structure: structure.to_string(),
                        chain: record.chain.clone(),
                        position: record.chain_index + 1,
                    });
                }
                record.tie_group = Some(group_id);
                record.tie_weight = weight;
                indices.push(idx);
            }
            if !indices.is_empty() {
                self.groups.push(indices);
            }
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[PositionRecord] {
        &self.positions
    }

    pub fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }

    pub fn is_tied(&self) -> bool {
        !self.groups.is_empty()
    }

    pub fn tie_weight(&self, idx: usize) -> f32 {
        self.positions.get(idx).map_or(1.0, |p| p.tie_weight)
    }

    /// Positions resolved together: each tie group, then every untied
    /// designable position on its own.
    pub fn steps(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        self.groups.iter().cloned().chain(
            self.positions
                .iter()
                .filter(|p| p.designable && p.tie_group.is_none())
                .map(|p| vec![p.global_index]),
        )
    }

    pub fn designable(&self) -> impl Iterator<Item = usize> + '_ {
        self.positions
            .iter()
            .filter(|p| p.designable)
            .map(|p| p.global_index)
    }

    /// Extend with padding positions up to `len`.
    pub fn padded(&self, len: usize) -> Self {
        let mut positions = self.positions.clone();
        for global_index in positions.len()..len {
            positions.push(PositionRecord {
                chain: String::new(),
                chain_index: global_index,
                global_index,
                valid: false,
                designable: false,
                tie_group: None,
                tie_weight: 1.0,
            });
        }
        Self {
            positions,
            groups: self.groups.clone(),
        }
    }

    /// Draw a random decoding order.
    ///
    /// Non-designable positions go first as context. Designable positions are
    /// shuffled and each tie group is collapsed into the slot of whichever
    /// member came up first.
    pub fn schedule(&self, rng: &mut StdRng) -> DecodingOrder {
        let context = self
            .positions
            .iter()
            .filter(|p| !p.designable)
            .map(|p| p.global_index)
            .collect();
        let mut designable: Vec<usize> = self.designable().collect();
        designable.shuffle(rng);
        self.order_from(context, designable)
    }

    /// Fixed order over the designable positions, e.g. left to right.
    pub fn schedule_in(&self, designable_order: &[usize]) -> DecodingOrder {
        let context = self
            .positions
            .iter()
            .filter(|p| !p.designable)
            .map(|p| p.global_index)
            .collect();
        self.order_from(context, designable_order.to_vec())
    }

    fn order_from(&self, context: Vec<usize>, designable: Vec<usize>) -> DecodingOrder {
        let mut scheduled = vec![false; self.groups.len()];
        let mut steps = Vec::with_capacity(designable.len());
        for idx in designable {
            match self.positions[idx].tie_group {
                Some(group) if scheduled[group] => {}
                Some(group) => {
                    scheduled[group] = true;
                    steps.push(self.groups[group].clone());
                }
                None => steps.push(vec![idx]),
            }
        }
        DecodingOrder { context, steps }
    }
}

/// Context prefix followed by decoding steps. A step is one position or a whole
/// tie group.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodingOrder {
    pub context: Vec<usize>,
    pub steps: Vec<Vec<usize>>,
}

impl DecodingOrder {
    /// Every position in decoding order: context then steps.
    pub fn flattened(&self) -> Vec<usize> {
        self.context
            .iter()
            .copied()
            .chain(self.steps.iter().flatten().copied())
            .collect()
    }

    /// Rank of every position in the flattened order. Members of the same step
    /// share a rank, so they never condition on each other.
    pub fn ranks(&self, len: usize) -> Vec<u32> {
        let mut ranks = vec![0u32; len];
        let mut rank = 0u32;
        for &idx in &self.context {
            ranks[idx] = rank;
            rank += 1;
        }
        for step in &self.steps {
            for &idx in step {
                ranks[idx] = rank;
            }
            rank += 1;
        }
        ranks
    }

    /// Context positions are single steps too when walking the decoder.
    pub fn all_steps(&self) -> impl Iterator<Item = (bool, &[usize])> + '_ {
        self.context
            .iter()
            .map(std::slice::from_ref)
            .map(|s| (false, s))
            .chain(self.steps.iter().map(|s| (true, s.as_slice())))
    }

    pub fn num_steps(&self) -> usize {
        self.context.len() + self.steps.len()
    }
}

/// Combine raw member logits of a tie step.
///
/// `logits` [B,G,21], `weights` [B,G] (0 for padded slots), `sizes` [B]
/// => `Σ β·z / |group|` as [B,21].
pub fn combine_tied_logits(logits: &Tensor, weights: &Tensor, sizes: &Tensor) -> Result<Tensor> {
    logits
        .broadcast_mul(&weights.unsqueeze(D::Minus1)?)?
        .sum(1)?
        .broadcast_div(&sizes.unsqueeze(D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;

    fn graph(designable: &[bool]) -> PositionGraph {
        PositionGraph::new(
            designable
                .iter()
                .enumerate()
                .map(|(i, &d)| PositionRecord {
                    chain: if i < 3 { "A".into() } else { "B".into() },
                    chain_index: i % 3,
                    global_index: i,
                    valid: true,
                    designable: d,
                    tie_group: None,
                    tie_weight: 1.0,
                })
                .collect(),
        )
    }

    #[test]
    fn test_schedule_covers_designable_once() {
        let g = graph(&[true, false, true, true, true, false])
            .with_ties("s", vec![vec![(0, 1.0), (3, 1.0)]])
            .unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let order = g.schedule(&mut rng);
            assert_eq!(order.context, vec![1, 5]);
            let mut flat = order.flattened();
            assert_eq!(flat.len(), 6);
            flat.sort_unstable();
            assert_eq!(flat, vec![0, 1, 2, 3, 4, 5]);
            // group collapsed to one step
            assert_eq!(order.steps.len(), 3);
            assert!(order.steps.iter().any(|s| s == &vec![0, 3]));
            let ranks = order.ranks(6);
            assert_eq!(ranks[0], ranks[3]);
        }
    }

    #[test]
    fn test_group_takes_earliest_slot() {
        let g = graph(&[true, true, true, true, true, true])
            .with_ties("s", vec![vec![(1, 1.0), (4, 0.5)]])
            .unwrap();
        let order = g.schedule_in(&[2, 4, 0, 1, 3, 5]);
        assert_eq!(
            order.steps,
            vec![vec![2], vec![1, 4], vec![0], vec![3], vec![5]]
        );
        assert_eq!(g.tie_weight(4), 0.5);
    }

    #[test]
    fn test_tie_validation() {
        let err = graph(&[true, false, true, true, true, true])
            .with_ties("s", vec![vec![(0, 1.0), (1, 1.0)]])
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TiedFixedPosition { position: 2, .. }
        ));
        let err = graph(&[true; 6])
            .with_ties("s", vec![vec![(0, 1.0), (3, 1.0)], vec![(3, 1.0), (4, 1.0)]])
            .unwrap_err();
        assert!(matches!(err, ConfigError::OverlappingTies { .. }));
    }

    #[test]
    fn test_combine_tied_logits() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[[2f32, 0.0], [4.0, 2.0], [100.0, 100.0]]], &device).unwrap();
        let weights = Tensor::new(&[[1f32, 0.5, 0.0]], &device).unwrap();
        let sizes = Tensor::new(&[2f32], &device).unwrap();
        let z = combine_tied_logits(&logits, &weights, &sizes).unwrap();
        assert_eq!(z.to_vec2::<f32>().unwrap(), vec![vec![2.0, 0.5]]);
    }
}
