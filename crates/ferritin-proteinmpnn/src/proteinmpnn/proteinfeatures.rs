use super::configs::ProteinMPNNConfig;
use super::utilities::{
    calculate_cb, compute_nearest_neighbors, cross_product, gather_edges, gather_nodes, linspace,
};
use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::encoding::one_hot;
use candle_nn::{layer_norm, linear, linear_no_bias, LayerNorm, Linear, VarBuilder};

const D_MIN: f64 = 2.0;
const D_MAX: f64 = 22.0;
const DIST_EPS: f64 = 1e-6;

// Backbone atom pairs for the 24 RBF blocks that follow the CA-CA block.
// Atom slots: 0 N, 1 CA, 2 C, 3 O, 4 virtual CB.
#[rustfmt::skip]
const BACKBONE_PAIRS: [(usize, usize); 24] = [
    (0, 0), (2, 2), (3, 3), (4, 4),
    (1, 0), (1, 2), (1, 3), (1, 4),
    (0, 2), (0, 3), (0, 4), (4, 2), (4, 3), (3, 2),
    (0, 1), (2, 1), (3, 1), (4, 1),
    (2, 0), (3, 0), (4, 0), (2, 4), (3, 4), (2, 3),
];

// Pseudo-atom pairs for the Ca-only blocks: 0 previous CA, 1 CA, 2 next CA.
const CA_PAIRS: [(usize, usize); 8] = [(0, 0), (2, 2), (0, 1), (0, 2), (1, 0), (1, 2), (2, 0), (2, 1)];

/// Edge featurizer: kNN graph on CA plus RBF, positional and (Ca-only)
/// orientation features, embedded and normalized.
///
/// https://github.com/dauparas/ProteinMPNN/blob/main/protein_mpnn_utils.py
#[derive(Clone, Debug)]
pub struct ProteinFeaturesModel {
    ca_only: bool,
    num_rbf: usize,
    top_k: usize,
    embeddings: PositionalEncodings,
    edge_embedding: Linear,
    norm_edges: LayerNorm,
}

impl ProteinFeaturesModel {
    pub fn load(vb: VarBuilder, config: &ProteinMPNNConfig) -> Result<Self> {
        let embeddings = PositionalEncodings::new(
            config.num_positional_embeddings,
            config.max_relative_feature,
            vb.pp("embeddings"),
        )?;
        let edge_embedding =
            linear_no_bias(config.edge_in(), config.edge_features, vb.pp("edge_embedding"))?;
        let norm_edges = layer_norm(config.edge_features, 1e-5, vb.pp("norm_edges"))?;
        Ok(Self {
            ca_only: config.ca_only,
            num_rbf: config.num_rbf,
            top_k: config.k_neighbors,
            embeddings,
            edge_embedding,
            norm_edges,
        })
    }

    /// Gaussian radial basis expansion of distances [B,L,K] => [B,L,K,num_rbf]
    fn rbf(&self, d: &Tensor) -> Result<Tensor> {
        let d_mu = linspace(D_MIN, D_MAX, self.num_rbf, d.device())?
            .reshape((1, 1, 1, self.num_rbf))?;
        let d_sigma = (D_MAX - D_MIN) / self.num_rbf as f64;
        (d.unsqueeze(D::Minus1)?.broadcast_sub(&d_mu)? / d_sigma)?
            .sqr()?
            .neg()?
            .exp()
    }

    /// RBF of the distance between atom `a` of residue i and atom `b` of its
    /// k-th neighbour. `a`, `b` are [B,L,3].
    fn get_rbf(&self, a: &Tensor, b: &Tensor, e_idx: &Tensor) -> Result<Tensor> {
        let d_a_b = (a
            .unsqueeze(2)?
            .broadcast_sub(&b.unsqueeze(1)?)?
            .sqr()?
            .sum(D::Minus1)?
            + DIST_EPS)?
            .sqrt()?;
        let d_a_b_neighbors = gather_edges(&d_a_b.unsqueeze(D::Minus1)?, e_idx)?.squeeze(D::Minus1)?;
        self.rbf(&d_a_b_neighbors)
    }

    /// Relative residue offsets and same-chain flags of every edge, embedded.
    fn positional(&self, residue_idx: &Tensor, chain_encoding: &Tensor, e_idx: &Tensor) -> Result<Tensor> {
        let r_idx = residue_idx.to_dtype(DType::F32)?;
        let offset = r_idx.unsqueeze(2)?.broadcast_sub(&r_idx.unsqueeze(1)?)?;
        let offset = gather_edges(&offset.unsqueeze(D::Minus1)?, e_idx)?.squeeze(D::Minus1)?;

        let chains = chain_encoding.to_dtype(DType::F32)?;
        let d_chains = chains
            .unsqueeze(2)?
            .broadcast_sub(&chains.unsqueeze(1)?)?
            .eq(0f32)?
            .to_dtype(DType::F32)?;
        let e_chains = gather_edges(&d_chains.unsqueeze(D::Minus1)?, e_idx)?.squeeze(D::Minus1)?;
        self.embeddings.forward(&offset, &e_chains)
    }

    /// `x` is [B,L,4,3] (N, CA, C, O) or [B,L,1,3] in Ca-only mode.
    ///
    /// Returns `(E [B,L,K,C], E_idx [B,L,K])`.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        residue_idx: &Tensor,
        chain_encoding: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let ca = x.narrow(2, if self.ca_only { 0 } else { 1 }, 1)?.squeeze(2)?.contiguous()?;
        let (d_neighbors, e_idx) = compute_nearest_neighbors(&ca, mask, self.top_k, DIST_EPS)?;

        let mut rbf_all = vec![self.rbf(&d_neighbors)?];
        let e_positional = self.positional(residue_idx, chain_encoding, &e_idx)?;

        let e = if self.ca_only {
            let (b, l, _) = ca.dims3()?;
            let zeros = Tensor::zeros((b, 1, 3), DType::F32, ca.device())?;
            let (prev, next) = if l > 1 {
                (
                    Tensor::cat(&[&zeros, &ca.narrow(1, 0, l - 1)?], 1)?,
                    Tensor::cat(&[&ca.narrow(1, 1, l - 1)?, &zeros], 1)?,
                )
            } else {
                (zeros.clone(), zeros)
            };
            let atoms = [prev, ca.clone(), next];
            for (i, j) in CA_PAIRS {
                rbf_all.push(self.get_rbf(&atoms[i], &atoms[j], &e_idx)?);
            }
            let orientations = ca_orientations(&ca, &e_idx)?;
            Tensor::cat(
                &[e_positional, Tensor::cat(&rbf_all, D::Minus1)?, orientations],
                D::Minus1,
            )?
        } else {
            let atom = |k: usize| -> Result<Tensor> { x.narrow(2, k, 1)?.squeeze(2)?.contiguous() };
            let (n, c, o) = (atom(0)?, atom(2)?, atom(3)?);
            let cb = calculate_cb(&n, &ca, &c)?.contiguous()?;
            let atoms = [n, ca.clone(), c, o, cb];
            for (i, j) in BACKBONE_PAIRS {
                rbf_all.push(self.get_rbf(&atoms[i], &atoms[j], &e_idx)?);
            }
            Tensor::cat(&[e_positional, Tensor::cat(&rbf_all, D::Minus1)?], D::Minus1)?
        };

        let e = self.edge_embedding.forward(&e)?;
        let e = self.norm_edges.forward(&e)?;
        Ok((e, e_idx))
    }
}

#[derive(Clone, Debug)]
pub struct PositionalEncodings {
    max_relative_feature: usize,
    linear: Linear,
}

impl PositionalEncodings {
    pub fn new(num_embeddings: usize, max_relative_feature: usize, vb: VarBuilder) -> Result<Self> {
        let linear = linear(2 * max_relative_feature + 2, num_embeddings, vb.pp("linear"))?;
        Ok(Self {
            max_relative_feature,
            linear,
        })
    }

    /// `offset` and `same_chain` are f32 [B,L,K]. Offsets are clipped to
    /// `[-max, max]`; cross-chain edges get the extra bucket `2*max + 1`.
    pub fn forward(&self, offset: &Tensor, same_chain: &Tensor) -> Result<Tensor> {
        let max_rel = self.max_relative_feature as f64;
        let d = (offset + max_rel)?.clamp(0f64, 2.0 * max_rel)?;
        let d = ((d * same_chain)? + ((1.0 - same_chain)? * (2.0 * max_rel + 1.0))?)?;
        let d_onehot = one_hot(
            d.to_dtype(DType::U32)?,
            2 * self.max_relative_feature + 2,
            1f32,
            0f32,
        )?;
        self.linear.forward(&d_onehot)
    }
}

fn normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12)?;
    x.broadcast_div(&norm)
}

// 0 maps to 0
fn sign(x: &Tensor) -> Result<Tensor> {
    x.gt(0f64)?.to_dtype(DType::F32)? - x.lt(0f64)?.to_dtype(DType::F32)?
}

/// Rotation matrices [...,3,3] to unit quaternions [...,4] ordered `x, y, z, w`.
fn quaternions(r: &Tensor) -> Result<Tensor> {
    let at = |i: usize, j: usize| -> Result<Tensor> {
        r.narrow(D::Minus2, i, 1)?.narrow(D::Minus1, j, 1)?.squeeze(D::Minus1)
    };
    let (rxx, ryy, rzz) = (at(0, 0)?, at(1, 1)?, at(2, 2)?);
    let magnitudes = Tensor::cat(
        &[
            ((&rxx - &ryy)? - &rzz)?,
            ((&ryy - &rxx)? - &rzz)?,
            ((&rzz - &rxx)? - &ryy)?,
        ],
        D::Minus1,
    )?;
    let magnitudes = ((magnitudes + 1.0)?.abs()?.sqrt()? * 0.5)?;
    let signs = sign(&Tensor::cat(
        &[
            (at(2, 1)? - at(1, 2)?)?,
            (at(0, 2)? - at(2, 0)?)?,
            (at(1, 0)? - at(0, 1)?)?,
        ],
        D::Minus1,
    )?)?;
    let w = ((((&rxx + &ryy)? + &rzz)? + 1.0)?.relu()?.sqrt()? / 2.0)?;
    normalize(&Tensor::cat(&[(signs * magnitudes)?, w], D::Minus1)?)
}

/// Local frames from consecutive CA displacements, flattened row-major
/// [B,L,3] => [B,L,9]. Frame `i` sits on residue `i + 1`; residue 0 and the
/// last two residues have zero frames.
fn ca_frames(ca: &Tensor) -> Result<Tensor> {
    let (b, l, _) = ca.dims3()?;
    if l < 4 {
        return Tensor::zeros((b, l, 9), DType::F32, ca.device());
    }
    let dx = (ca.narrow(1, 1, l - 1)? - ca.narrow(1, 0, l - 1)?)?;
    let norm = dx.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    // CA-CA jumps across chain breaks are excluded
    let valid = (norm.gt(3.6f64)?.to_dtype(DType::F32)? * norm.lt(4.0f64)?.to_dtype(DType::F32)?)?;
    let u = normalize(&dx.broadcast_mul(&valid)?)?;
    let (u_2, u_1) = (u.narrow(1, 0, l - 3)?, u.narrow(1, 1, l - 3)?);
    let n_2 = normalize(&cross_product(&u_2, &u_1)?)?;
    let o_1 = normalize(&(&u_2 - &u_1)?)?;
    let frames = Tensor::cat(&[&o_1, &n_2, &cross_product(&o_1, &n_2)?], D::Minus1)?;
    Tensor::cat(
        &[
            &Tensor::zeros((b, 1, 9), DType::F32, ca.device())?,
            &frames,
            &Tensor::zeros((b, 2, 9), DType::F32, ca.device())?,
        ],
        1,
    )
}

/// 7 orientation features per edge: direction to the neighbour in the local
/// frame (3) and the relative rotation quaternion (4). `ca` [B,L,3], `e_idx`
/// [B,L,K] => [B,L,K,7].
fn ca_orientations(ca: &Tensor, e_idx: &Tensor) -> Result<Tensor> {
    let (b, l, k) = e_idx.dims3()?;
    let frames = ca_frames(ca)?;
    let o_j = gather_nodes(&frames, e_idx)?.reshape((b, l, k, 3, 3))?;
    let o_i = frames.reshape((b, l, 1, 3, 3))?;

    let dx = gather_nodes(ca, e_idx)?.broadcast_sub(&ca.unsqueeze(2)?)?;
    let du = normalize(&o_i.broadcast_mul(&dx.unsqueeze(3)?)?.sum(D::Minus1)?)?;

    // R = O_i^T O_j
    let r = o_i
        .reshape((b, l, 1, 3, 3, 1))?
        .broadcast_mul(&o_j.reshape((b, l, k, 3, 1, 3))?)?
        .sum(3)?;
    Tensor::cat(&[du, quaternions(&r)?], D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn helix_ca(l: usize) -> Vec<[f32; 3]> {
        (0..l)
            .map(|i| {
                let t = (i as f32 * 100.0).to_radians();
                [2.3 * t.cos(), 2.3 * t.sin(), 1.5 * i as f32]
            })
            .collect()
    }

    fn helix_tensor(l: usize) -> Tensor {
        let flat: Vec<f32> = helix_ca(l).into_iter().flatten().collect();
        Tensor::from_vec(flat, (1, l, 3), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_identity_quaternion() {
        let r = Tensor::eye(3, DType::F32, &Device::Cpu).unwrap();
        let q = quaternions(&r).unwrap().to_vec1::<f32>().unwrap();
        assert!((q[3] - 1.0).abs() < 1e-6);
        assert!(q[..3].iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_quarter_turn_quaternion() {
        // 90 degrees about z
        let r = Tensor::new(&[[0f32, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]], &Device::Cpu).unwrap();
        let q = quaternions(&r).unwrap().to_vec1::<f32>().unwrap();
        let h = std::f32::consts::FRAC_1_SQRT_2;
        for (got, want) in q.iter().zip([0.0, 0.0, h, h]) {
            assert!((got - want).abs() < 1e-5);
        }
    }

    #[test]
    fn test_frames_are_orthonormal() {
        let frames = ca_frames(&helix_tensor(8)).unwrap().to_vec3::<f32>().unwrap().remove(0);
        assert!(frames[0].iter().all(|v| *v == 0.0));
        assert!(frames[6].iter().all(|v| *v == 0.0));
        assert!(frames[7].iter().all(|v| *v == 0.0));
        let dot = |f: &[f32], a: usize, b: usize| (0..3).map(|c| f[3 * a + c] * f[3 * b + c]).sum::<f32>();
        for f in &frames[1..6] {
            for a in 0..3 {
                assert!((dot(f, a, a) - 1.0).abs() < 1e-4);
                for b in a + 1..3 {
                    assert!(dot(f, a, b).abs() < 1e-4);
                }
            }
        }
    }

    #[test]
    fn test_chain_break_drops_frames() {
        let mut ca = helix_ca(8);
        for c in &mut ca[4..] {
            c[2] += 20.0;
        }
        let flat: Vec<f32> = ca.into_iter().flatten().collect();
        let ca = Tensor::from_vec(flat, (1, 8, 3), &Device::Cpu).unwrap();
        let frames = ca_frames(&ca).unwrap().to_vec3::<f32>().unwrap().remove(0);
        assert!(frames[1].iter().all(|v| v.is_finite()) && frames[1][3..6].iter().any(|v| *v != 0.0));
        // frames 3 and 4 use the 3->4 jump: no normal, only the bisector row
        for f in &frames[3..5] {
            assert!(f[3..].iter().all(|v| v.abs() < 1e-6));
            assert!((f[..3].iter().map(|v| v * v).sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_orientation_self_edge() {
        let l = 8;
        let ca = helix_tensor(l);
        let mask = Tensor::ones((1, l), DType::F32, &Device::Cpu).unwrap();
        let (_, e_idx) = compute_nearest_neighbors(&ca, &mask, 4, DIST_EPS).unwrap();
        let features = ca_orientations(&ca, &e_idx).unwrap();
        assert_eq!(features.dims(), &[1, l, 4, 7]);
        let features: Vec<Vec<Vec<f32>>> = features.squeeze(0).unwrap().to_vec3().unwrap();
        let e_idx: Vec<Vec<u32>> = e_idx.squeeze(0).unwrap().to_vec2().unwrap();
        for i in 1..l - 2 {
            let k = e_idx[i].iter().position(|&j| j as usize == i).unwrap();
            let f = &features[i][k];
            assert!(f[..3].iter().all(|v| v.abs() < 1e-6));
            assert!((f[6] - 1.0).abs() < 1e-4);
            for (kk, &j) in e_idx[i].iter().enumerate() {
                let q = &features[i][kk][3..];
                assert!((q.iter().map(|v| v * v).sum::<f32>() - 1.0).abs() < 1e-4);
                if j as usize != i {
                    let du = &features[i][kk][..3];
                    assert!((du.iter().map(|v| v * v).sum::<f32>() - 1.0).abs() < 1e-4);
                }
            }
        }
    }

    #[test]
    fn test_positional_buckets() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let pe = PositionalEncodings::new(16, 32, vb).unwrap();
        let offset = Tensor::new(&[[[0f32, -40.0, 5.0]]], &device).unwrap();
        let same = Tensor::new(&[[[1f32, 1.0, 0.0]]], &device).unwrap();
        assert_eq!(pe.forward(&offset, &same).unwrap().dims(), &[1, 1, 3, 16]);
    }

    fn edge_features(config: &ProteinMPNNConfig, atoms: usize) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = ProteinFeaturesModel::load(vb, config).unwrap();
        let l = 10;
        let ca = helix_ca(l);
        let mut x = Vec::new();
        for c in &ca {
            for a in 0..atoms {
                x.extend_from_slice(&[c[0] + a as f32 * 0.7, c[1] - a as f32 * 0.3, c[2] + 0.1 * a as f32]);
            }
        }
        let x = Tensor::from_vec(x, (1, l, atoms, 3), &device).unwrap();
        let mask = Tensor::ones((1, l), DType::F32, &device).unwrap();
        let r_idx = Tensor::arange(0i64, l as i64, &device).unwrap().unsqueeze(0).unwrap();
        let chains = Tensor::ones((1, l), DType::I64, &device).unwrap();
        model.forward(&x, &mask, &r_idx, &chains).unwrap()
    }

    #[test]
    fn test_full_atom_edges() {
        let config = ProteinMPNNConfig {
            k_neighbors: 6,
            edge_features: 32,
            ..ProteinMPNNConfig::proteinmpnn()
        };
        let (e, e_idx) = edge_features(&config, 4);
        assert_eq!(e.dims(), &[1, 10, 6, 32]);
        assert_eq!(e_idx.dims(), &[1, 10, 6]);
    }

    #[test]
    fn test_ca_only_edges_clamp_k() {
        let config = ProteinMPNNConfig {
            k_neighbors: 48,
            edge_features: 32,
            ..ProteinMPNNConfig::ca_proteinmpnn()
        };
        let (e, e_idx) = edge_features(&config, 1);
        assert_eq!(e.dims(), &[1, 10, 10, 32]);
        assert_eq!(e_idx.dims(), &[1, 10, 10]);
    }
}
