use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::encoding::one_hot;

/// ProteinMPNN residue alphabet. Index 20 is the unknown / masking symbol.
pub const ALPHABET: [char; 21] = [
    'A', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'K', 'L', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'V', 'W',
    'Y', 'X',
];
pub const NUM_LETTERS: usize = 21;
pub const UNKNOWN_RESIDUE: u32 = 20;

#[rustfmt::skip]
pub fn aa1to_int(aa: char) -> u32 {
    match aa.to_ascii_uppercase() {
        'A' => 0,  'C' => 1,  'D' => 2,
        'E' => 3,  'F' => 4,  'G' => 5,
        'H' => 6,  'I' => 7,  'K' => 8,
        'L' => 9,  'M' => 10, 'N' => 11,
        'P' => 12, 'Q' => 13, 'R' => 14,
        'S' => 15, 'T' => 16, 'V' => 17,
        'W' => 18, 'Y' => 19, _   => 20,
    }
}

/// Strict lookup used for user-supplied letters (bias / omit lists).
pub fn alphabet_index(aa: char) -> Option<usize> {
    ALPHABET.iter().position(|&c| c == aa.to_ascii_uppercase())
}

pub fn int_to_aa1(idx: u32) -> char {
    ALPHABET.get(idx as usize).copied().unwrap_or('X')
}

/// Concatenate edge features with the features of each neighbour node.
///
/// `h_neighbors` [B,N,K,C1] and `h_nodes` [B,N,C2] => [B,N,K,C1+C2]
pub fn cat_neighbors_nodes(
    h_nodes: &Tensor,
    h_neighbors: &Tensor,
    e_idx: &Tensor,
) -> Result<Tensor> {
    let h_nodes_gathered = gather_nodes(h_nodes, e_idx)?;
    Tensor::cat(&[h_neighbors, &h_nodes_gathered], D::Minus1)
}

/// k nearest neighbours on a [B,L,3] coordinate tensor.
///
/// Pairs involving a masked residue are pushed past every real distance so
/// they are only picked once the valid residues are exhausted.
pub fn compute_nearest_neighbors(
    coords: &Tensor,
    mask: &Tensor,
    k: usize,
    eps: f64,
) -> Result<(Tensor, Tensor)> {
    let (_, seq_len, _) = coords.dims3()?;
    let mask_2d = mask.unsqueeze(2)?.broadcast_mul(&mask.unsqueeze(1)?)?;
    let distances = (coords
        .unsqueeze(2)?
        .broadcast_sub(&coords.unsqueeze(1)?)?
        .sqr()?
        .sum(D::Minus1)?
        + eps)?
        .sqrt()?;
    let distances = (&distances * &mask_2d)?;
    let d_max = distances.max_keepdim(D::Minus1)?;
    let d_adjust = (&distances + (1.0 - &mask_2d)?.broadcast_mul(&d_max)?)?;
    topk_last_dim(&d_adjust, k.min(seq_len))
}

/// Smallest `topk` entries along the last dimension, ascending. Indices are u32.
pub fn topk_last_dim(xs: &Tensor, topk: usize) -> Result<(Tensor, Tensor)> {
    let sorted_indices = xs.contiguous()?.arg_sort_last_dim(true)?;
    let topk_indices = sorted_indices.narrow(D::Minus1, 0, topk)?.contiguous()?;
    Ok((xs.gather(&topk_indices, D::Minus1)?, topk_indices))
}

/// Virtual C-beta from N / CA / C, each [B,L,3].
pub fn calculate_cb(n: &Tensor, ca: &Tensor, c: &Tensor) -> Result<Tensor> {
    let b = (ca - n)?;
    let c = (c - ca)?;
    let a = cross_product(&b, &c)?;
    (((a * -0.58273431)? + (b * 0.56802827)?)? + (c * -0.54067466)?)? + ca
}

/// Cross product over the last dimension.
pub fn cross_product(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let last_dim = a.dims().len() - 1;

    let a0 = a.narrow(last_dim, 0, 1)?;
    let a1 = a.narrow(last_dim, 1, 1)?;
    let a2 = a.narrow(last_dim, 2, 1)?;

    let b0 = b.narrow(last_dim, 0, 1)?;
    let b1 = b.narrow(last_dim, 1, 1)?;
    let b2 = b.narrow(last_dim, 2, 1)?;

    let c0 = ((&a1 * &b2)? - (&a2 * &b1)?)?;
    let c1 = ((&a2 * &b0)? - (&a0 * &b2)?)?;
    let c2 = ((&a0 * &b1)? - (&a1 * &b0)?)?;

    Tensor::cat(&[&c0, &c1, &c2], last_dim)
}

/// Features [B,N,N,C] at neighbour indices [B,N,K] => [B,N,K,C]
pub fn gather_edges(edges: &Tensor, neighbor_idx: &Tensor) -> Result<Tensor> {
    let (d1, d2, d3) = neighbor_idx.dims3()?;
    let neighbors = neighbor_idx
        .unsqueeze(D::Minus1)?
        .expand((d1, d2, d3, edges.dim(D::Minus1)?))?
        .contiguous()?;
    edges.contiguous()?.gather(&neighbors, 2)
}

/// Features [B,N,C] at neighbour indices [B,M,K] => [B,M,K,C]
///
/// `M` may differ from `N`, which is what single-position decoding steps rely on.
pub fn gather_nodes(nodes: &Tensor, neighbor_idx: &Tensor) -> Result<Tensor> {
    let (batch_size, _, n_features) = nodes.dims3()?;
    let (_, m_nodes, k_neighbors) = neighbor_idx.dims3()?;
    let neighbors_flat = neighbor_idx
        .reshape((batch_size, m_nodes * k_neighbors))?
        .unsqueeze(2)?
        .expand((batch_size, m_nodes * k_neighbors, n_features))?
        .contiguous()?;
    nodes
        .contiguous()?
        .gather(&neighbors_flat, 1)?
        .reshape((batch_size, m_nodes, k_neighbors, n_features))
}

/// Rows of a [B,L,...] tensor at one position per batch row, `t` is [B] u32.
/// Returns [B,1,...].
pub fn gather_positions(xs: &Tensor, t: &Tensor) -> Result<Tensor> {
    let dims = xs.dims().to_vec();
    let b = dims[0];
    let mut idx_shape = dims.clone();
    idx_shape[1] = 1;
    let mut view = vec![b, 1];
    view.extend(std::iter::repeat(1).take(dims.len() - 2));
    let idx = t
        .reshape(view)?
        .broadcast_as(idx_shape)?
        .contiguous()?;
    xs.contiguous()?.gather(&idx, 1)
}

/// Overwrite position `t[b]` of every row `b` with `value` ([B,1,...]).
///
/// Implemented as a one-hot blend so writing the same value twice is harmless.
pub fn scatter_positions(xs: &Tensor, t: &Tensor, value: &Tensor) -> Result<Tensor> {
    let dims = xs.dims().to_vec();
    let l = dims[1];
    let mut view = vec![dims[0], l];
    view.extend(std::iter::repeat(1).take(dims.len() - 2));
    let hot = one_hot(t.clone(), l, 1f32, 0f32)?
        .to_dtype(xs.dtype())?
        .reshape(view)?;
    let keep = (1.0 - &hot)?;
    xs.broadcast_mul(&keep)?
        .broadcast_add(&hot.broadcast_mul(value)?)
}

pub fn linspace(start: f64, stop: f64, steps: usize, device: &Device) -> Result<Tensor> {
    if steps == 0 {
        Tensor::from_vec(Vec::<f32>::new(), steps, device)
    } else if steps == 1 {
        Tensor::from_vec(vec![start as f32], steps, device)
    } else {
        let delta = (stop - start) / (steps - 1) as f64;
        let vs = (0..steps)
            .map(|step| (start + step as f64 * delta) as f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(vs, steps, device)
    }
}

/// Mean negative log-likelihood of `s` [B,L] under `log_probs` [B,L,21], averaged
/// over `mask` [B,L]. Returns ([B] average, [B,L] per residue).
pub fn get_score(s: &Tensor, log_probs: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
    let s_one_hot = one_hot(s.clone(), NUM_LETTERS, 1f32, 0f32)?;
    let loss_per_residue = (s_one_hot * log_probs)?.sum(D::Minus1)?.neg()?;
    let average_loss = (&loss_per_residue * mask)?
        .sum(D::Minus1)?
        .broadcast_div(&(mask.sum(D::Minus1)? + 1e-8)?)?;
    Ok((average_loss, loss_per_residue))
}

/// Fraction of positions in `mask` where `s_pred` matches `s`. [B]
pub fn get_seq_rec(s: &Tensor, s_pred: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let matches = s.eq(s_pred)?.to_dtype(DType::F32)?;
    let numerator = (matches * mask)?.sum(D::Minus1)?;
    let denominator = mask.sum(D::Minus1)?;
    numerator.broadcast_div(&denominator)
}
