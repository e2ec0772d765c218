//! Records and writers for design results.
//!
//! FASTA files follow the classic ProteinMPNN layout: the native sequence first,
//! then one entry per sample. Score archives are JSON, probability archives are
//! safetensors.
use super::featurizer::StructureLayout;
use super::utilities::int_to_aa1;
use candle_core::Tensor;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Score of the native sequence, reported before any sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NativeRecord {
    pub name: String,
    /// Designed chains only, `/` between chains.
    pub sequence: String,
    pub score: f32,
    pub global_score: f32,
    pub designed_chains: Vec<String>,
    pub fixed_chains: Vec<String>,
    pub model_name: String,
    pub ca_only: bool,
    pub seed: u64,
}

/// One sampled sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesignRecord {
    pub name: String,
    pub temperature: f64,
    /// 1-based, counted across batches of one temperature.
    pub sample: usize,
    /// All chains in canonical order, `/` between chains.
    pub sequence: String,
    /// Designed chains only, as written to FASTA.
    pub designed_sequence: String,
    pub symbols: Vec<u32>,
    pub score: f32,
    pub global_score: f32,
    pub seq_recovery: f32,
    pub designed_chains: Vec<String>,
    pub fixed_chains: Vec<String>,
    /// [L][21] sampling distributions when requested.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub probs: Option<Vec<Vec<f32>>>,
}

/// Residues of the designed chains, `/` between chains.
pub fn designed_sequence(layout: &StructureLayout, s: &[u32]) -> String {
    layout
        .chains
        .iter()
        .filter(|c| c.designed)
        .map(|c| {
            s[c.start..c.start + c.len]
                .iter()
                .map(|&i| int_to_aa1(i))
                .collect::<String>()
        })
        .join("/")
}

fn score4(x: f32) -> String {
    format!("{x:.4}")
}

/// `['A', 'B']`
fn chain_list(chains: &[String]) -> String {
    let inner = chains
        .iter()
        .map(|c| format!("'{c}'"))
        .join(", ");
    format!("[{inner}]")
}

pub fn native_header(native: &NativeRecord) -> String {
    let model_key = if native.ca_only {
        "CA_model_name"
    } else {
        "model_name"
    };
    format!(
        ">{}, score={}, global_score={}, fixed_chains={}, designed_chains={}, {}={}, seed={}",
        native.name,
        score4(native.score),
        score4(native.global_score),
        chain_list(&native.fixed_chains),
        chain_list(&native.designed_chains),
        model_key,
        native.model_name,
        native.seed
    )
}

pub fn sample_header(record: &DesignRecord) -> String {
    format!(
        ">T={:?}, sample={}, score={}, global_score={}, seq_recovery={}",
        record.temperature,
        record.sample,
        score4(record.score),
        score4(record.global_score),
        score4(record.seq_recovery)
    )
}

pub fn render_fasta(native: &NativeRecord, samples: &[DesignRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}\n{}", native_header(native), native.sequence);
    for record in samples {
        let _ = writeln!(out, "{}\n{}", sample_header(record), record.designed_sequence);
    }
    out
}

pub fn write_fasta(path: &Path, native: &NativeRecord, samples: &[DesignRecord]) -> std::io::Result<()> {
    std::fs::write(path, render_fasta(native, samples))
}

/// Per-sample scores of one design run, in sampling order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScoreArchive {
    pub score: Vec<f32>,
    pub global_score: Vec<f32>,
}

impl ScoreArchive {
    pub fn from_records(records: &[DesignRecord]) -> Self {
        Self {
            score: records.iter().map(|r| r.score).collect(),
            global_score: records.iter().map(|r| r.global_score).collect(),
        }
    }
}

/// Scores of one fixed sequence over several random decoding orders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceScoreArchive {
    pub name: String,
    /// `pdb` for the native sequence, `fasta_<n>` for the n-th FASTA entry.
    pub source: String,
    pub seq_str: String,
    #[serde(rename = "S")]
    pub symbols: Vec<u32>,
    pub score: Vec<f32>,
    pub global_score: Vec<f32>,
}

impl SequenceScoreArchive {
    pub fn mean_std(values: &[f32]) -> (f32, f32) {
        if values.is_empty() {
            return (0.0, 0.0);
        }
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        (mean, var.sqrt())
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()
}

/// Save named tensors as one safetensors archive.
pub fn write_tensors(path: &Path, tensors: HashMap<String, Tensor>) -> candle_core::Result<()> {
    candle_core::safetensors::save(&tensors, path)
}
