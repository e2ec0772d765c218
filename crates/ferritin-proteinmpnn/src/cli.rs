use super::commands;
use clap::{Args, Parser, Subcommand};
use ferritin_proteinmpnn::proteinmpnn::configs::NoiseLevel;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a file in addition to stderr
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sample sequences for every structure of a parsed JSONL file.
    Design(DesignArgs),
    /// Score native (or FASTA) sequences against their structures.
    Score(ScoreArgs),
    /// Per-position conditional or unconditional log-probabilities.
    Probs(ProbsArgs),
}

/// Inputs, model selection and constraints shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Parsed structures, one JSON object per line
    #[arg(long, value_name = "PATH")]
    pub jsonl_path: PathBuf,

    #[arg(long, value_name = "DIR")]
    pub out_folder: PathBuf,

    /// Directory with `<model-name>.safetensors` or `<model-name>.pt`
    #[arg(long, value_name = "DIR")]
    pub path_to_model_weights: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = NoiseLevel::V48_020)]
    pub model_name: NoiseLevel,

    /// Use the Cα-only model family
    #[arg(long)]
    pub ca_only: bool,

    /// Use the model trained on soluble proteins only
    #[arg(long)]
    pub use_soluble_model: bool,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Run on CUDA / Metal when available
    #[arg(long)]
    pub gpu: bool,

    /// Std of Gaussian noise added to backbone coordinates, in Å
    #[arg(long, default_value_t = 0.0)]
    pub backbone_noise: f64,

    #[arg(long, default_value_t = 200_000)]
    pub max_length: usize,

    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1)]
    pub num_seq_per_target: usize,

    /// `{name: [[designed chains], [fixed chains]]}`
    #[arg(long, value_name = "PATH")]
    pub chain_id_jsonl: Option<PathBuf>,

    /// `{name: {chain: [1-based positions]}}`
    #[arg(long, value_name = "PATH")]
    pub fixed_positions_jsonl: Option<PathBuf>,

    /// `{name: [{chain: [positions]}, ...]}`
    #[arg(long, value_name = "PATH")]
    pub tied_positions_jsonl: Option<PathBuf>,

    /// `{name: {chain: [[[positions], "AAs"], ...]}}`
    #[arg(long = "omit-AA-jsonl", value_name = "PATH")]
    pub omit_aa_jsonl: Option<PathBuf>,

    /// `{name: {chain: [[21 floats] per residue]}}`
    #[arg(long, value_name = "PATH")]
    pub bias_by_res_jsonl: Option<PathBuf>,

    /// `{name: {chain: {pssm_coef, pssm_bias, pssm_log_odds}}}`
    #[arg(long, value_name = "PATH")]
    pub pssm_jsonl: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DesignArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// One or more sampling temperatures
    #[arg(long, num_args = 1.., default_values_t = [0.1])]
    pub sampling_temp: Vec<f64>,

    /// Always pick the most likely residue
    #[arg(long)]
    pub greedy: bool,

    /// Residues never to sample, e.g. `CX`
    #[arg(long = "omit-AAs", default_value = "X")]
    pub omit_aas: String,

    /// `{"A": -1.1, ...}` composition bias
    #[arg(long = "bias-AA-jsonl", value_name = "PATH")]
    pub bias_aa_jsonl: Option<PathBuf>,

    /// Profile blend weight in [0, 1]
    #[arg(long, default_value_t = 0.0)]
    pub pssm_multi: f64,

    #[arg(long, default_value_t = 0.0)]
    pub pssm_threshold: f32,

    #[arg(long)]
    pub pssm_log_odds_flag: bool,

    #[arg(long)]
    pub pssm_bias_flag: bool,

    /// Write per-sample scores to `scores/<name>.json`
    #[arg(long)]
    pub save_score: bool,

    /// Write sampling probabilities to `probs/<name>.safetensors`
    #[arg(long)]
    pub save_probs: bool,
}

#[derive(Args, Debug)]
pub struct ScoreArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Score these sequences in addition to the native one
    #[arg(long, value_name = "PATH")]
    pub path_to_fasta: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ProbsArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// p(s_i | backbone) instead of p(s_i | rest of sequence, backbone)
    #[arg(long, conflicts_with = "unconditional")]
    pub backbone_only: bool,

    /// Single pass without any sequence information
    #[arg(long)]
    pub unconditional: bool,
}

impl Cli {
    pub fn execute(self) -> anyhow::Result<()> {
        match self.command {
            Commands::Design(args) => commands::design::execute(args),
            Commands::Score(args) => commands::score::execute(args),
            Commands::Probs(args) => commands::probs::execute(args),
        }
    }
}
