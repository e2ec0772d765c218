pub mod design;
pub mod probs;
pub mod score;

use crate::cli::CommonArgs;
use anyhow::Context;
use ferritin_proteinmpnn::inputs::{read_structures, ConstraintPaths, ConstraintSet, StructureRecord};
use ferritin_proteinmpnn::proteinmpnn::configs::{DesignConfig, ModelVariant};
use ferritin_proteinmpnn::{weights, DataError, DesignRunner};
use std::path::{Path, PathBuf};
use tracing::info;

/// Everything a subcommand needs before touching structures.
pub struct Prepared {
    pub runner: DesignRunner,
    pub constraints: ConstraintSet,
    pub records: Vec<Result<StructureRecord, DataError>>,
}

/// Validate the run configuration, then load weights, constraints and inputs.
pub fn prepare(common: &CommonArgs, mut config: DesignConfig) -> anyhow::Result<Prepared> {
    config.seed = common.seed;
    config.batch_size = common.batch_size;
    config.num_seq_per_target = common.num_seq_per_target;
    config.backbone_noise = common.backbone_noise;
    config.max_length = common.max_length;
    config.validate()?;

    let variant = ModelVariant::from_name(
        &common.model_name.to_string(),
        common.ca_only,
        common.use_soluble_model,
    )?;
    let weights_dir = common
        .path_to_model_weights
        .clone()
        .unwrap_or_else(|| PathBuf::from(variant.weights_dir()));
    info!(
        "Model {} (trained with {} Å backbone noise) from {}",
        variant.name(),
        variant.noise.angstroms(),
        weights_dir.display()
    );
    let device = weights::device(!common.gpu)?;
    let model = weights::load_model(&weights_dir, &variant, config.backbone_noise, &device)
        .with_context(|| format!("loading model weights from {}", weights_dir.display()))?;

    let constraints = ConstraintSet::load(&ConstraintPaths {
        chain_ids: common.chain_id_jsonl.as_deref(),
        fixed_positions: common.fixed_positions_jsonl.as_deref(),
        tied_positions: common.tied_positions_jsonl.as_deref(),
        omit_positions: common.omit_aa_jsonl.as_deref(),
        bias_by_res: common.bias_by_res_jsonl.as_deref(),
        profiles: common.pssm_jsonl.as_deref(),
    })?;
    let records = read_structures(&common.jsonl_path)
        .with_context(|| format!("reading {}", common.jsonl_path.display()))?;
    info!("Read {} structures from {}", records.len(), common.jsonl_path.display());

    let runner = DesignRunner::new(model, variant, config, device)?;
    Ok(Prepared {
        runner,
        constraints,
        records,
    })
}

/// Create `<out_folder>/<sub>` and return it.
pub fn output_dir(out_folder: &Path, sub: &str) -> std::io::Result<PathBuf> {
    let dir = out_folder.join(sub);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
