use super::{output_dir, prepare, Prepared};
use crate::cli::ProbsArgs;
use ferritin_proteinmpnn::proteinmpnn::outputs::write_tensors;
use ferritin_proteinmpnn::{DesignConfig, MpnnError, Stage};
use tracing::info;

pub fn execute(args: ProbsArgs) -> anyhow::Result<()> {
    let Prepared {
        runner,
        constraints,
        records,
    } = prepare(&args.common, DesignConfig::default())?;
    let sub = if args.unconditional {
        "unconditional_probs_only"
    } else {
        "conditional_probs_only"
    };
    let dir = output_dir(&args.common.out_folder, sub)?;

    let summary = runner.for_each_structure(records, &constraints, |features, rng| {
        let log_p = if args.unconditional {
            runner.unconditional_probs(features, rng)?
        } else {
            runner.conditional_probs(features, args.backbone_only, rng)?
        };
        let archive = runner.probs_archive(features, log_p)?;
        let path = dir.join(format!("{}.safetensors", features.name()));
        write_tensors(&path, archive).map_err(|source| MpnnError::Internal {
            structure: features.name().to_string(),
            stage: Stage::Decode,
            source,
        })?;
        info!("Wrote {}", path.display());
        Ok(())
    })?;
    info!(
        "Computed probabilities for {} structures ({} skipped)",
        summary.processed, summary.skipped
    );
    Ok(())
}
