use super::{output_dir, prepare, Prepared};
use crate::cli::DesignArgs;
use ferritin_proteinmpnn::inputs::read_bias_aa;
use ferritin_proteinmpnn::proteinmpnn::configs::{DesignConfig, ProfileConfig};
use ferritin_proteinmpnn::proteinmpnn::outputs::{write_fasta, write_json, write_tensors, ScoreArchive};
use ferritin_proteinmpnn::MpnnError;
use std::collections::BTreeMap;
use tracing::info;

pub fn execute(args: DesignArgs) -> anyhow::Result<()> {
    let bias_aa = match &args.bias_aa_jsonl {
        Some(path) => read_bias_aa(path)?,
        None => BTreeMap::new(),
    };
    let config = DesignConfig {
        temperatures: args.sampling_temp.clone(),
        greedy: args.greedy,
        omit_aas: args.omit_aas.clone(),
        bias_aa,
        profile: ProfileConfig {
            multi: args.pssm_multi,
            threshold: args.pssm_threshold,
            log_odds_flag: args.pssm_log_odds_flag,
            bias_flag: args.pssm_bias_flag,
        },
        save_probs: args.save_probs,
        ..Default::default()
    };
    let Prepared {
        runner,
        constraints,
        records,
    } = prepare(&args.common, config)?;

    let seqs_dir = output_dir(&args.common.out_folder, "seqs")?;
    let scores_dir = if args.save_score {
        Some(output_dir(&args.common.out_folder, "scores")?)
    } else {
        None
    };
    let probs_dir = if args.save_probs {
        Some(output_dir(&args.common.out_folder, "probs")?)
    } else {
        None
    };

    let summary = runner.for_each_structure(records, &constraints, |features, rng| {
        let design = runner.design(features, rng)?;
        let name = &design.native.name;
        let fasta = seqs_dir.join(format!("{name}.fa"));
        write_fasta(&fasta, &design.native, &design.samples)?;
        info!("Wrote {}", fasta.display());
        if let Some(dir) = &scores_dir {
            write_json(
                &dir.join(format!("{name}.json")),
                &ScoreArchive::from_records(&design.samples),
            )?;
        }
        if let (Some(dir), Some(archive)) = (&probs_dir, design.archive) {
            write_tensors(&dir.join(format!("{name}.safetensors")), archive).map_err(|source| {
                MpnnError::Internal {
                    structure: name.clone(),
                    stage: ferritin_proteinmpnn::Stage::Sample,
                    source,
                }
            })?;
        }
        Ok(())
    })?;
    info!(
        "Designed {} structures ({} skipped)",
        summary.processed, summary.skipped
    );
    Ok(())
}
