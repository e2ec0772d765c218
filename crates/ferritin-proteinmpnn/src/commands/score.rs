use super::{output_dir, prepare, Prepared};
use crate::cli::ScoreArgs;
use anyhow::Context;
use ferritin_proteinmpnn::inputs::read_fasta;
use ferritin_proteinmpnn::proteinmpnn::outputs::write_json;
use ferritin_proteinmpnn::DesignConfig;
use tracing::info;

pub fn execute(args: ScoreArgs) -> anyhow::Result<()> {
    let fasta = match &args.path_to_fasta {
        Some(path) => read_fasta(path).with_context(|| format!("reading {}", path.display()))?,
        None => vec![],
    };
    let Prepared {
        runner,
        constraints,
        records,
    } = prepare(&args.common, DesignConfig::default())?;
    let dir = output_dir(&args.common.out_folder, "score_only")?;

    let summary = runner.for_each_structure(records, &constraints, |features, rng| {
        let sequences = runner.parse_sequences(features, &fasta)?;
        for archive in runner.score_sequences(features, &sequences, rng)? {
            write_json(
                &dir.join(format!("{}_{}.json", archive.name, archive.source)),
                &archive,
            )?;
        }
        Ok(())
    })?;
    info!(
        "Scored {} structures ({} skipped)",
        summary.processed, summary.skipped
    );
    Ok(())
}
