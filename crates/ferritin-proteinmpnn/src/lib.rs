//! ferritin-proteinmpnn
//!
//! Structure-conditioned protein sequence design with ProteinMPNN.
//!
//! - featurize parsed backbones and their constraint dictionaries
//! - encode geometry and decode sequences autoregressively
//! - score, sample and write FASTA / probability archives
//!
//! ```shell
//! cargo run --release -- design --jsonl-path parsed.jsonl --out-folder out/
//! cargo run --release --features metal -- design --jsonl-path parsed.jsonl --out-folder out/
//! ```
pub use error::{ConfigError, DataError, MpnnError, Stage};
pub use proteinmpnn::configs::{DesignConfig, ModelVariant, ProteinMPNNConfig};
pub use proteinmpnn::featurizer::ProteinFeatures;
pub use proteinmpnn::model::ProteinMPNN;
pub use runner::{BatchSummary, DesignRunner, StructureDesign};
pub use weights::device;

pub mod error;
pub mod inputs;
pub mod proteinmpnn;
pub mod runner;
pub mod weights;
