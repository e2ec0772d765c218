//! Error taxonomy for design runs.
//!
//! Three classes of failure:
//!
//! - [`ConfigError`]: rejected before any tensor is built; the whole run aborts.
//! - [`DataError`]: raised while featurizing one structure; batch mode skips the
//!   structure and moves on.
//! - [`MpnnError::Internal`] / [`MpnnError::NonFinite`]: shape mismatches or
//!   broken distributions. These are bugs and are never retried.
use strum::Display;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("sampling temperature must be positive and finite, got {0}")]
    InvalidTemperature(f64),

    #[error("profile blend weight must lie in [0, 1], got {0}")]
    BlendWeightOutOfRange(f64),

    #[error("unknown model variant: {0}")]
    UnknownVariant(String),

    #[error("'{0}' is not a residue in the alphabet ACDEFGHIKLMNPQRSTVWYX")]
    UnknownResidue(char),

    #[error("omission list forbids every residue type")]
    EverythingOmitted,

    #[error("number of sequences per target ({requested}) must be a positive multiple of the batch size ({batch_size})")]
    SampleCount { requested: usize, batch_size: usize },

    #[error("structure '{structure}': position {chain}{position} is fixed but belongs to a tie group")]
    TiedFixedPosition {
        structure: String,
        chain: String,
        position: usize,
    },

    #[error("structure '{structure}': position {chain}{position} appears in more than one tie group")]
    OverlappingTies {
        structure: String,
        chain: String,
        position: usize,
    },
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("structure has {length} residues, above the limit of {max}")]
    TooLong { length: usize, max: usize },

    #[error("chain '{0}' is referenced by a constraint but absent from the structure")]
    UnknownChain(String),

    #[error("position {position} is outside chain '{chain}' of length {length}")]
    PositionOutOfRange {
        chain: String,
        position: usize,
        length: usize,
    },

    #[error("every residue type is omitted at {chain}{position}")]
    DegenerateOmission { chain: String, position: usize },

    #[error("the full-weight profile at {chain}{position} only covers omitted residues")]
    DegenerateProfile { chain: String, position: usize },

    #[error("{field} for chain '{chain}' has {found} rows, expected {expected}")]
    RowCount {
        field: &'static str,
        chain: String,
        found: usize,
        expected: usize,
    },

    #[error("{field} for chain '{chain}' has a row of width {found}, expected 21")]
    RowWidth {
        field: &'static str,
        chain: String,
        found: usize,
    },

    #[error("malformed structure record: {0}")]
    Malformed(String),

    #[error("sequence of length {found} does not fit the {expected} residues of the structure")]
    SequenceLength { found: usize, expected: usize },
}

/// Stage of the pipeline where an internal error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Featurize,
    Encode,
    Decode,
    Sample,
    Score,
}

#[derive(Debug, Error)]
pub enum MpnnError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("data error in structure '{structure}': {source}")]
    Data {
        structure: String,
        #[source]
        source: DataError,
    },

    #[error("internal error in structure '{structure}' during {stage}: {source}")]
    Internal {
        structure: String,
        stage: Stage,
        #[source]
        source: candle_core::Error,
    },

    #[error("non-finite probabilities in structure '{structure}' during {stage} at position {position}")]
    NonFinite {
        structure: String,
        stage: Stage,
        position: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MpnnError {
    pub fn data(structure: &str, source: DataError) -> Self {
        Self::Data {
            structure: structure.to_string(),
            source,
        }
    }

    /// Data errors only abort the current structure.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Data { .. })
    }
}

pub type Result<T> = std::result::Result<T, MpnnError>;

/// Attach structure and stage context to tensor-level failures.
pub trait AtStage<T> {
    fn at_stage(self, structure: &str, stage: Stage) -> Result<T>;
}

impl<T> AtStage<T> for candle_core::Result<T> {
    fn at_stage(self, structure: &str, stage: Stage) -> Result<T> {
        self.map_err(|source| MpnnError::Internal {
            structure: structure.to_string(),
            stage,
            source,
        })
    }
}
