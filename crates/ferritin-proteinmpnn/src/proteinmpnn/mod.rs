//! ProteinMPNN: structure-conditioned sequence design.
pub mod configs;
pub mod constraints;
pub mod featurizer;
pub mod model;
pub mod outputs;
pub mod proteinfeatures;
pub mod sampling;
pub mod session;
pub mod utilities;
