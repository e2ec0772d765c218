use super::utilities::{alphabet_index, NUM_LETTERS};
use crate::error::ConfigError;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString};

/// Training noise of the pretrained checkpoints.
#[rustfmt::skip]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Display, EnumString, EnumIter, Serialize, Deserialize)]
pub enum NoiseLevel {
    #[value(name = "v_48_002")] #[strum(serialize = "v_48_002")] #[serde(rename = "v_48_002")]
    V48_002,
    #[value(name = "v_48_010")] #[strum(serialize = "v_48_010")] #[serde(rename = "v_48_010")]
    V48_010,
    #[default]
    #[value(name = "v_48_020")] #[strum(serialize = "v_48_020")] #[serde(rename = "v_48_020")]
    V48_020,
    #[value(name = "v_48_030")] #[strum(serialize = "v_48_030")] #[serde(rename = "v_48_030")]
    V48_030,
}

impl NoiseLevel {
    /// Std of the Gaussian backbone noise the checkpoint was trained with.
    pub fn angstroms(&self) -> f32 {
        match self {
            Self::V48_002 => 0.02,
            Self::V48_010 => 0.10,
            Self::V48_020 => 0.20,
            Self::V48_030 => 0.30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum BackboneMode {
    #[default]
    FullAtom,
    CaOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum TrainingRegime {
    #[default]
    General,
    Soluble,
}

/// One pretrained parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVariant {
    pub noise: NoiseLevel,
    pub backbone: BackboneMode,
    pub regime: TrainingRegime,
}

impl ModelVariant {
    pub fn new(
        noise: NoiseLevel,
        backbone: BackboneMode,
        regime: TrainingRegime,
    ) -> Result<Self, ConfigError> {
        let variant = Self {
            noise,
            backbone,
            regime,
        };
        match (backbone, regime, noise) {
            (BackboneMode::CaOnly, TrainingRegime::Soluble, _) => {
                Err(ConfigError::UnknownVariant(format!("{} (Ca-only soluble)", noise)))
            }
            (BackboneMode::CaOnly, _, NoiseLevel::V48_030) => {
                Err(ConfigError::UnknownVariant(format!("{} (Ca-only)", noise)))
            }
            _ => Ok(variant),
        }
    }

    /// Resolve a variant from its checkpoint name, e.g. `v_48_020`.
    pub fn from_name(name: &str, ca_only: bool, soluble: bool) -> Result<Self, ConfigError> {
        let noise = <NoiseLevel as FromStr>::from_str(name)
            .map_err(|_| ConfigError::UnknownVariant(name.to_string()))?;
        let backbone = if ca_only {
            BackboneMode::CaOnly
        } else {
            BackboneMode::FullAtom
        };
        let regime = if soluble {
            TrainingRegime::Soluble
        } else {
            TrainingRegime::General
        };
        Self::new(noise, backbone, regime)
    }

    pub fn name(&self) -> String {
        self.noise.to_string()
    }

    /// Conventional directory holding the checkpoints of this family.
    pub fn weights_dir(&self) -> &'static str {
        match (self.backbone, self.regime) {
            (BackboneMode::CaOnly, _) => "ca_model_weights",
            (BackboneMode::FullAtom, TrainingRegime::Soluble) => "soluble_model_weights",
            (BackboneMode::FullAtom, TrainingRegime::General) => "vanilla_model_weights",
        }
    }

    pub fn config(&self) -> ProteinMPNNConfig {
        match self.backbone {
            BackboneMode::FullAtom => ProteinMPNNConfig::proteinmpnn(),
            BackboneMode::CaOnly => ProteinMPNNConfig::ca_proteinmpnn(),
        }
    }
}

/// Network hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProteinMPNNConfig {
    pub augment_eps: f64,
    pub ca_only: bool,
    pub dropout_ratio: f32,
    pub edge_features: usize,
    pub hidden_dim: usize,
    pub k_neighbors: usize,
    pub max_relative_feature: usize,
    pub node_features: usize,
    pub num_decoder_layers: usize,
    pub num_encoder_layers: usize,
    pub num_letters: usize,
    pub num_positional_embeddings: usize,
    pub num_rbf: usize,
    pub scale_factor: f64,
    pub vocab: usize,
}

impl ProteinMPNNConfig {
    pub fn proteinmpnn() -> Self {
        Self {
            augment_eps: 0.0,
            ca_only: false,
            dropout_ratio: 0.1,
            edge_features: 128,
            hidden_dim: 128,
            k_neighbors: 48,
            max_relative_feature: 32,
            node_features: 128,
            num_decoder_layers: 3,
            num_encoder_layers: 3,
            num_letters: NUM_LETTERS,
            num_positional_embeddings: 16,
            num_rbf: 16,
            scale_factor: 30.0,
            vocab: NUM_LETTERS,
        }
    }

    pub fn ca_proteinmpnn() -> Self {
        Self {
            ca_only: true,
            ..Self::proteinmpnn()
        }
    }

    pub fn with_augment_eps(mut self, augment_eps: f64) -> Self {
        self.augment_eps = augment_eps;
        self
    }

    /// Width of the raw edge feature vector before `edge_embedding`.
    pub fn edge_in(&self) -> usize {
        if self.ca_only {
            // 9 RBF blocks plus 7 orientation features
            self.num_positional_embeddings + self.num_rbf * 9 + 7
        } else {
            self.num_positional_embeddings + self.num_rbf * 25
        }
    }

    pub fn atoms(&self) -> usize {
        if self.ca_only {
            1
        } else {
            4
        }
    }
}

/// Profile (PSSM) blending controls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Blend weight `m` in [0, 1].
    pub multi: f64,
    /// Log-odds gate threshold, compared with a strict `>`.
    pub threshold: f32,
    pub log_odds_flag: bool,
    pub bias_flag: bool,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            multi: 0.0,
            threshold: 0.0,
            log_odds_flag: false,
            bias_flag: false,
        }
    }
}

/// Run-level settings for a design / scoring invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DesignConfig {
    pub temperatures: Vec<f64>,
    pub num_seq_per_target: usize,
    pub batch_size: usize,
    pub seed: Option<u64>,
    pub greedy: bool,
    /// Globally forbidden residues, e.g. `"CX"`.
    pub omit_aas: String,
    /// Global additive composition bias per residue letter.
    pub bias_aa: BTreeMap<char, f32>,
    pub profile: ProfileConfig,
    pub backbone_noise: f64,
    pub max_length: usize,
    pub save_probs: bool,
}

impl Default for DesignConfig {
    fn default() -> Self {
        Self {
            temperatures: vec![0.1],
            num_seq_per_target: 1,
            batch_size: 1,
            seed: None,
            greedy: false,
            omit_aas: "X".to_string(),
            bias_aa: BTreeMap::new(),
            profile: ProfileConfig::default(),
            backbone_noise: 0.0,
            max_length: 200_000,
            save_probs: false,
        }
    }
}

impl DesignConfig {
    /// Reject invalid settings before any structure is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.temperatures.is_empty() {
            return Err(ConfigError::InvalidTemperature(0.0));
        }
        for &t in &self.temperatures {
            if !(t.is_finite() && t > 0.0) {
                return Err(ConfigError::InvalidTemperature(t));
            }
        }
        if !(0.0..=1.0).contains(&self.profile.multi) {
            return Err(ConfigError::BlendWeightOutOfRange(self.profile.multi));
        }
        if self.batch_size == 0
            || self.num_seq_per_target == 0
            || self.num_seq_per_target % self.batch_size != 0
        {
            return Err(ConfigError::SampleCount {
                requested: self.num_seq_per_target,
                batch_size: self.batch_size,
            });
        }
        if self.omit_mask()?.iter().all(|&o| o) {
            return Err(ConfigError::EverythingOmitted);
        }
        self.bias_vector()?;
        Ok(())
    }

    /// Batches per temperature. `validate` guarantees an exact division.
    pub fn num_batches(&self) -> usize {
        self.num_seq_per_target / self.batch_size
    }

    /// Global omission flags over the alphabet.
    pub fn omit_mask(&self) -> Result<[bool; NUM_LETTERS], ConfigError> {
        let mut mask = [false; NUM_LETTERS];
        for aa in self.omit_aas.chars().filter(|c| !c.is_whitespace()) {
            let idx = alphabet_index(aa).ok_or(ConfigError::UnknownResidue(aa))?;
            mask[idx] = true;
        }
        Ok(mask)
    }

    pub fn bias_vector(&self) -> Result<[f32; NUM_LETTERS], ConfigError> {
        let mut bias = [0f32; NUM_LETTERS];
        for (&aa, &value) in &self.bias_aa {
            let idx = alphabet_index(aa).ok_or(ConfigError::UnknownResidue(aa))?;
            bias[idx] = value;
        }
        Ok(bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_variant_lookup() {
        let v = ModelVariant::from_name("v_48_010", false, true).unwrap();
        assert_eq!(v.noise, NoiseLevel::V48_010);
        assert_eq!(v.weights_dir(), "soluble_model_weights");
        assert_eq!(v.name(), "v_48_010");
        assert!(!v.config().ca_only);

        let ca = ModelVariant::from_name("v_48_002", true, false).unwrap();
        assert_eq!(ca.weights_dir(), "ca_model_weights");
        assert_eq!(ca.config().edge_in(), 16 + 144 + 7);

        for noise in NoiseLevel::iter() {
            let v = ModelVariant::from_name(&noise.to_string(), false, false).unwrap();
            assert_eq!(v.noise, noise);
            assert!(noise.angstroms() > 0.0);
        }
    }

    #[test]
    fn test_unavailable_variants() {
        assert!(matches!(
            ModelVariant::from_name("v_48_999", false, false),
            Err(ConfigError::UnknownVariant(_))
        ));
        assert!(ModelVariant::from_name("v_48_020", true, true).is_err());
        assert!(ModelVariant::from_name("v_48_030", true, false).is_err());
    }

    #[test]
    fn test_full_atom_edge_width() {
        assert_eq!(ProteinMPNNConfig::proteinmpnn().edge_in(), 416);
    }

    #[test]
    fn test_validate() {
        assert!(DesignConfig::default().validate().is_ok());

        let cfg = DesignConfig {
            temperatures: vec![0.1, 0.0],
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidTemperature(t)) if t == 0.0
        ));

        let mut cfg = DesignConfig::default();
        cfg.profile.multi = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BlendWeightOutOfRange(_))
        ));

        let cfg = DesignConfig {
            omit_aas: "ACDEFGHIKLMNPQRSTVWYX".into(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::EverythingOmitted)));

        let cfg = DesignConfig {
            omit_aas: "CZ".into(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownResidue('Z'))));

        let cfg = DesignConfig {
            num_seq_per_target: 5,
            batch_size: 2,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::SampleCount { requested: 5, batch_size: 2 })
        ));
        let cfg = DesignConfig {
            num_seq_per_target: 6,
            batch_size: 2,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.num_batches(), 3);
    }

    #[test]
    fn test_masks() {
        let mut cfg = DesignConfig {
            omit_aas: "C X".into(),
            ..Default::default()
        };
        cfg.bias_aa.insert('A', -1.5);
        let omit = cfg.omit_mask().unwrap();
        assert!(omit[1] && omit[20] && !omit[0]);
        assert_eq!(cfg.bias_vector().unwrap()[0], -1.5);
    }
}
