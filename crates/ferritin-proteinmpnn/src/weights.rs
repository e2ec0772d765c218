//! Device selection and checkpoint loading.
//!
//! Checkpoints are looked up as `<variant>.safetensors` first, then as the
//! PyTorch `<variant>.pt` with tensors under `model_state_dict`.
use crate::proteinmpnn::configs::{ModelVariant, ProteinMPNNConfig};
use crate::proteinmpnn::model::ProteinMPNN;
use candle_core::pickle::PthTensors;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Result};
use candle_nn::VarBuilder;
use std::path::{Path, PathBuf};

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::warn!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Checkpoint file of `variant` inside `dir`.
pub fn checkpoint_path(dir: &Path, variant: &ModelVariant) -> Result<PathBuf> {
    let name = variant.name();
    for ext in ["safetensors", "pt"] {
        let candidate = dir.join(format!("{name}.{ext}"));
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    candle_core::bail!(
        "no checkpoint for {} in {} (expected {}.safetensors or {}.pt)",
        name,
        dir.display(),
        name,
        name
    )
}

/// Load the network of `variant` from `dir`, with `augment_eps` as the
/// encoder's backbone noise.
pub fn load_model(
    dir: &Path,
    variant: &ModelVariant,
    augment_eps: f64,
    device: &Device,
) -> Result<ProteinMPNN> {
    let path = checkpoint_path(dir, variant)?;
    let config = variant.config().with_augment_eps(augment_eps);
    tracing::info!(
        "Loading {} ({}, {}) from {}",
        variant.name(),
        variant.backbone,
        variant.regime,
        path.display()
    );
    load_checkpoint(&path, &config, device)
}

pub fn load_checkpoint(path: &Path, config: &ProteinMPNNConfig, device: &Device) -> Result<ProteinMPNN> {
    let vb = match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => unsafe {
            VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)?
        },
        _ => {
            let pth = PthTensors::new(path, Some("model_state_dict"))?;
            VarBuilder::from_backend(Box::new(pth), DType::F32, device.clone())
        }
    };
    ProteinMPNN::load(vb, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proteinmpnn::configs::NoiseLevel;
    use candle_nn::VarMap;

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let variant = ModelVariant::from_name("v_48_002", false, false).unwrap();
        let err = checkpoint_path(dir.path(), &variant).unwrap_err();
        assert!(err.to_string().contains("v_48_002.safetensors"));
    }

    #[test]
    fn test_safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        let config = ProteinMPNNConfig {
            hidden_dim: 16,
            edge_features: 16,
            node_features: 16,
            k_neighbors: 8,
            ..ProteinMPNNConfig::proteinmpnn()
        };
        let varmap = VarMap::new();
        ProteinMPNN::load(VarBuilder::from_varmap(&varmap, DType::F32, &device), &config).unwrap();
        let path = dir.path().join(format!("{}.safetensors", NoiseLevel::V48_020));
        varmap.save(&path).unwrap();

        let variant = ModelVariant::from_name("v_48_020", false, false).unwrap();
        assert_eq!(checkpoint_path(dir.path(), &variant).unwrap(), path);
        let model = load_checkpoint(&path, &config, &device).unwrap();
        assert_eq!(model.config().hidden_dim, 16);
    }
}
