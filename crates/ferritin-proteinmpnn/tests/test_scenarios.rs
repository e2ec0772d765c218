#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use ferritin_proteinmpnn::inputs::{ConstraintSet, StructureRecord, TiedEntry};
    use ferritin_proteinmpnn::proteinmpnn::configs::{DesignConfig, ModelVariant, ProteinMPNNConfig};
    use ferritin_proteinmpnn::{DesignRunner, ProteinMPNN, StructureDesign};
    use ferritin_test_data::TestStructure;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::{BTreeMap, BTreeSet};

    fn runner(ca_only: bool, config: DesignConfig) -> DesignRunner {
        let base = if ca_only {
            ProteinMPNNConfig::ca_proteinmpnn()
        } else {
            ProteinMPNNConfig::proteinmpnn()
        };
        let model_config = ProteinMPNNConfig {
            hidden_dim: 32,
            edge_features: 32,
            node_features: 32,
            k_neighbors: 16,
            ..base
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = ProteinMPNN::load(vb, &model_config).unwrap();
        let variant = ModelVariant::from_name("v_48_020", ca_only, false).unwrap();
        DesignRunner::new(model, variant, config, Device::Cpu).unwrap()
    }

    fn design(runner: &DesignRunner, structure: &TestStructure, constraints: &ConstraintSet) -> StructureDesign {
        let record = StructureRecord::from_json(&structure.to_json()).unwrap();
        let features = runner.featurize(&record, constraints).unwrap();
        let mut rng = StdRng::seed_from_u64(runner.seed());
        runner.design(&features, &mut rng).unwrap()
    }

    fn dimer() -> TestStructure {
        TestStructure::helix("dimer", "A", 10).with_helix_chain("B", 10, [9.0, 0.0, 0.0])
    }

    #[test]
    fn test_single_chain_ca_only() {
        let runner = runner(
            true,
            DesignConfig {
                temperatures: vec![0.1],
                seed: Some(17),
                save_probs: true,
                ..Default::default()
            },
        );
        let result = design(&runner, &TestStructure::helix("mono", "A", 50), &ConstraintSet::default());
        assert_eq!(result.samples.len(), 1);
        let sample = &result.samples[0];
        assert_eq!(sample.sequence.len(), 50);
        assert_eq!(sample.symbols.len(), 50);
        assert!(sample.score.is_finite() && sample.score > 0.0);
        assert!(result.native.ca_only);
        for row in sample.probs.as_ref().unwrap() {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_fixed_chain_is_preserved() {
        let mut constraints = ConstraintSet::default();
        constraints
            .chain_ids
            .insert("dimer".into(), (vec!["A".into()], vec!["B".into()]));
        let runner = runner(
            false,
            DesignConfig {
                temperatures: vec![1.0],
                num_seq_per_target: 10,
                batch_size: 5,
                seed: Some(23),
                ..Default::default()
            },
        );
        let structure = dimer();
        let native_b = structure.chains[1].sequence.clone();
        let result = design(&runner, &structure, &constraints);
        assert_eq!(result.native.designed_chains, vec!["A"]);
        assert_eq!(result.native.fixed_chains, vec!["B"]);

        let mut chain_a = BTreeSet::new();
        for sample in &result.samples {
            let parts: Vec<&str> = sample.sequence.split('/').collect();
            assert_eq!(parts.len(), 2);
            assert_eq!(parts[1], native_b);
            assert_eq!(sample.designed_sequence, parts[0]);
            chain_a.insert(parts[0].to_string());
        }
        assert!(chain_a.len() > 1);
    }

    #[test]
    fn test_tied_pair_is_identical() {
        let mut constraints = ConstraintSet::default();
        constraints.tied_positions.insert(
            "dimer".into(),
            vec![BTreeMap::from([
                ("A".to_string(), TiedEntry::Plain(vec![3])),
                ("B".to_string(), TiedEntry::Plain(vec![3])),
            ])],
        );
        let runner = runner(
            false,
            DesignConfig {
                temperatures: vec![1.0],
                num_seq_per_target: 20,
                batch_size: 4,
                seed: Some(31),
                ..Default::default()
            },
        );
        let result = design(&runner, &dimer(), &constraints);
        assert_eq!(result.samples.len(), 20);
        for sample in &result.samples {
            let parts: Vec<Vec<char>> = sample
                .sequence
                .split('/')
                .map(|p| p.chars().collect())
                .collect();
            assert_eq!(parts[0][2], parts[1][2]);
        }
    }

    #[test]
    fn test_omitted_residue_never_sampled() {
        let runner = runner(
            false,
            DesignConfig {
                temperatures: vec![1.0],
                num_seq_per_target: 1000,
                batch_size: 50,
                seed: Some(41),
                omit_aas: "CX".into(),
                // push mass towards C so the omission does the work
                bias_aa: BTreeMap::from([('C', 3.0)]),
                ..Default::default()
            },
        );
        let result = design(&runner, &TestStructure::helix("mono", "A", 12), &ConstraintSet::default());
        assert_eq!(result.samples.len(), 1000);
        for sample in &result.samples {
            assert!(!sample.designed_sequence.contains('C'));
        }
    }
}
