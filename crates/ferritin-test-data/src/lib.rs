//! ferritin-test-data
//!
//! Synthetic backbone fixtures for the ProteinMPNN tests. Structures are ideal
//! alpha helices written in the parsed-PDB JSONL layout consumed by the CLI.
use serde_json::{json, Map, Value};
use std::fs;
use tempfile::{Builder, NamedTempFile};

/// Residue pattern used to fill fixture sequences.
const DEFAULT_PATTERN: &str = "MKELLEKAGSLVEEAIKRLG";

// Cylindrical (radius, angle offset in degrees, rise) per backbone atom of an
// ideal alpha helix: 3.6 residues per turn and 1.5 A rise per residue.
const HELIX_ATOMS: [(&str, f32, f32, f32); 4] = [
    ("N", 1.55, -28.0, -0.88),
    ("CA", 2.30, 0.0, 0.0),
    ("C", 1.64, 28.0, 0.87),
    ("O", 2.06, 37.0, 2.04),
];
const TWIST_DEG: f32 = 100.0;
const RISE: f32 = 1.5;

#[derive(Debug, Clone)]
pub struct TestChain {
    pub id: String,
    pub sequence: String,
    pub offset: [f32; 3],
    pub missing: Vec<usize>,
}

impl TestChain {
    /// Backbone atoms for residue `i`, ordered N/CA/C/O.
    pub fn backbone(&self, i: usize) -> [[f32; 3]; 4] {
        let mut out = [[0f32; 3]; 4];
        for (slot, (_, radius, phase, dz)) in HELIX_ATOMS.iter().enumerate() {
            let theta = (i as f32 * TWIST_DEG + phase).to_radians();
            out[slot] = [
                radius * theta.cos() + self.offset[0],
                radius * theta.sin() + self.offset[1],
                i as f32 * RISE + dz + self.offset[2],
            ];
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct TestStructure {
    pub name: String,
    pub chains: Vec<TestChain>,
}

impl TestStructure {
    /// A single-chain helix of `len` residues.
    pub fn helix(name: &str, chain_id: &str, len: usize) -> Self {
        Self {
            name: name.to_string(),
            chains: vec![],
        }
        .with_helix_chain(chain_id, len, [0.0, 0.0, 0.0])
    }

    /// Add another helical chain translated by `offset`.
    pub fn with_helix_chain(mut self, chain_id: &str, len: usize, offset: [f32; 3]) -> Self {
        let sequence: String = DEFAULT_PATTERN.chars().cycle().take(len).collect();
        self.chains.push(TestChain {
            id: chain_id.to_string(),
            sequence,
            offset,
            missing: vec![],
        });
        self
    }

    /// Replace the native sequence of a chain. Length must match.
    pub fn with_sequence(mut self, chain_id: &str, sequence: &str) -> Self {
        if let Some(chain) = self.chains.iter_mut().find(|c| c.id == chain_id) {
            assert_eq!(chain.sequence.len(), sequence.len());
            chain.sequence = sequence.to_string();
        }
        self
    }

    /// Blank out the coordinates of one residue (0-based).
    pub fn with_missing_residue(mut self, chain_id: &str, index: usize) -> Self {
        if let Some(chain) = self.chains.iter_mut().find(|c| c.id == chain_id) {
            chain.missing.push(index);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.chains.iter().map(|c| c.sequence.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parsed-PDB JSON record: `seq_chain_X`, `coords_chain_X` with per-atom lists.
    pub fn to_json(&self) -> Value {
        let mut record = Map::new();
        record.insert("name".into(), json!(self.name));
        let mut full_seq = String::new();
        for chain in &self.chains {
            let mut coords = Map::new();
            for (slot, (atom, ..)) in HELIX_ATOMS.iter().enumerate() {
                let xyz: Vec<Value> = (0..chain.sequence.len())
                    .map(|i| {
                        if chain.missing.contains(&i) {
                            json!([Value::Null, Value::Null, Value::Null])
                        } else {
                            json!(chain.backbone(i)[slot])
                        }
                    })
                    .collect();
                coords.insert(format!("{}_chain_{}", atom, chain.id), Value::Array(xyz));
            }
            record.insert(
                format!("seq_chain_{}", chain.id),
                json!(chain.sequence.clone()),
            );
            record.insert(format!("coords_chain_{}", chain.id), Value::Object(coords));
            full_seq.push_str(&chain.sequence);
        }
        record.insert("num_of_chains".into(), json!(self.chains.len()));
        record.insert("seq".into(), json!(full_seq));
        Value::Object(record)
    }

    pub fn to_jsonl_line(&self) -> String {
        self.to_json().to_string()
    }

    /// Write several structures into one JSONL temp file.
    pub fn create_temp(structures: &[TestStructure]) -> std::io::Result<(String, NamedTempFile)> {
        let body = structures
            .iter()
            .map(|s| s.to_jsonl_line())
            .collect::<Vec<_>>()
            .join("\n");
        TestFile::from_text(body, "jsonl").create_temp()
    }
}

/// Arbitrary file content materialised as a named temp file.
#[derive(Debug)]
pub struct TestFile {
    content: Vec<u8>,
    suffix: &'static str,
}

impl TestFile {
    pub fn from_text(content: impl Into<String>, suffix: &'static str) -> Self {
        Self {
            content: content.into().into_bytes(),
            suffix,
        }
    }

    pub fn create_temp(&self) -> std::io::Result<(String, NamedTempFile)> {
        let temp = Builder::new()
            .suffix(&format!(".{}", self.suffix))
            .tempfile()?;

        fs::write(&temp, &self.content)?;
        let path = temp.path().to_string_lossy().into_owned();

        Ok((path, temp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist(a: [f32; 3], b: [f32; 3]) -> f32 {
        ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
    }

    #[test]
    fn test_helix_ca_spacing() {
        let s = TestStructure::helix("h", "A", 10);
        let chain = &s.chains[0];
        for i in 0..9 {
            let d = dist(chain.backbone(i)[1], chain.backbone(i + 1)[1]);
            assert!(d > 3.6 && d < 4.0, "CA-CA {} out of range", d);
        }
        let n_ca = dist(chain.backbone(0)[0], chain.backbone(0)[1]);
        assert!((n_ca - 1.47).abs() < 0.1);
    }

    #[test]
    fn test_json_layout() {
        let s = TestStructure::helix("two", "A", 4)
            .with_helix_chain("B", 3, [12.0, 0.0, 0.0])
            .with_missing_residue("B", 1);
        let v = s.to_json();
        assert_eq!(v["name"], "two");
        assert_eq!(v["seq_chain_A"], "MKEL");
        assert_eq!(v["coords_chain_B"]["CA_chain_B"][1][0], Value::Null);
        assert_eq!(v["coords_chain_A"]["O_chain_A"].as_array().unwrap().len(), 4);
        assert_eq!(s.len(), 7);
    }

    #[test]
    fn test_temp_file() {
        let s = TestStructure::helix("t", "A", 5);
        let (path, _tmp) = TestStructure::create_temp(&[s.clone(), s]).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
