//! Readers for the parsed-PDB structure JSONL and the per-structure
//! constraint dictionaries.
//!
//! Every constraint file holds a single JSON object keyed by structure name.
use crate::error::DataError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

pub type Coord = Option<[f32; 3]>;

/// One chain of a parsed-PDB record. Missing atoms are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainRecord {
    pub id: String,
    pub sequence: String,
    pub n: Vec<Coord>,
    pub ca: Vec<Coord>,
    pub c: Vec<Coord>,
    pub o: Vec<Coord>,
}

impl ChainRecord {
    pub fn len(&self) -> usize {
        self.sequence.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructureRecord {
    pub name: String,
    /// Sorted by chain id.
    pub chains: Vec<ChainRecord>,
}

impl StructureRecord {
    pub fn len(&self) -> usize {
        self.chains.iter().map(ChainRecord::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chain(&self, id: &str) -> Option<&ChainRecord> {
        self.chains.iter().find(|c| c.id == id)
    }

    pub fn chain_ids(&self) -> Vec<String> {
        self.chains.iter().map(|c| c.id.clone()).collect()
    }

    /// Parse one JSONL line. `NaN` tokens are read as missing coordinates.
    pub fn from_json_line(line: &str) -> Result<Self, DataError> {
        let value: Value = serde_json::from_str(&nan_to_null(line))
            .map_err(|e| DataError::Malformed(e.to_string()))?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self, DataError> {
        let object = value
            .as_object()
            .ok_or_else(|| DataError::Malformed("record is not a JSON object".into()))?;
        let name = object
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| DataError::Malformed("missing 'name'".into()))?
            .to_string();

        let mut chains = Vec::new();
        for (key, seq) in object {
            let Some(id) = key.strip_prefix("seq_chain_") else {
                continue;
            };
            let sequence = seq
                .as_str()
                .ok_or_else(|| DataError::Malformed(format!("{key} is not a string")))?
                .to_string();
            let coords = object
                .get(&format!("coords_chain_{id}"))
                .and_then(Value::as_object)
                .ok_or_else(|| DataError::Malformed(format!("missing coords_chain_{id}")))?;

            let atom = |atom: &str| -> Result<Vec<Coord>, DataError> {
                let field = format!("{atom}_chain_{id}");
                match coords.get(&field) {
                    Some(rows) => parse_coords(&field, rows),
                    None => Ok(vec![None; sequence.chars().count()]),
                }
            };
            let chain = ChainRecord {
                id: id.to_string(),
                n: atom("N")?,
                ca: atom("CA")?,
                c: atom("C")?,
                o: atom("O")?,
                sequence,
            };
            for (field, rows) in [
                ("N", &chain.n),
                ("CA", &chain.ca),
                ("C", &chain.c),
                ("O", &chain.o),
            ] {
                if rows.len() != chain.len() {
                    return Err(DataError::RowCount {
                        field: atom_field(field),
                        chain: chain.id.clone(),
                        found: rows.len(),
                        expected: chain.len(),
                    });
                }
            }
            chains.push(chain);
        }
        if chains.is_empty() {
            return Err(DataError::Malformed(format!("'{name}' has no chains")));
        }
        chains.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Self { name, chains })
    }
}

fn atom_field(atom: &str) -> &'static str {
    match atom {
        "N" => "N coordinates",
        "CA" => "CA coordinates",
        "C" => "C coordinates",
        _ => "O coordinates",
    }
}

fn parse_coords(field: &str, rows: &Value) -> Result<Vec<Coord>, DataError> {
    let rows: Vec<Vec<Option<f32>>> = serde_json::from_value(rows.clone())
        .map_err(|e| DataError::Malformed(format!("{field}: {e}")))?;
    Ok(rows
        .into_iter()
        .map(|xyz| match xyz.as_slice() {
            [Some(x), Some(y), Some(z)] if x.is_finite() && y.is_finite() && z.is_finite() => {
                Some([*x, *y, *z])
            }
            _ => None,
        })
        .collect())
}

/// Replace bare `NaN` tokens outside string literals with `null`.
fn nan_to_null(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut rest = line;
    while let Some(ch) = rest.chars().next() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
        } else if ch == '"' {
            in_string = true;
            out.push(ch);
        } else if rest.starts_with("NaN") {
            out.push_str("null");
            rest = &rest[3..];
            continue;
        } else {
            out.push(ch);
        }
        rest = &rest[ch.len_utf8()..];
    }
    out
}

/// Read a JSONL file; each line is parsed independently so one bad record does
/// not poison the batch.
pub fn read_structures(path: &Path) -> std::io::Result<Vec<Result<StructureRecord, DataError>>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(StructureRecord::from_json_line)
        .collect())
}

/// Member list of one tie group for a chain: plain positions, or positions
/// with per-member weights.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TiedEntry {
    Plain(Vec<usize>),
    Weighted(Vec<usize>, Vec<f32>),
}

impl TiedEntry {
    pub fn members(&self) -> Vec<(usize, f32)> {
        match self {
            Self::Plain(positions) => positions.iter().map(|&p| (p, 1.0)).collect(),
            Self::Weighted(positions, weights) => positions
                .iter()
                .zip(weights.iter().chain(std::iter::repeat(&1.0)))
                .map(|(&p, &w)| (p, w))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ProfileEntry {
    #[serde(default)]
    pub pssm_coef: Vec<f32>,
    #[serde(default)]
    pub pssm_bias: Vec<Vec<f32>>,
    #[serde(default)]
    pub pssm_log_odds: Vec<Vec<f32>>,
}

/// A tie member: chain id, 1-based position and weight.
#[derive(Debug, Clone, PartialEq)]
pub struct TieMember {
    pub chain: String,
    pub position: usize,
    pub weight: f32,
}

/// Constraints that apply to a single structure.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructureConstraints {
    /// `None` designs every chain.
    pub designed_chains: Option<Vec<String>>,
    pub fixed_chains: Vec<String>,
    pub fixed_positions: BTreeMap<String, Vec<usize>>,
    pub tied_positions: Vec<Vec<TieMember>>,
    pub omit_positions: BTreeMap<String, Vec<(Vec<usize>, String)>>,
    pub bias_by_res: BTreeMap<String, Vec<Vec<f32>>>,
    pub profiles: BTreeMap<String, ProfileEntry>,
}

impl StructureConstraints {
    /// Every chain referenced by any dictionary.
    pub fn referenced_chains(&self) -> Vec<&str> {
        let mut chains: Vec<&str> = Vec::new();
        chains.extend(self.designed_chains.iter().flatten().map(String::as_str));
        chains.extend(self.fixed_chains.iter().map(String::as_str));
        chains.extend(self.fixed_positions.keys().map(String::as_str));
        chains.extend(self.omit_positions.keys().map(String::as_str));
        chains.extend(self.bias_by_res.keys().map(String::as_str));
        chains.extend(self.profiles.keys().map(String::as_str));
        for group in &self.tied_positions {
            chains.extend(group.iter().map(|m| m.chain.as_str()));
        }
        chains.sort_unstable();
        chains.dedup();
        chains
    }
}

type PerStructure<T> = HashMap<String, T>;

/// All constraint dictionaries of a run, keyed by structure name.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    pub chain_ids: PerStructure<(Vec<String>, Vec<String>)>,
    pub fixed_positions: PerStructure<BTreeMap<String, Vec<usize>>>,
    pub tied_positions: PerStructure<Vec<BTreeMap<String, TiedEntry>>>,
    pub omit_positions: PerStructure<BTreeMap<String, Vec<(Vec<usize>, String)>>>,
    pub bias_by_res: PerStructure<BTreeMap<String, Vec<Vec<f32>>>>,
    pub profiles: PerStructure<BTreeMap<String, ProfileEntry>>,
}

/// Paths of the optional constraint files.
#[derive(Debug, Clone, Default)]
pub struct ConstraintPaths<'a> {
    pub chain_ids: Option<&'a Path>,
    pub fixed_positions: Option<&'a Path>,
    pub tied_positions: Option<&'a Path>,
    pub omit_positions: Option<&'a Path>,
    pub bias_by_res: Option<&'a Path>,
    pub profiles: Option<&'a Path>,
}

fn read_dict<T: for<'de> Deserialize<'de>>(path: Option<&Path>) -> Result<PerStructure<T>, DataError> {
    let Some(path) = path else {
        return Ok(HashMap::new());
    };
    let text = fs::read_to_string(path)
        .map_err(|e| DataError::Malformed(format!("{}: {e}", path.display())))?;
    // dictionaries are written as a single JSON object, sometimes on one JSONL line
    let body = text.trim();
    serde_json::from_str(body)
        .map_err(|e| DataError::Malformed(format!("{}: {e}", path.display())))
}

impl ConstraintSet {
    pub fn load(paths: &ConstraintPaths) -> Result<Self, DataError> {
        Ok(Self {
            chain_ids: read_dict(paths.chain_ids)?,
            fixed_positions: read_dict(paths.fixed_positions)?,
            tied_positions: read_dict(paths.tied_positions)?,
            omit_positions: read_dict(paths.omit_positions)?,
            bias_by_res: read_dict(paths.bias_by_res)?,
            profiles: read_dict(paths.profiles)?,
        })
    }

    pub fn for_structure(&self, name: &str) -> StructureConstraints {
        let (designed_chains, fixed_chains) = match self.chain_ids.get(name) {
            Some((designed, fixed)) => (Some(designed.clone()), fixed.clone()),
            None => (None, vec![]),
        };
        let tied_positions = self
            .tied_positions
            .get(name)
            .map(|groups| {
                groups
                    .iter()
                    .map(|group| {
                        group
                            .iter()
                            .flat_map(|(chain, entry)| {
                                entry.members().into_iter().map(|(position, weight)| TieMember {
                                    chain: chain.clone(),
                                    position,
                                    weight,
                                })
                            })
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default();
        StructureConstraints {
            designed_chains,
            fixed_chains,
            fixed_positions: self.fixed_positions.get(name).cloned().unwrap_or_default(),
            tied_positions,
            omit_positions: self.omit_positions.get(name).cloned().unwrap_or_default(),
            bias_by_res: self.bias_by_res.get(name).cloned().unwrap_or_default(),
            profiles: self.profiles.get(name).cloned().unwrap_or_default(),
        }
    }
}

/// Global composition bias, `{"A": -1.1, ...}`.
pub fn read_bias_aa(path: &Path) -> Result<BTreeMap<char, f32>, DataError> {
    let text = fs::read_to_string(path)
        .map_err(|e| DataError::Malformed(format!("{}: {e}", path.display())))?;
    let raw: BTreeMap<String, f32> = serde_json::from_str(text.trim())
        .map_err(|e| DataError::Malformed(format!("{}: {e}", path.display())))?;
    raw.into_iter()
        .map(|(key, value)| {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(aa), None) => Ok((aa, value)),
                _ => Err(DataError::Malformed(format!("bias key '{key}' is not one letter"))),
            }
        })
        .collect()
}

/// Sequences of a FASTA file, in order. Chain separators are kept.
pub fn read_fasta(path: &Path) -> std::io::Result<Vec<(String, String)>> {
    let text = fs::read_to_string(path)?;
    let mut records: Vec<(String, String)> = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(header) = line.strip_prefix('>') {
            records.push((header.to_string(), String::new()));
        } else if let Some((_, seq)) = records.last_mut() {
            seq.push_str(line);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferritin_test_data::{TestFile, TestStructure};

    #[test]
    fn test_parse_structure_sorts_chains() {
        let s = TestStructure::helix("two", "B", 4).with_helix_chain("A", 3, [10.0, 0.0, 0.0]);
        let record = StructureRecord::from_json_line(&s.to_jsonl_line()).unwrap();
        assert_eq!(record.name, "two");
        assert_eq!(record.chain_ids(), vec!["A", "B"]);
        assert_eq!(record.len(), 7);
        assert!(record.chain("B").unwrap().ca[0].is_some());
    }

    #[test]
    fn test_nan_and_null_are_missing() {
        let line = r#"{"name":"NaN-test","seq_chain_A":"AG","coords_chain_A":{"N_chain_A":[[0,0,0],[NaN,NaN,NaN]],"CA_chain_A":[[1,0,0],[null,null,null]],"C_chain_A":[[2,0,0],[1,1,1]],"O_chain_A":[[3,0,0],[1,1,1]]}}"#;
        let record = StructureRecord::from_json_line(line).unwrap();
        assert_eq!(record.name, "NaN-test");
        let chain = record.chain("A").unwrap();
        assert_eq!(chain.n[1], None);
        assert_eq!(chain.ca[1], None);
        assert_eq!(chain.c[1], Some([1.0, 1.0, 1.0]));
    }

    #[test]
    fn test_malformed_records() {
        assert!(matches!(
            StructureRecord::from_json_line("{not json"),
            Err(DataError::Malformed(_))
        ));
        let short = r#"{"name":"x","seq_chain_A":"AGG","coords_chain_A":{"N_chain_A":[[0,0,0]],"CA_chain_A":[[0,0,0]],"C_chain_A":[[0,0,0]],"O_chain_A":[[0,0,0]]}}"#;
        assert!(matches!(
            StructureRecord::from_json_line(short),
            Err(DataError::RowCount { expected: 3, found: 1, .. })
        ));
    }

    #[test]
    fn test_constraint_dictionaries() {
        let (chains, _t1) =
            TestFile::from_text(r#"{"p1": [["A"], ["B"]]}"#, "jsonl").create_temp().unwrap();
        let (tied, _t2) = TestFile::from_text(
            r#"{"p1": [{"A": [3], "B": [3]}, {"A": [[5, 6], [1.0, 0.5]]}]}"#,
            "jsonl",
        )
        .create_temp()
        .unwrap();
        let (omit, _t3) = TestFile::from_text(r#"{"p1": {"A": [[[1, 2], "CW"]]}}"#, "jsonl")
            .create_temp()
            .unwrap();

        let set = ConstraintSet::load(&ConstraintPaths {
            chain_ids: Some(Path::new(&chains)),
            tied_positions: Some(Path::new(&tied)),
            omit_positions: Some(Path::new(&omit)),
            ..Default::default()
        })
        .unwrap();

        let c = set.for_structure("p1");
        assert_eq!(c.designed_chains, Some(vec!["A".to_string()]));
        assert_eq!(c.fixed_chains, vec!["B".to_string()]);
        assert_eq!(c.tied_positions.len(), 2);
        assert_eq!(c.tied_positions[0].len(), 2);
        assert_eq!(c.tied_positions[1][1].weight, 0.5);
        assert_eq!(c.omit_positions["A"][0], (vec![1, 2], "CW".to_string()));
        assert_eq!(c.referenced_chains(), vec!["A", "B"]);

        let other = set.for_structure("unknown");
        assert!(other.designed_chains.is_none());
        assert!(other.tied_positions.is_empty());
    }

    #[test]
    fn test_bias_and_fasta() {
        let (bias, _t) = TestFile::from_text(r#"{"A": -1.1, "W": 0.5}"#, "json")
            .create_temp()
            .unwrap();
        let bias = read_bias_aa(Path::new(&bias)).unwrap();
        assert_eq!(bias[&'A'], -1.1);

        let (fasta, _t) = TestFile::from_text(">one\nMKE\nLL\n>two\nAG/GA\n", "fa")
            .create_temp()
            .unwrap();
        let records = read_fasta(Path::new(&fasta)).unwrap();
        assert_eq!(records[0].1, "MKELL");
        assert_eq!(records[1].1, "AG/GA");
    }
}
