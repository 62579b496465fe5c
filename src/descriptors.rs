use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context as _;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::catalog::{expand_combined_keys, normalize_grade};

const BUILTIN_DESCRIPTORS: &str = include_str!("../data/descriptors.yaml");

/// `i. indique le besoin ... ;` → numeral `i`, text up to the next `;`.
static SUB_CRITERION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([ivx]+)\.\s*([^;]+)").expect("valid regex"));

/// Achievement-level descriptors of one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionDescriptor {
    pub titre: String,
    /// Level band (`"0"`, `"1-2"` .. `"7-8"`) to descriptor text.
    pub niveaux: BTreeMap<String, String>,
}

/// One numbered strand of a criterion (`i`, `ii`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubCriterion {
    pub numeral: String,
    pub description: String,
}

impl CriterionDescriptor {
    pub fn level(&self, band: &str) -> &str {
        self.niveaux.get(band).map_or("", String::as_str)
    }

    /// Sub-criteria named across every level but `0`, in order of first
    /// appearance. Later (higher) levels overwrite the wording.
    pub fn sub_criteria(&self) -> Vec<SubCriterion> {
        let mut subs: Vec<SubCriterion> = Vec::new();
        let found = self
            .niveaux
            .iter()
            .filter(|(band, _)| band.as_str() != "0")
            .flat_map(|(_, text)| extract_sub_criteria(text));
        for sub in found {
            match subs.iter_mut().find(|s| s.numeral == sub.numeral) {
                Some(existing) => existing.description = sub.description,
                None => subs.push(sub),
            }
        }
        subs
    }
}

/// Numbered strands of one descriptor text, in text order.
pub fn extract_sub_criteria(text: &str) -> Vec<SubCriterion> {
    SUB_CRITERION
        .captures_iter(text)
        .map(|caps| SubCriterion {
            numeral: caps[1].to_lowercase(),
            description: caps[2].trim().to_owned(),
        })
        .collect()
}

/// Criterion letter to descriptors, for one grade.
pub type GradeDescriptors = BTreeMap<String, CriterionDescriptor>;

#[derive(Debug, Deserialize)]
struct DescriptorFile {
    descripteurs: BTreeMap<String, BTreeMap<String, GradeDescriptors>>,
}

/// Read-only assessment descriptors keyed by subject id and grade.
#[derive(Debug, Clone)]
pub struct DescriptorCatalog {
    subjects: BTreeMap<String, BTreeMap<String, GradeDescriptors>>,
}

impl DescriptorCatalog {
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_yaml_str(BUILTIN_DESCRIPTORS).context("parse builtin descriptors")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("read descriptors: {}", path.display()))?;
        Self::from_yaml_str(&yaml)
            .with_context(|| format!("parse descriptors: {}", path.display()))
    }

    pub fn load_or_builtin(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let file: DescriptorFile =
            serde_yaml::from_str(yaml).context("deserialize descriptors yaml")?;
        if file.descripteurs.is_empty() {
            anyhow::bail!("descriptor catalog has no subjects");
        }

        let mut subjects = file.descripteurs;
        for (subject, grades) in &mut subjects {
            for (grade, criteria) in grades.iter() {
                for (letter, descriptor) in criteria {
                    let single_letter = letter.len() == 1
                        && letter.chars().all(|c| c.is_ascii_uppercase());
                    if !single_letter {
                        anyhow::bail!(
                            "{subject} {grade}: criterion must be one letter, got {letter:?}"
                        );
                    }
                    if descriptor.titre.trim().is_empty() {
                        anyhow::bail!("{subject} {grade} {letter}: empty title");
                    }
                }
            }
            expand_combined_keys(grades);
        }
        Ok(Self { subjects })
    }

    pub fn criteria(&self, subject_id: &str, grade: &str) -> Option<&GradeDescriptors> {
        self.subjects
            .get(subject_id.trim())?
            .get(&normalize_grade(grade))
    }

    pub fn criterion(
        &self,
        subject_id: &str,
        grade: &str,
        letter: &str,
    ) -> Option<&CriterionDescriptor> {
        self.criteria(subject_id, grade)?.get(letter)
    }
}
