use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write as _;
use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

const BUILTIN_CATALOG: &str = include_str!("../data/catalog.yaml");

/// Objective sentences of one grade band, keyed by criterion letter.
pub type Objectives = BTreeMap<String, Vec<String>>;

/// Which criterion-label table a subject uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionFamily {
    Design,
    #[default]
    General,
}

impl CriterionFamily {
    pub fn label(self, criterion: &str) -> Option<&'static str> {
        let labels = match self {
            Self::Design => [
                "Recherche et analyse",
                "Développement des idées",
                "Création de la solution",
                "Évaluation",
            ],
            Self::General => [
                "Analyse",
                "Organisation",
                "Production de texte",
                "Utilisation de la langue",
            ],
        };
        let index = match criterion {
            "A" => 0,
            "B" => 1,
            "C" => 2,
            "D" => 3,
            _ => return None,
        };
        Some(labels[index])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub nom: String,
    #[serde(default = "default_unit_count")]
    pub nb_unites: usize,
    #[serde(default)]
    pub famille_criteres: CriterionFamily,
    pub concepts_cles: Vec<String>,
    #[serde(default)]
    pub concepts_connexes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub concepts_connexes_par_annee: BTreeMap<String, Vec<String>>,
    pub objectifs: BTreeMap<String, Objectives>,
}

fn default_unit_count() -> usize {
    4
}

impl Subject {
    pub fn objectives(&self, grade: &str) -> Option<&Objectives> {
        self.objectifs.get(&normalize_grade(grade))
    }

    /// Grade-specific related concepts when the subject defines them, the
    /// generic list otherwise.
    pub fn related_concepts(&self, grade: &str) -> &[String] {
        self.concepts_connexes_par_annee
            .get(&normalize_grade(grade))
            .map_or(self.concepts_connexes.as_slice(), Vec::as_slice)
    }

    pub fn grade_bands(&self) -> impl Iterator<Item = &str> {
        self.objectifs.keys().map(String::as_str)
    }

    fn expand_combined_grades(&mut self) {
        expand_combined_keys(&mut self.objectifs);
        expand_combined_keys(&mut self.concepts_connexes_par_annee);
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("subject id is empty");
        }
        if self.concepts_cles.is_empty() {
            anyhow::bail!("subject {} has no key concepts", self.id);
        }
        if self.nb_unites == 0 {
            anyhow::bail!("subject {} has nb_unites = 0", self.id);
        }
        for (grade, objectives) in &self.objectifs {
            for criterion in objectives.keys() {
                let mut chars = criterion.chars();
                let single_letter = chars.next().is_some_and(|c| c.is_ascii_uppercase())
                    && chars.next().is_none();
                if !single_letter {
                    anyhow::bail!(
                        "subject {} grade {grade}: criterion must be one letter, got {criterion:?}",
                        self.id
                    );
                }
            }
        }
        Ok(())
    }
}

/// Read-only curriculum catalog: subjects and the global-context list.
#[derive(Debug, Clone)]
pub struct Catalog {
    global_contexts: Vec<String>,
    subjects: Vec<Subject>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    contextes_mondiaux: Vec<String>,
    matieres: Vec<Subject>,
}

impl Catalog {
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_yaml_str(BUILTIN_CATALOG).context("parse built-in catalog")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("read catalog: {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("parse catalog: {}", path.display()))
    }

    /// Loads `path` when given, the built-in catalog otherwise.
    pub fn load_or_builtin(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml).context("deserialize catalog yaml")?;
        if file.contextes_mondiaux.is_empty() {
            anyhow::bail!("catalog has no global contexts");
        }
        if file.matieres.is_empty() {
            anyhow::bail!("catalog has no subjects");
        }

        let mut subjects = file.matieres;
        let mut index = HashMap::new();
        for (pos, subject) in subjects.iter_mut().enumerate() {
            subject.validate()?;
            subject.expand_combined_grades();
            if index.insert(subject.id.clone(), pos).is_some() {
                anyhow::bail!("duplicate subject id: {}", subject.id);
            }
        }

        Ok(Self {
            global_contexts: file.contextes_mondiaux,
            subjects,
            index,
        })
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn subject(&self, id: &str) -> Option<&Subject> {
        self.index.get(id.trim()).map(|&pos| &self.subjects[pos])
    }

    pub fn global_contexts(&self) -> &[String] {
        &self.global_contexts
    }
}

/// `PEI 3` → `pei3`, `3` → `pei3`, `pei1-2` stays as is.
pub fn normalize_grade(grade: &str) -> String {
    let compact = grade
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect::<String>();
    if compact.starts_with(|c: char| c.is_ascii_digit()) {
        format!("pei{compact}")
    } else {
        compact
    }
}

/// Individual grades covered by a combined key (`pei1-2` → `pei1`, `pei2`).
fn individual_grades(key: &str) -> Vec<String> {
    let Some((head, last)) = key.rsplit_once('-') else {
        return Vec::new();
    };
    let prefix = head.trim_end_matches(|c: char| c.is_ascii_digit());
    let (Ok(first), Ok(last)) = (head[prefix.len()..].parse::<u32>(), last.parse::<u32>()) else {
        return Vec::new();
    };
    if first >= last || last - first > 12 {
        return Vec::new();
    }
    (first..=last).map(|n| format!("{prefix}{n}")).collect()
}

pub(crate) fn expand_combined_keys<T: Clone>(map: &mut BTreeMap<String, T>) {
    let explicit = map.keys().cloned().collect::<HashSet<_>>();
    let combined = map
        .iter()
        .flat_map(|(key, value)| {
            individual_grades(key)
                .into_iter()
                .map(move |grade| (grade, value.clone()))
        })
        .collect::<Vec<_>>();

    for (grade, value) in combined {
        if explicit.contains(&grade) {
            continue;
        }
        map.entry(grade).or_insert(value);
    }
}

pub fn print_subjects(catalog: &Catalog) -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for subject in catalog.subjects() {
        writeln!(out, "{}\t{}", subject.id, subject.nom).context("write subject list")?;
    }
    Ok(())
}
