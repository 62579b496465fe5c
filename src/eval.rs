//! Criterion-referenced evaluation documents for one unit.

use std::path::PathBuf;

use anyhow::Context as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::catalog::{Catalog, Subject};
use crate::cli::EvaluateArgs;
use crate::descriptors::{CriterionDescriptor, DescriptorCatalog, SubCriterion};
use crate::formats::{Unit, lenient_text, parse_units_document};
use crate::render::{DocumentKind, DocumentRenderer, TemplateFields};
use crate::synth::{UnitGenerator, generator_for, strip_code_fence};

/// Criterion evaluated when none is named.
pub const DEFAULT_CRITERION: &str = "D";

pub const MAX_DEFAULT_EXERCISES: usize = 5;

const DEFAULT_ANSWER_LINES: usize = 5;
const MAX_ANSWER_LINES: usize = 30;
const SHORT_DESCRIPTION_CHARS: usize = 60;
const OBJECTIVE_REF_CHARS: usize = 50;
const ANSWER_LINE: &str = "………………………………………………………………………………………………";
const LEVEL_BANDS: [(&str, &str); 5] = [
    ("descripteur_0", "0"),
    ("descripteur_1_2", "1-2"),
    ("descripteur_3_4", "3-4"),
    ("descripteur_5_6", "5-6"),
    ("descripteur_7_8", "7-8"),
];

const INSTRUCTIONS: &str = "Tu es un expert en évaluation critériée du Programme d'Éducation \
Intermédiaire (PEI) de l'IB. Tu réponds uniquement en JSON valide.";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Exercise {
    #[serde(deserialize_with = "count")]
    pub numero: usize,
    #[serde(deserialize_with = "lenient_text")]
    pub titre: String,
    #[serde(rename = "type", deserialize_with = "lenient_text")]
    pub kind: String,
    #[serde(deserialize_with = "lenient_text")]
    pub critere_ref: String,
    #[serde(deserialize_with = "lenient_text")]
    pub sous_critere_ref: String,
    #[serde(deserialize_with = "lenient_text")]
    pub objectif_ref: String,
    #[serde(deserialize_with = "lenient_text")]
    pub contenu: String,
    #[serde(deserialize_with = "count")]
    pub answer_lines: usize,
}

/// A non-negative count given as a number or a numeric string.
fn count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    let n = match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    Ok(n.and_then(|n| usize::try_from(n).ok()).unwrap_or(0))
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedCriterion {
    pub letter: String,
    pub descriptor: CriterionDescriptor,
    pub sub_criteria: Vec<SubCriterion>,
}

/// A validated evaluation input: at least one criterion, each known for the
/// subject and grade.
#[derive(Debug, Clone)]
pub struct EvaluationRequest<'a> {
    subject: &'a Subject,
    grade: String,
    unit: Unit,
    criteria: Vec<EvaluatedCriterion>,
}

impl<'a> EvaluationRequest<'a> {
    pub fn new(
        descriptors: &DescriptorCatalog,
        subject: &'a Subject,
        grade: &str,
        letters: &[String],
        unit: Unit,
    ) -> anyhow::Result<Self> {
        let letters = normalize_letters(letters);
        if letters.is_empty() {
            anyhow::bail!("at least one criterion is required");
        }
        let grade = grade.trim();
        let available = descriptors
            .criteria(&subject.id, grade)
            .with_context(|| format!("no descriptors for {} in grade {grade}", subject.id))?;

        let criteria = letters
            .into_iter()
            .map(|letter| {
                let descriptor = available.get(&letter).with_context(|| {
                    format!("criterion {letter} not found for {} {grade}", subject.id)
                })?;
                Ok(EvaluatedCriterion {
                    sub_criteria: descriptor.sub_criteria(),
                    descriptor: descriptor.clone(),
                    letter,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            subject,
            grade: grade.to_owned(),
            unit,
            criteria,
        })
    }

    pub fn subject(&self) -> &Subject {
        self.subject
    }

    pub fn grade(&self) -> &str {
        &self.grade
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    pub fn criteria(&self) -> &[EvaluatedCriterion] {
        &self.criteria
    }

    pub fn letters(&self) -> Vec<String> {
        self.criteria.iter().map(|c| c.letter.clone()).collect()
    }

    /// `<nom>_Criteres_<A_B>`, the variable part of the document name.
    pub fn file_label(&self) -> String {
        format!("{}_Criteres_{}", self.subject.nom, self.letters().join("_"))
    }
}

/// Trimmed, upper-cased, de-duplicated; blanks dropped.
fn normalize_letters(letters: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for letter in letters {
        let letter = letter.trim().to_uppercase();
        if !letter.is_empty() && !out.contains(&letter) {
            out.push(letter);
        }
    }
    out
}

/// Exercises for the request's criteria.
///
/// With a generator, exercises are delegated first; any failure falls
/// through to [`default_exercises`]. This never fails.
pub async fn generate_exercises(
    request: &EvaluationRequest<'_>,
    generator: Option<&dyn UnitGenerator>,
) -> Vec<Exercise> {
    if let Some(generator) = generator {
        let generated = async {
            let prompt = build_exercise_prompt(request);
            let raw = generator
                .generate(INSTRUCTIONS, &prompt)
                .await
                .context("generate exercises")?;
            parse_generated_exercises(&raw)
        };
        match generated.await {
            Ok(exercises) => {
                tracing::info!(
                    subject = %request.subject.id,
                    criteria = %request.letters().join(","),
                    exercises = exercises.len(),
                    "exercises generated"
                );
                return exercises;
            }
            Err(err) => {
                tracing::warn!(
                    subject = %request.subject.id,
                    error = %format!("{err:#}"),
                    "exercise generation failed; using default exercises"
                );
            }
        }
    }

    default_exercises(request)
}

pub fn build_exercise_prompt(request: &EvaluationRequest<'_>) -> String {
    let mut context = String::new();
    for criterion in &request.criteria {
        context.push_str(&format!(
            "\nCritère {} ({}):\nSous-critères:\n",
            criterion.letter, criterion.descriptor.titre
        ));
        for sub in &criterion.sub_criteria {
            context.push_str(&format!("  {}. {}\n", sub.numeral, sub.description));
        }
    }

    format!(
        "Génère des exercices d'évaluation VARIÉS et CONCRETS.\n\
\n\
Matière: {nom}\n\
Niveau: {grade}\n\
Unité: {titre}\n\
Énoncé de recherche: {enonce}\n\
\n\
Critères à évaluer: {letters}\n\
{context}\n\
Génère 4 à 6 exercices qui évaluent ces sous-critères.\n\
Types d'exercices à mélanger: qcm, question_ouverte, analyse_donnees, application_pratique.\n\
Chaque exercice est adapté à l'unité et référence son critère et son sous-critère.\n\
Pour les QCM, indique les 4 options avec •.\n\
Pour les questions ouvertes, prévois des lignes de réponse (answer_lines).\n\
\n\
Réponds UNIQUEMENT avec un objet JSON de la forme:\n\
{{\"exercices\":[{{\"numero\":1,\"titre\":\"...\",\"type\":\"qcm\",\"critere_ref\":\"A\",\
\"sous_critere_ref\":\"i\",\"objectif_ref\":\"...\",\"contenu\":\"...\",\"answer_lines\":0}}]}}\n",
        nom = request.subject.nom,
        grade = request.grade,
        titre = request.unit.titre_unite,
        enonce = request.unit.enonce_recherche,
        letters = request.letters().join(", "),
    )
}

/// Reads the `exercices` list of a generated response, numbered from 1.
pub fn parse_generated_exercises(raw: &str) -> anyhow::Result<Vec<Exercise>> {
    let json = strip_code_fence(raw);
    let mut value: Value = serde_json::from_str(json).context("parse generated json")?;
    let exercices = value
        .get_mut("exercices")
        .map(Value::take)
        .ok_or_else(|| anyhow::anyhow!("generated json has no `exercices` field"))?;
    if !exercices.is_array() {
        anyhow::bail!("generated `exercices` is not a list");
    }
    let mut exercises: Vec<Exercise> =
        serde_json::from_value(exercices).context("parse generated exercises")?;
    if exercises.is_empty() {
        anyhow::bail!("generated `exercices` is empty");
    }
    for (i, exercise) in exercises.iter_mut().enumerate() {
        exercise.numero = i + 1;
        exercise.critere_ref = exercise.critere_ref.trim().to_uppercase();
        exercise.sous_critere_ref = exercise.sous_critere_ref.trim().to_lowercase();
        exercise.answer_lines = exercise.answer_lines.min(MAX_ANSWER_LINES);
    }
    Ok(exercises)
}

/// One open question per sub-criterion, criteria in request order, at most
/// [`MAX_DEFAULT_EXERCISES`]. A criterion without numbered strands gets one
/// question on its title.
pub fn default_exercises(request: &EvaluationRequest<'_>) -> Vec<Exercise> {
    let exercise = |letter: &str, numeral: &str, description: &str| {
        let titre = if numeral.is_empty() {
            format!("Évaluation {letter}")
        } else {
            format!("Évaluation {letter}.{numeral}")
        };
        Exercise {
            numero: 0,
            titre,
            kind: "question_ouverte".to_owned(),
            critere_ref: letter.to_owned(),
            sous_critere_ref: numeral.to_owned(),
            objectif_ref: truncate_chars(description, OBJECTIVE_REF_CHARS),
            contenu: format!(
                "Réalisez une tâche qui démontre: {description}\n\n\
Consignes:\n\
1. Situez le problème dans un contexte réel\n\
2. Expliquez votre démarche\n\
3. Justifiez vos choix avec des notions du cours\n\n\
(À compléter par l'enseignant si nécessaire)"
            ),
            answer_lines: DEFAULT_ANSWER_LINES,
        }
    };

    let mut exercises = request
        .criteria
        .iter()
        .flat_map(|c| {
            if c.sub_criteria.is_empty() {
                vec![exercise(&c.letter, "", &c.descriptor.titre)]
            } else {
                c.sub_criteria
                    .iter()
                    .map(|s| exercise(&c.letter, &s.numeral, &s.description))
                    .collect()
            }
        })
        .take(MAX_DEFAULT_EXERCISES)
        .collect::<Vec<_>>();
    for (i, exercise) in exercises.iter_mut().enumerate() {
        exercise.numero = i + 1;
    }
    exercises
}

/// Placeholder values of the evaluation template.
pub fn evaluation_fields(
    request: &EvaluationRequest<'_>,
    exercises: &[Exercise],
) -> TemplateFields {
    let criteria = &request.criteria;
    let single = criteria.len() == 1;

    let names = if single {
        criteria[0].descriptor.titre.clone()
    } else {
        criteria
            .iter()
            .map(|c| format!("{}: {}", c.letter, c.descriptor.titre))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let strands = criteria
        .iter()
        .flat_map(|c| {
            c.sub_criteria
                .iter()
                .map(move |s| format!("{}.{}. {}", c.letter, s.numeral, s.description))
        })
        .collect::<Vec<_>>();
    let objectives = if strands.is_empty() {
        "Aucun sous-critère spécifique défini.".to_owned()
    } else {
        format!("Sous-critères évalués:\n{}", strands.join("\n"))
    };

    let mut fields = TemplateFields::from([
        ("annee_pei", request.grade.clone()),
        ("groupe_matiere", request.subject.nom.clone()),
        ("titre_unite", request.unit.titre_unite.clone()),
        ("enonce_de_recherche", request.unit.enonce_recherche.clone()),
        ("lettre_critere", request.letters().join(", ")),
        ("nom_objectif_specifique", names),
        ("objectifs_specifiques", objectives),
        ("criteres_resume", criteria_summary(criteria, exercises)),
        ("exercices", format_exercises(exercises)),
    ]);

    for (field, band) in LEVEL_BANDS {
        let text = if single {
            criteria[0].descriptor.level(band).to_owned()
        } else {
            criteria
                .iter()
                .map(|c| format!("{}: {}", c.letter, c.descriptor.level(band)))
                .collect::<Vec<_>>()
                .join("\n")
        };
        fields.insert(field, text);
    }
    fields
}

/// Each criterion with its strands and the exercise assessing each one.
fn criteria_summary(criteria: &[EvaluatedCriterion], exercises: &[Exercise]) -> String {
    criteria
        .iter()
        .map(|c| {
            let mut lines = vec![format!("Critère {}: {}", c.letter, c.descriptor.titre)];
            lines.extend(c.sub_criteria.iter().map(|s| {
                let title = exercises
                    .iter()
                    .find(|e| e.critere_ref == c.letter && e.sous_critere_ref == s.numeral)
                    .map_or_else(
                        || format!("Exercice {}.{}", c.letter, s.numeral),
                        |e| e.titre.clone(),
                    );
                let short = if s.description.chars().count() > SHORT_DESCRIPTION_CHARS {
                    format!("{}...", truncate_chars(&s.description, SHORT_DESCRIPTION_CHARS))
                } else {
                    s.description.clone()
                };
                format!("{}. {short} → {title}", s.numeral)
            }));
            lines.join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn format_exercises(exercises: &[Exercise]) -> String {
    exercises
        .iter()
        .map(|e| {
            let reference = match (e.critere_ref.as_str(), e.sous_critere_ref.as_str()) {
                ("", _) => String::new(),
                (letter, "") => format!(" (Critère {letter})"),
                (letter, numeral) => format!(" (Critère {letter}.{numeral})"),
            };
            let mut block = format!(
                "Exercice {}: {}{reference}\n{}",
                e.numero, e.titre, e.contenu
            );
            for _ in 0..e.answer_lines {
                block.push('\n');
                block.push_str(ANSWER_LINE);
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

pub async fn run(args: EvaluateArgs, catalog: &Catalog) -> anyhow::Result<()> {
    let units_path = PathBuf::from(&args.units);
    let raw = std::fs::read_to_string(&units_path)
        .with_context(|| format!("read units: {}", units_path.display()))?;
    let mut units = parse_units_document(&raw)
        .with_context(|| format!("parse units: {}", units_path.display()))?;
    if args.index >= units.len() {
        anyhow::bail!(
            "unit index {} out of range ({} units)",
            args.index,
            units.len()
        );
    }
    let unit = units.swap_remove(args.index);

    let subject = catalog
        .subject(&args.subject)
        .with_context(|| format!("unknown subject: {}", args.subject))?;
    let descriptors = DescriptorCatalog::load_or_builtin(args.descriptors.as_deref())
        .context("load descriptors")?;
    let request = EvaluationRequest::new(&descriptors, subject, &args.grade, &args.criteria, unit)
        .context("validate evaluation request")?;

    let client = generator_for(args.engine)?;
    tracing::info!(
        engine = ?args.engine,
        subject = %subject.id,
        grade = %request.grade(),
        criteria = %request.letters().join(","),
        "evaluate"
    );
    let exercises =
        generate_exercises(&request, client.as_ref().map(|c| c as &dyn UnitGenerator)).await;

    let fields = evaluation_fields(&request, &exercises);
    let renderer =
        DocumentRenderer::new(None, args.out_dir).with_evaluation_template(args.template);
    let path = tokio::task::block_in_place(|| {
        renderer.render_fields(DocumentKind::Evaluation, &fields, &request.file_label())
    })?;
    println!("{}", path.display());
    Ok(())
}
