use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::catalog::{Catalog, Subject};
use crate::cli::{LlmEngine, SynthesizeArgs};
use crate::formats::{Chapter, ChapterId, Unit, parse_chapters_document};
use crate::openai::{OpenAiClient, OpenAiConfig};

/// Objective tokens given to every partitioned unit.
pub const FALLBACK_OBJECTIVES: [&str; 5] = ["A.i", "A.ii", "B.i", "C.i", "D.i"];

const FALLBACK_RELATED_CONCEPTS: usize = 3;

/// Upper bound on the units of one synthesis; a school year holds far fewer.
pub const MAX_UNITS: usize = 12;

const INSTRUCTIONS: &str = "Tu es un expert en pédagogie du Programme d'Éducation \
Intermédiaire (PEI) de l'IB. Tu réponds uniquement en JSON valide.";

/// Text generator used to delegate unit grouping.
#[async_trait]
pub trait UnitGenerator: Send + Sync {
    async fn generate(&self, instructions: &str, prompt: &str) -> anyhow::Result<String>;
}

#[async_trait]
impl UnitGenerator for OpenAiClient {
    async fn generate(&self, instructions: &str, prompt: &str) -> anyhow::Result<String> {
        self.complete(instructions, prompt).await
    }
}

/// A validated synthesis input: chapters are non-empty, the unit count is
/// within `1..=MAX_UNITS`, and the subject has objectives for the grade band.
#[derive(Debug, Clone)]
pub struct SynthesisRequest<'a> {
    subject: &'a Subject,
    global_contexts: &'a [String],
    grade: String,
    chapters: Vec<Chapter>,
    unit_count: usize,
    teacher: String,
}

impl<'a> SynthesisRequest<'a> {
    pub fn new(
        catalog: &'a Catalog,
        subject: &'a Subject,
        grade: &str,
        chapters: Vec<Chapter>,
        unit_count: usize,
    ) -> anyhow::Result<Self> {
        if chapters.is_empty() {
            anyhow::bail!("chapter list is empty");
        }
        if unit_count == 0 {
            anyhow::bail!("unit count must be >= 1");
        }
        if unit_count > MAX_UNITS {
            anyhow::bail!("unit count must be <= {MAX_UNITS}, got {unit_count}");
        }
        if subject.objectives(grade).is_none() {
            anyhow::bail!("no objectives for {} in grade {grade}", subject.id);
        }
        Ok(Self {
            subject,
            global_contexts: catalog.global_contexts(),
            grade: grade.trim().to_owned(),
            chapters,
            unit_count,
            teacher: String::new(),
        })
    }

    pub fn with_teacher(mut self, teacher: impl Into<String>) -> Self {
        self.teacher = teacher.into();
        self
    }

    pub fn subject(&self) -> &Subject {
        self.subject
    }

    pub fn grade(&self) -> &str {
        &self.grade
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn unit_count(&self) -> usize {
        self.unit_count
    }

    pub fn teacher(&self) -> &str {
        &self.teacher
    }

    fn related_concepts(&self) -> &[String] {
        self.subject.related_concepts(&self.grade)
    }
}

/// The client selected by `engine`: `None` for `noop`, or when no API key is
/// set and the deterministic fallback applies.
pub fn generator_for(engine: LlmEngine) -> anyhow::Result<Option<OpenAiClient>> {
    match engine {
        LlmEngine::Noop => Ok(None),
        LlmEngine::Openai => {
            let config = OpenAiConfig::from_env();
            let client = OpenAiClient::from_config(&config).context("build openai client")?;
            if client.is_none() {
                tracing::info!("OPENAI_API_KEY is not set; using the deterministic fallback");
            }
            Ok(client)
        }
    }
}

/// Groups the request's chapters into units.
///
/// With a generator, the grouping is delegated first; any failure there
/// (transport, unparseable output, no `unites`) falls through to
/// [`partition_units`]. This never fails.
pub async fn synthesize(
    request: &SynthesisRequest<'_>,
    generator: Option<&dyn UnitGenerator>,
) -> Vec<Unit> {
    if let Some(generator) = generator {
        match generate_units(request, generator).await {
            Ok(units) => {
                tracing::info!(
                    subject = %request.subject.id,
                    grade = %request.grade,
                    units = units.len(),
                    "units generated"
                );
                return units;
            }
            Err(err) => {
                tracing::warn!(
                    subject = %request.subject.id,
                    error = %format!("{err:#}"),
                    "unit generation failed; partitioning chapters instead"
                );
            }
        }
    } else {
        tracing::debug!(subject = %request.subject.id, "no generator configured");
    }

    partition_units(request)
}

async fn generate_units(
    request: &SynthesisRequest<'_>,
    generator: &dyn UnitGenerator,
) -> anyhow::Result<Vec<Unit>> {
    let prompt = build_prompt(request).context("build prompt")?;
    let raw = generator
        .generate(INSTRUCTIONS, &prompt)
        .await
        .context("generate units")?;
    parse_generated_units(&raw)
}

pub fn build_prompt(request: &SynthesisRequest<'_>) -> anyhow::Result<String> {
    let chapters_json =
        serde_json::to_string_pretty(&request.chapters).context("serialize chapters json")?;
    let n = request.unit_count;

    Ok(format!(
        "Voici les chapitres d'un programme pour la matière \"{nom}\" en année {grade}.\n\
\n\
BEGIN_CHAPITRES_JSON\n\
{chapters_json}\n\
END_CHAPITRES_JSON\n\
\n\
Concepts clés disponibles: {concepts_cles}\n\
Concepts connexes disponibles: {concepts_connexes}\n\
Contextes mondiaux disponibles: {contextes}\n\
\n\
Tu dois générer EXACTEMENT {n} unités pédagogiques en regroupant les chapitres par thèmes cohérents.\n\
Chaque chapitre appartient à une seule unité, dans l'ordre donné.\n\
\n\
Pour chaque unité, fournis:\n\
1. titre_unite: un titre engageant qui regroupe les chapitres\n\
2. chapitres_inclus: les identifiants des chapitres regroupés\n\
3. duree: durée totale en heures (somme des durées des chapitres)\n\
4. concept_cle: un concept clé parmi ceux disponibles\n\
5. concepts_connexes: 2-3 concepts connexes pertinents\n\
6. contexte_mondial: un contexte mondial parmi ceux disponibles\n\
7. enonce_recherche: un énoncé de recherche stimulant\n\
8. questions_factuelles: 2-3 questions factuelles\n\
9. questions_conceptuelles: 2-3 questions conceptuelles\n\
10. questions_debat: 2-3 questions invitant au débat\n\
11. objectifs_specifiques: les objectifs pertinents (format: \"A.i, A.ii, B.i, C.iii, D.ii\")\n\
\n\
Réponds UNIQUEMENT avec un objet JSON de la forme:\n\
{{\"unites\":[{{\"titre_unite\":\"...\",\"chapitres_inclus\":[1,2],\"duree\":0,\"concept_cle\":\"...\",\
\"concepts_connexes\":[\"...\"],\"contexte_mondial\":\"...\",\"enonce_recherche\":\"...\",\
\"questions_factuelles\":[\"...\"],\"questions_conceptuelles\":[\"...\"],\"questions_debat\":[\"...\"],\
\"objectifs_specifiques\":[\"A.i\",\"B.ii\"]}}]}}\n",
        nom = request.subject.nom,
        grade = request.grade,
        chapters_json = chapters_json.trim_end(),
        concepts_cles = request.subject.concepts_cles.join(", "),
        concepts_connexes = request.related_concepts().join(", "),
        contextes = request.global_contexts.join(", "),
    ))
}

/// Removes a surrounding code fence, preferring a ```` ```json ```` one.
pub fn strip_code_fence(text: &str) -> &str {
    let inner = if let Some((_, rest)) = text.split_once("```json") {
        rest.split("```").next().unwrap_or(rest)
    } else if let Some((_, rest)) = text.split_once("```") {
        rest.split("```").next().unwrap_or(rest)
    } else {
        text
    };
    inner.trim()
}

/// Reads the `unites` list of a generated response.
pub fn parse_generated_units(raw: &str) -> anyhow::Result<Vec<Unit>> {
    let json = strip_code_fence(raw);
    let mut value: serde_json::Value =
        serde_json::from_str(json).context("parse generated json")?;
    let unites = value
        .get_mut("unites")
        .map(serde_json::Value::take)
        .ok_or_else(|| anyhow::anyhow!("generated json has no `unites` field"))?;
    if !unites.is_array() {
        anyhow::bail!("generated `unites` is not a list");
    }
    let units: Vec<Unit> = serde_json::from_value(unites).context("parse generated units")?;
    if units.is_empty() {
        anyhow::bail!("generated `unites` is empty");
    }
    Ok(units)
}

/// Deterministic grouping: `unit_count` consecutive slices of
/// `max(1, len / unit_count)` chapters, the last slice taking the remainder.
pub fn partition_units(request: &SynthesisRequest<'_>) -> Vec<Unit> {
    let chapters = request.chapters.as_slice();
    let subject = request.subject;
    let contexts = request.global_contexts;
    let count = request.unit_count;
    let chunk = (chapters.len() / count).max(1);
    let related = request
        .related_concepts()
        .iter()
        .take(FALLBACK_RELATED_CONCEPTS)
        .cloned()
        .collect::<Vec<_>>();

    (0..count)
        .map(|i| {
            let start = (i * chunk).min(chapters.len());
            let end = if i + 1 == count {
                chapters.len()
            } else {
                (start + chunk).min(chapters.len())
            };
            let slice = &chapters[start..end];

            let first = slice.first().map_or("", |c| c.titre.as_str());
            let titles = slice
                .iter()
                .take(2)
                .map(|c| c.titre.as_str())
                .collect::<Vec<_>>()
                .join(" et ");

            Unit {
                titre_unite: format!("Unité {}: {titles}", i + 1),
                chapitres_inclus: slice
                    .iter()
                    .enumerate()
                    .map(|(j, c)| c.id.clone().unwrap_or_else(|| ChapterId::from(start + j)))
                    .collect(),
                duree: slice.iter().map(|c| c.duree).sum(),
                concept_cle: subject.concepts_cles[i % subject.concepts_cles.len()].clone(),
                concepts_connexes: related.clone(),
                contexte_mondial: contexts[i % contexts.len()].clone(),
                enonce_recherche: format!("Exploration de {first}"),
                questions_factuelles: vec![
                    format!("Quels sont les éléments clés de {first}?"),
                    format!("Comment définir {first}?"),
                ],
                questions_conceptuelles: vec![
                    format!("Pourquoi {first} est-il important?"),
                    format!("Comment {first} influence-t-il notre compréhension?"),
                ],
                questions_debat: vec![
                    format!("Dans quelle mesure {first} affecte-t-il notre société?"),
                    format!("Quel est l'impact de {first} sur notre futur?"),
                ],
                objectifs_specifiques: FALLBACK_OBJECTIVES.map(str::to_owned).to_vec(),
            }
        })
        .collect()
}

pub async fn run(args: SynthesizeArgs, catalog: &Catalog) -> anyhow::Result<()> {
    let chapters_path = PathBuf::from(&args.chapters);
    let out_path = PathBuf::from(&args.out);

    if out_path.exists() && !args.force {
        anyhow::bail!("units output already exists: {}", out_path.display());
    }

    let raw = std::fs::read_to_string(&chapters_path)
        .with_context(|| format!("read chapters: {}", chapters_path.display()))?;
    let chapters = parse_chapters_document(&raw)
        .with_context(|| format!("parse chapters: {}", chapters_path.display()))?;

    let subject = catalog
        .subject(&args.subject)
        .with_context(|| format!("unknown subject: {}", args.subject))?;
    let unit_count = args.units.unwrap_or(subject.nb_unites);
    let request = SynthesisRequest::new(catalog, subject, &args.grade, chapters, unit_count)
        .context("validate synthesis request")?
        .with_teacher(args.teacher.clone());

    let client = generator_for(args.engine)?;
    tracing::info!(
        engine = ?args.engine,
        subject = %subject.id,
        grade = %request.grade(),
        chapters = request.chapters().len(),
        units = unit_count,
        "synthesize"
    );

    let units = synthesize(&request, client.as_ref().map(|c| c as &dyn UnitGenerator)).await;

    if let Some(parent) = out_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir: {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(&serde_json::json!({ "units": units }))
        .context("serialize units json")?;

    let mut options = OpenOptions::new();
    options.write(true);
    if args.force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    let mut out = options
        .open(&out_path)
        .with_context(|| format!("open units output: {}", out_path.display()))?;
    out.write_all(json.as_bytes())
        .with_context(|| format!("write units: {}", out_path.display()))?;
    out.flush().context("flush units")?;

    Ok(())
}
