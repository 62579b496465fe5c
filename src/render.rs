use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Local};
use zip::write::SimpleFileOptions;

use crate::catalog::{Catalog, Subject};
use crate::cli::RenderArgs;
use crate::formats::{Unit, hours, parse_units_document};
use crate::objectives::format_objectives;

/// Placeholder name (without braces) to replacement text.
pub type TemplateFields = BTreeMap<&'static str, String>;

/// Rows of the built-in unit plan template: label, placeholder.
const UNIT_PLAN_ROWS: [(&str, &str); 14] = [
    ("Enseignant(e)", "enseignant"),
    ("Groupe de matières", "groupe_matiere"),
    ("Titre de l'unité", "titre_unite"),
    ("Année du PEI", "annee_pei"),
    ("Durée (heures)", "duree"),
    ("Chapitres inclus", "chapitres_inclus"),
    ("Concept clé", "concept_cle"),
    ("Concepts connexes", "concepts_connexes"),
    ("Contexte mondial", "contexte_mondial"),
    ("Énoncé de recherche", "enonce_de_recherche"),
    ("Questions factuelles", "questions_factuelles"),
    ("Questions conceptuelles", "questions_conceptuelles"),
    ("Questions invitant au débat", "questions_debat"),
    ("Objectifs spécifiques", "objectifs_specifiques"),
];

const EVALUATION_ROWS: [(&str, &str); 14] = [
    ("Groupe de matières", "groupe_matiere"),
    ("Année du PEI", "annee_pei"),
    ("Titre de l'unité", "titre_unite"),
    ("Énoncé de recherche", "enonce_de_recherche"),
    ("Critère(s) évalué(s)", "lettre_critere"),
    ("Intitulé", "nom_objectif_specifique"),
    ("Objectifs spécifiques", "objectifs_specifiques"),
    ("Sous-critères et exercices", "criteres_resume"),
    ("Niveau 0", "descripteur_0"),
    ("Niveaux 1-2", "descripteur_1_2"),
    ("Niveaux 3-4", "descripteur_3_4"),
    ("Niveaux 5-6", "descripteur_5_6"),
    ("Niveaux 7-8", "descripteur_7_8"),
    ("Exercices", "exercices"),
];

/// The documents the renderer produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    UnitPlan,
    Evaluation,
}

impl DocumentKind {
    pub const ALL: [Self; 2] = [Self::UnitPlan, Self::Evaluation];

    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::UnitPlan => "Unite_PEI_",
            Self::Evaluation => "Evaluation_PEI_",
        }
    }

    fn title(self) -> &'static str {
        match self {
            Self::UnitPlan => "Planificateur d'unité PEI",
            Self::Evaluation => "Évaluation critériée PEI",
        }
    }

    fn rows(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::UnitPlan => &UNIT_PLAN_ROWS,
            Self::Evaluation => &EVALUATION_ROWS,
        }
    }
}

pub fn template_fields(
    unit: &Unit,
    subject: &Subject,
    grade: &str,
    teacher: &str,
) -> TemplateFields {
    let chapters = unit
        .chapitres_inclus
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    TemplateFields::from([
        ("enseignant", teacher.to_owned()),
        ("groupe_matiere", subject.nom.clone()),
        ("titre_unite", unit.titre_unite.clone()),
        ("annee_pei", grade.to_owned()),
        ("duree", hours::format(unit.duree)),
        ("chapitres_inclus", chapters),
        ("concept_cle", unit.concept_cle.clone()),
        ("concepts_connexes", unit.concepts_connexes.join(", ")),
        ("contexte_mondial", unit.contexte_mondial.clone()),
        ("enonce_de_recherche", unit.enonce_recherche.clone()),
        ("enonce_recherche", unit.enonce_recherche.clone()),
        ("questions_factuelles", unit.questions_factuelles.join("\n")),
        ("questions_conceptuelles", unit.questions_conceptuelles.join("\n")),
        ("questions_debat", unit.questions_debat.join("\n")),
        (
            "objectifs_specifiques",
            format_objectives(&unit.objectifs_specifiques, subject, grade)
                .trim_start_matches('\n')
                .to_owned(),
        ),
    ])
}

/// Copies a `.docx` archive, filling placeholders in its Word XML parts.
pub fn fill_docx<R, W>(template: R, out: W, fields: &TemplateFields) -> anyhow::Result<()>
where
    R: Read + Seek,
    W: Write + Seek,
{
    let mut archive = zip::ZipArchive::new(template).context("open template archive")?;
    let mut writer = zip::ZipWriter::new(out);
    let deflated = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("read template entry #{index}"))?;
        let name = entry.name().to_owned();

        if !is_fillable_part(&name) {
            writer
                .raw_copy_file(entry)
                .with_context(|| format!("copy template entry: {name}"))?;
            continue;
        }

        let mut xml = String::new();
        entry
            .read_to_string(&mut xml)
            .with_context(|| format!("read template part: {name}"))?;

        let filled = fill_xml(&xml, fields);
        writer
            .start_file(name.as_str(), deflated)
            .with_context(|| format!("start part: {name}"))?;
        writer
            .write_all(filled.as_bytes())
            .with_context(|| format!("write part: {name}"))?;
    }

    writer.finish().context("finish docx archive")?;
    Ok(())
}

fn is_fillable_part(name: &str) -> bool {
    name == "word/document.xml"
        || ((name.starts_with("word/header") || name.starts_with("word/footer"))
            && name.ends_with(".xml"))
}

/// Substitutes placeholders paragraph by paragraph.
///
/// Word splits text into runs freely, so a `{field}` can span several
/// `<w:t>` nodes. The visible text of each paragraph is reassembled,
/// substituted, and written back into its first text node; the other text
/// nodes are emptied. Paragraphs without a substitution are left untouched.
pub fn fill_xml(xml: &str, fields: &TemplateFields) -> String {
    let mut out = String::with_capacity(xml.len());
    let mut cursor = 0;

    while let Some(close_rel) = xml[cursor..].find("</w:p>") {
        let close = cursor + close_rel;
        let Some(open) = last_tag_start(&xml[cursor..close], "w:p").map(|i| cursor + i) else {
            out.push_str(&xml[cursor..close + "</w:p>".len()]);
            cursor = close + "</w:p>".len();
            continue;
        };

        out.push_str(&xml[cursor..open]);
        let paragraph = &xml[open..close];
        match fill_paragraph(paragraph, fields) {
            Some(filled) => out.push_str(&filled),
            None => out.push_str(paragraph),
        }
        out.push_str("</w:p>");
        cursor = close + "</w:p>".len();
    }

    out.push_str(&xml[cursor..]);
    out
}

struct TextNode {
    open_start: usize,
    content_start: usize,
    content_end: usize,
}

fn fill_paragraph(paragraph: &str, fields: &TemplateFields) -> Option<String> {
    let nodes = text_nodes(paragraph);
    let text = nodes
        .iter()
        .map(|n| xml_unescape(&paragraph[n.content_start..n.content_end]))
        .collect::<String>();
    if !text.contains('{') {
        return None;
    }
    let filled = substitute(&text, fields);
    if filled == text {
        return None;
    }

    let mut out = String::with_capacity(paragraph.len() + filled.len());
    let mut cursor = 0;
    for (i, node) in nodes.iter().enumerate() {
        if i == 0 {
            out.push_str(&paragraph[cursor..node.open_start]);
            out.push_str("<w:t xml:space=\"preserve\">");
            let lines = filled.split('\n').map(xml_escape).collect::<Vec<_>>();
            out.push_str(&lines.join("</w:t><w:br/><w:t xml:space=\"preserve\">"));
        } else {
            out.push_str(&paragraph[cursor..node.content_start]);
        }
        cursor = node.content_end;
    }
    out.push_str(&paragraph[cursor..]);
    Some(out)
}

/// `<w:t>` / `<w:t ...>` elements with content; `<w:tab/>`, `<w:tbl>` and
/// friends are not text nodes.
fn text_nodes(paragraph: &str) -> Vec<TextNode> {
    let mut nodes = Vec::new();
    let mut cursor = 0;
    while let Some(rel) = find_tag_start(&paragraph[cursor..], "w:t") {
        let open_start = cursor + rel;
        let Some(open_len) = paragraph[open_start..].find('>') else {
            break;
        };
        let content_start = open_start + open_len + 1;
        if paragraph[..content_start].ends_with("/>") {
            cursor = content_start;
            continue;
        }
        let Some(close_rel) = paragraph[content_start..].find("</w:t>") else {
            break;
        };
        let content_end = content_start + close_rel;
        nodes.push(TextNode {
            open_start,
            content_start,
            content_end,
        });
        cursor = content_end + "</w:t>".len();
    }
    nodes
}

fn is_tag_start(haystack: &str, at: usize, tag: &str) -> bool {
    let after = &haystack[at + 1 + tag.len()..];
    after.starts_with('>') || after.starts_with(' ') || after.starts_with('/')
}

fn find_tag_start(haystack: &str, tag: &str) -> Option<usize> {
    let needle = format!("<{tag}");
    haystack
        .match_indices(&needle)
        .map(|(i, _)| i)
        .find(|&i| is_tag_start(haystack, i, tag))
}

fn last_tag_start(haystack: &str, tag: &str) -> Option<usize> {
    let needle = format!("<{tag}");
    haystack
        .rmatch_indices(&needle)
        .map(|(i, _)| i)
        .find(|&i| is_tag_start(haystack, i, tag))
}

/// Replaces every `{name}` with a known field; unknown placeholders stay.
pub fn substitute(text: &str, fields: &TemplateFields) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if fields.contains_key(&after[..close]) => {
                out.push_str(&fields[&after[..close]]);
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_unescape(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// A minimal `.docx` with one table row per field of `kind`.
pub fn builtin_template(kind: DocumentKind) -> anyhow::Result<Vec<u8>> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let parts = [
        ("[Content_Types].xml", CONTENT_TYPES_XML.to_owned()),
        ("_rels/.rels", PACKAGE_RELS_XML.to_owned()),
        ("word/document.xml", builtin_document_xml(kind)),
    ];
    for (name, body) in parts {
        zip.start_file(name, options)
            .with_context(|| format!("builtin template start_file: {name}"))?;
        zip.write_all(body.as_bytes())
            .with_context(|| format!("builtin template write: {name}"))?;
    }

    let cursor = zip.finish().context("builtin template finish zip")?;
    Ok(cursor.into_inner())
}

const CONTENT_TYPES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
  <Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
  <Default Extension="xml" ContentType="application/xml"/>
  <Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/>
</Types>
"#;

const PACKAGE_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/>
</Relationships>
"#;

fn builtin_document_xml(kind: DocumentKind) -> String {
    let cell = |text: &str, bold: bool| {
        let props = if bold { "<w:rPr><w:b/></w:rPr>" } else { "" };
        format!(
            "<w:tc><w:tcPr><w:tcW w:w=\"0\" w:type=\"auto\"/></w:tcPr><w:p><w:r>{props}<w:t xml:space=\"preserve\">{}</w:t></w:r></w:p></w:tc>",
            xml_escape(text)
        )
    };
    let rows = kind
        .rows()
        .iter()
        .map(|(label, field)| {
            format!(
                "<w:tr>{}{}</w:tr>",
                cell(label, true),
                cell(&format!("{{{field}}}"), false)
            )
        })
        .collect::<String>();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body><w:p><w:pPr><w:pStyle w:val="Title"/></w:pPr><w:r><w:t>{title}</w:t></w:r></w:p><w:tbl><w:tblPr><w:tblBorders><w:top w:val="single" w:sz="4"/><w:left w:val="single" w:sz="4"/><w:bottom w:val="single" w:sz="4"/><w:right w:val="single" w:sz="4"/><w:insideH w:val="single" w:sz="4"/><w:insideV w:val="single" w:sz="4"/></w:tblBorders><w:tblW w:w="5000" w:type="pct"/></w:tblPr><w:tblGrid><w:gridCol/><w:gridCol/></w:tblGrid>{rows}</w:tbl><w:sectPr/></w:body></w:document>
"#,
        title = kind.title(),
    )
}

/// `<prefix><label>_<YYYYmmdd_HHMMSS>.docx`.
pub fn document_file_name(kind: DocumentKind, label: &str, now: DateTime<Local>) -> String {
    let name = label
        .trim()
        .chars()
        .map(|c| match c {
            c if c.is_whitespace() => '_',
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect::<String>();
    format!(
        "{}{name}_{}.docx",
        kind.file_prefix(),
        now.format("%Y%m%d_%H%M%S")
    )
}

/// Whether `name` could have been produced by [`document_file_name`] and is
/// safe to join onto the output directory.
pub fn is_generated_file_name(name: &str) -> bool {
    DocumentKind::ALL
        .iter()
        .any(|kind| name.starts_with(kind.file_prefix()))
        && name.ends_with(".docx")
        && !name.contains(['/', '\\'])
        && !name.contains("..")
}

/// Fills a template and writes the result into `out_dir`.
#[derive(Debug, Clone)]
pub struct DocumentRenderer {
    template: Option<PathBuf>,
    evaluation_template: Option<PathBuf>,
    out_dir: PathBuf,
}

impl DocumentRenderer {
    pub fn new(template: Option<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            template,
            evaluation_template: None,
            out_dir: out_dir.into(),
        }
    }

    pub fn with_evaluation_template(mut self, template: Option<PathBuf>) -> Self {
        self.evaluation_template = template;
        self
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Renders the unit plan of one unit; returns the path of the written document.
    pub fn render(
        &self,
        unit: &Unit,
        subject: &Subject,
        grade: &str,
        teacher: &str,
    ) -> anyhow::Result<PathBuf> {
        let fields = template_fields(unit, subject, grade, teacher);
        let path = self.render_fields(DocumentKind::UnitPlan, &fields, &subject.nom)?;
        tracing::debug!(subject = %subject.id, unit = %unit.titre_unite, "unit plan rendered");
        Ok(path)
    }

    /// Fills the template of `kind` and persists it under a fresh name built
    /// from `label`.
    pub fn render_fields(
        &self,
        kind: DocumentKind,
        fields: &TemplateFields,
        label: &str,
    ) -> anyhow::Result<PathBuf> {
        let custom = match kind {
            DocumentKind::UnitPlan => &self.template,
            DocumentKind::Evaluation => &self.evaluation_template,
        };
        let template = match custom {
            Some(path) => std::fs::read(path)
                .with_context(|| format!("read template: {}", path.display()))?,
            None => builtin_template(kind).context("build builtin template")?,
        };

        std::fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("create output dir: {}", self.out_dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.out_dir)
            .with_context(|| format!("create temp file in: {}", self.out_dir.display()))?;
        fill_docx(Cursor::new(template), tmp.as_file_mut(), fields).context("fill template")?;

        let out_path = self.available_path(&document_file_name(kind, label, Local::now()));
        tmp.persist_noclobber(&out_path)
            .map_err(|err| err.error)
            .with_context(|| format!("persist document: {}", out_path.display()))?;

        tracing::info!(kind = ?kind, path = %out_path.display(), "document rendered");
        Ok(out_path)
    }

    /// Appends `_2`, `_3`, ... when two documents land in the same second.
    fn available_path(&self, file_name: &str) -> PathBuf {
        let candidate = self.out_dir.join(file_name);
        if !candidate.exists() {
            return candidate;
        }
        let stem = file_name.trim_end_matches(".docx");
        (2..)
            .map(|n| self.out_dir.join(format!("{stem}_{n}.docx")))
            .find(|path| !path.exists())
            .unwrap_or(candidate)
    }
}

pub fn run(args: RenderArgs, catalog: &Catalog) -> anyhow::Result<()> {
    let units_path = PathBuf::from(&args.units);
    let raw = std::fs::read_to_string(&units_path)
        .with_context(|| format!("read units: {}", units_path.display()))?;
    let units = parse_units_document(&raw)
        .with_context(|| format!("parse units: {}", units_path.display()))?;

    let subject = catalog
        .subject(&args.subject)
        .with_context(|| format!("unknown subject: {}", args.subject))?;

    let selected = match args.index {
        Some(index) => {
            let unit = units.get(index).with_context(|| {
                format!("unit index {index} out of range ({} units)", units.len())
            })?;
            vec![unit]
        }
        None => units.iter().collect(),
    };
    if selected.is_empty() {
        anyhow::bail!("no units in {}", units_path.display());
    }

    let renderer = DocumentRenderer::new(args.template, args.out_dir);
    for unit in selected {
        let path = renderer.render(unit, subject, &args.grade, &args.teacher)?;
        println!("{}", path.display());
    }
    Ok(())
}
