use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Chapter identifier as supplied by the teacher: a JSON number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChapterId {
    Number(serde_json::Number),
    Text(String),
}

impl From<usize> for ChapterId {
    fn from(index: usize) -> Self {
        Self::Number(serde_json::Number::from(index))
    }
}

impl From<&str> for ChapterId {
    fn from(id: &str) -> Self {
        Self::Text(id.to_owned())
    }
}

impl fmt::Display for ChapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ChapterId>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub titre: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub contenu: String,
    #[serde(
        default,
        deserialize_with = "hours::deserialize",
        serialize_with = "hours::serialize"
    )]
    pub duree: f64,
}

/// A synthesized teaching unit.
///
/// Generated units are accepted as-is, so every field defaults when absent and
/// list fields tolerate the loose shapes language models tend to produce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Unit {
    #[serde(deserialize_with = "lenient_text")]
    pub titre_unite: String,
    #[serde(deserialize_with = "chapter_ids")]
    pub chapitres_inclus: Vec<ChapterId>,
    #[serde(
        deserialize_with = "hours::deserialize",
        serialize_with = "hours::serialize"
    )]
    pub duree: f64,
    #[serde(deserialize_with = "lenient_text")]
    pub concept_cle: String,
    #[serde(deserialize_with = "token_list")]
    pub concepts_connexes: Vec<String>,
    #[serde(deserialize_with = "lenient_text")]
    pub contexte_mondial: String,
    #[serde(deserialize_with = "lenient_text")]
    pub enonce_recherche: String,
    #[serde(deserialize_with = "text_list")]
    pub questions_factuelles: Vec<String>,
    #[serde(deserialize_with = "text_list")]
    pub questions_conceptuelles: Vec<String>,
    #[serde(deserialize_with = "text_list")]
    pub questions_debat: Vec<String>,
    /// Objective tokens such as `A.i`.
    #[serde(deserialize_with = "token_list")]
    pub objectifs_specifiques: Vec<String>,
}

/// Reads a `{"units": [...]}` document (or a bare list) written by `synthesize`.
pub fn parse_units_document(raw: &str) -> anyhow::Result<Vec<Unit>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum UnitsDocument {
        Wrapped { units: Vec<Unit> },
        Bare(Vec<Unit>),
    }

    let doc: UnitsDocument = serde_json::from_str(raw)?;
    Ok(match doc {
        UnitsDocument::Wrapped { units } | UnitsDocument::Bare(units) => units,
    })
}

/// Reads a chapter list, either bare or wrapped as `{"chapitres": [...]}`.
pub fn parse_chapters_document(raw: &str) -> anyhow::Result<Vec<Chapter>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ChaptersDocument {
        Wrapped { chapitres: Vec<Chapter> },
        Bare(Vec<Chapter>),
    }

    let doc: ChaptersDocument = serde_json::from_str(raw)?;
    Ok(match doc {
        ChaptersDocument::Wrapped { chapitres } | ChaptersDocument::Bare(chapitres) => chapitres,
    })
}

/// Hours are numbers, numeric strings, or nothing at all (0).
pub mod hours {
    use super::*;
    use serde::Serializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value.as_ref().map_or(0.0, from_value))
    }

    pub fn serialize<S: Serializer>(hours: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        let hours = round(*hours);
        if is_whole(hours) {
            serializer.serialize_i64(hours as i64)
        } else {
            serializer.serialize_f64(hours)
        }
    }

    pub fn from_value(value: &Value) -> f64 {
        let hours = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        hours.filter(|h| h.is_finite()).unwrap_or(0.0)
    }

    /// Two decimals at most: sums of fractional durations carry float noise.
    pub fn round(hours: f64) -> f64 {
        if hours.is_finite() && hours.abs() < 9.0e13 {
            (hours * 100.0).round() / 100.0
        } else {
            hours
        }
    }

    /// `12` rather than `12.0`; fractional hours keep up to two decimals.
    pub fn format(hours: f64) -> String {
        let hours = round(hours);
        if is_whole(hours) {
            format!("{}", hours as i64)
        } else {
            format!("{hours}")
        }
    }

    fn is_whole(hours: f64) -> bool {
        hours.is_finite() && hours.fract() == 0.0 && hours.abs() < 9.0e15
    }
}

pub(crate) fn lenient_text<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<String, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

fn chapter_ids<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<ChapterId>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    let id = |value: Value| match value {
        Value::Number(n) => Some(ChapterId::Number(n)),
        Value::String(s) if !s.trim().is_empty() => Some(ChapterId::Text(s.trim().to_owned())),
        Value::String(_) | Value::Null => None,
        other => Some(ChapterId::Text(other.to_string())),
    };

    Ok(match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.into_iter().filter_map(id).collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(ChapterId::from)
            .collect(),
        Some(other) => id(other).into_iter().collect(),
    })
}

/// A list of short tokens, or one comma-joined string (`"A.i, A.ii"`).
fn token_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_owned)
            .collect(),
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_owned()).filter(|s| !s.is_empty()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        _ => Vec::new(),
    })
}

/// A list of sentences, or a single sentence.
fn text_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if s.trim().is_empty() => Vec::new(),
        Some(Value::String(s)) => vec![s],
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        _ => Vec::new(),
    })
}
