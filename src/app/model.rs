use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::eval::Exercise;
use crate::formats::{Chapter, Unit};
use crate::store::{SessionRecord, first_attempt};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GenerateUnitsRequest {
    pub matiere: Option<String>,
    #[serde(deserialize_with = "grade")]
    pub annee_pei: Option<String>,
    pub enseignant: String,
    pub chapitres: Option<Vec<Chapter>>,
    pub nb_unites: Option<usize>,
    pub essai: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateUnitsResponse {
    pub units: Vec<Unit>,
    #[serde(default = "first_attempt")]
    pub essai: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GenerateDocumentRequest {
    pub unite: Option<Unit>,
    pub matiere: Option<String>,
    #[serde(deserialize_with = "grade")]
    pub annee_pei: Option<String>,
    pub enseignant: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateDocumentResponse {
    pub filename: String,
    pub download_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SaveUnitsRequest {
    pub enseignant: String,
    pub matiere: Option<String>,
    #[serde(deserialize_with = "grade")]
    pub annee_pei: Option<String>,
    pub essai: Option<u32>,
    pub units: Vec<Unit>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GenerateEvaluationRequest {
    pub unite: Option<Unit>,
    pub matiere: Option<String>,
    #[serde(deserialize_with = "grade")]
    pub annee_pei: Option<String>,
    /// Absent means the default criterion; present but empty is an error.
    #[serde(deserialize_with = "letters")]
    pub criteres: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateEvaluationResponse {
    pub filename: String,
    pub download_url: String,
    pub criteres: Vec<String>,
    pub exercices: Vec<Exercise>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveUnitsResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectSummary {
    pub nom: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionRecord>,
}

/// Grade bands arrive as `"pei3"`, `"PEI 3"` or a bare `3`; blank means absent.
fn grade<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s.trim().to_owned()).filter(|s| !s.is_empty()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Criterion letters as a list or one comma-joined string; blanks dropped.
fn letters<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<String>>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    let items = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.split(',').map(str::to_owned).collect::<Vec<_>>(),
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Some(other) => vec![other.to_string()],
    };
    Ok(Some(
        items
            .into_iter()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect(),
    ))
}

/// Trimmed, non-empty text.
pub fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
