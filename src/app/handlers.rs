use std::collections::BTreeMap;

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, header};
use axum::response::Response;
use tokio_util::io::ReaderStream;

use super::AppState;
use super::error::ApiError;
use super::model::{
    GenerateDocumentRequest, GenerateDocumentResponse, GenerateEvaluationRequest,
    GenerateEvaluationResponse, GenerateUnitsRequest, GenerateUnitsResponse, SaveUnitsRequest,
    SaveUnitsResponse, SessionsQuery, SessionsResponse, SubjectSummary, present,
};
use crate::catalog::Subject;
use crate::eval::{self, DEFAULT_CRITERION, EvaluationRequest};
use crate::render::{DocumentKind, is_generated_file_name};
use crate::store::{self, SessionRecord, UnitQuery, UnitRecord, first_attempt};
use crate::synth::{SynthesisRequest, synthesize};

const DOCX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const DEFAULT_SESSION_LIMIT: usize = 10;
const MAX_SESSION_LIMIT: usize = 500;

pub async fn list_subjects(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, SubjectSummary>> {
    let subjects = state
        .catalog
        .subjects()
        .iter()
        .map(|s| (s.id.clone(), SubjectSummary { nom: s.nom.clone() }))
        .collect();
    Json(subjects)
}

pub async fn get_subject(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Result<Json<Subject>, ApiError> {
    state
        .catalog
        .subject(&subject_id)
        .cloned()
        .map(Json)
        .ok_or_else(ApiError::unknown_subject)
}

pub async fn generate_units(
    State(state): State<AppState>,
    payload: Result<Json<GenerateUnitsRequest>, JsonRejection>,
) -> Result<Json<GenerateUnitsResponse>, ApiError> {
    let Json(req) = payload?;
    let (Some(subject_id), Some(grade), Some(chapters)) = (
        present(req.matiere),
        present(req.annee_pei),
        req.chapitres.filter(|c| !c.is_empty()),
    ) else {
        return Err(ApiError::missing_data());
    };

    let catalog = state.catalog.as_ref();
    let subject = catalog
        .subject(&subject_id)
        .ok_or_else(ApiError::unknown_subject)?;
    let unit_count = req.nb_unites.unwrap_or(subject.nb_unites);
    let attempt = req.essai.unwrap_or_else(first_attempt);
    let request = SynthesisRequest::new(catalog, subject, &grade, chapters, unit_count)
        .map_err(|err| ApiError::bad_request(format!("{err:#}")))?
        .with_teacher(req.enseignant.trim());

    tracing::info!(
        subject = %subject.id,
        grade = %request.grade(),
        chapters = request.chapters().len(),
        units = unit_count,
        essai = attempt,
        "generate units"
    );
    let units = synthesize(&request, state.generator.as_deref()).await;

    let session_id = store::record_synthesis(
        state.store.as_ref(),
        request.teacher(),
        &subject.id,
        request.grade(),
        attempt,
        request.chapters().to_vec(),
        &units,
    )
    .await;

    Ok(Json(GenerateUnitsResponse {
        units,
        essai: attempt,
        session_id,
    }))
}

pub async fn generate_document(
    State(state): State<AppState>,
    payload: Result<Json<GenerateDocumentRequest>, JsonRejection>,
) -> Result<Json<GenerateDocumentResponse>, ApiError> {
    let Json(req) = payload?;
    let (Some(unit), Some(subject_id), Some(grade)) =
        (req.unite, present(req.matiere), present(req.annee_pei))
    else {
        return Err(ApiError::missing_data());
    };

    let subject = state
        .catalog
        .subject(&subject_id)
        .cloned()
        .ok_or_else(ApiError::unknown_subject)?;
    let teacher = req.enseignant.trim().to_owned();

    let renderer = state.renderer.clone();
    let path =
        tokio::task::spawn_blocking(move || renderer.render(&unit, &subject, &grade, &teacher))
            .await
            .map_err(ApiError::internal)?
            .map_err(|err| ApiError::internal(format!("{err:#}")))?;

    let (filename, download_url) = download_link(&path)?;
    Ok(Json(GenerateDocumentResponse {
        filename,
        download_url,
    }))
}

pub async fn generate_evaluation(
    State(state): State<AppState>,
    payload: Result<Json<GenerateEvaluationRequest>, JsonRejection>,
) -> Result<Json<GenerateEvaluationResponse>, ApiError> {
    let Json(req) = payload?;
    let (Some(unit), Some(subject_id), Some(grade)) =
        (req.unite, present(req.matiere), present(req.annee_pei))
    else {
        return Err(ApiError::missing_data());
    };
    let letters = match req.criteres {
        None => vec![DEFAULT_CRITERION.to_owned()],
        Some(letters) if letters.is_empty() => {
            return Err(ApiError::bad_request("Au moins un critère doit être fourni"));
        }
        Some(letters) => letters,
    };

    let subject = state
        .catalog
        .subject(&subject_id)
        .ok_or_else(ApiError::unknown_subject)?;
    let request = EvaluationRequest::new(&state.descriptors, subject, &grade, &letters, unit)
        .map_err(|err| ApiError::bad_request(format!("{err:#}")))?;

    tracing::info!(
        subject = %subject.id,
        grade = %request.grade(),
        criteria = %request.letters().join(","),
        "generate evaluation"
    );
    let exercises = eval::generate_exercises(&request, state.generator.as_deref()).await;
    let fields = eval::evaluation_fields(&request, &exercises);
    let label = request.file_label();

    let renderer = state.renderer.clone();
    let path = tokio::task::spawn_blocking(move || {
        renderer.render_fields(DocumentKind::Evaluation, &fields, &label)
    })
    .await
    .map_err(ApiError::internal)?
    .map_err(|err| ApiError::internal(format!("{err:#}")))?;

    let (filename, download_url) = download_link(&path)?;
    Ok(Json(GenerateEvaluationResponse {
        filename,
        download_url,
        criteres: request.letters(),
        exercices: exercises,
    }))
}

/// File name of a rendered document and its `/download/...` URL.
fn download_link(path: &std::path::Path) -> Result<(String, String), ApiError> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ApiError::internal("document path has no file name"))?
        .to_owned();
    let url = format!("/download/{}", percent_encode(&filename));
    Ok((filename, url))
}

pub async fn download_document(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if !is_generated_file_name(&filename) {
        return Err(ApiError::bad_request("Nom de fichier invalide"));
    }

    let path = state.renderer.out_dir().join(&filename);
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("Fichier non trouvé"))?;
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let mut resp = Response::new(body);
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(DOCX_CONTENT_TYPE));
    resp.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&filename)).map_err(ApiError::internal)?,
    );
    Ok(resp)
}

pub async fn save_units(
    State(state): State<AppState>,
    payload: Result<Json<SaveUnitsRequest>, JsonRejection>,
) -> Result<Json<SaveUnitsResponse>, ApiError> {
    let Json(req) = payload?;
    let (Some(teacher), Some(subject_id), Some(grade)) = (
        present(Some(req.enseignant)),
        present(req.matiere),
        present(req.annee_pei),
    ) else {
        return Err(ApiError::missing_data());
    };
    if req.units.is_empty() {
        return Err(ApiError::missing_data());
    }
    if state.catalog.subject(&subject_id).is_none() {
        return Err(ApiError::unknown_subject());
    }

    let session_id = store::record_synthesis(
        state.store.as_ref(),
        &teacher,
        &subject_id,
        &grade,
        req.essai.unwrap_or_else(first_attempt),
        Vec::new(),
        &req.units,
    )
    .await
    .ok_or_else(|| ApiError::internal("Échec de l'enregistrement"))?;

    Ok(Json(SaveUnitsResponse { session_id }))
}

pub async fn list_units(
    State(state): State<AppState>,
    query: Result<Query<UnitQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(mut query) = query?;
    query.enseignant = query.enseignant.trim().to_owned();
    if query.enseignant.is_empty() {
        return Err(ApiError::missing_data());
    }
    query.matiere = present(query.matiere);
    query.annee_pei = present(query.annee_pei);

    let units: Vec<UnitRecord> = state
        .store
        .units_by_teacher(&query)
        .await
        .unwrap_or_else(|err| {
            tracing::error!(error = %format!("{err:#}"), "list units failed");
            Vec::new()
        });
    Ok(Json(serde_json::json!({ "units": units })))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    query: Result<Query<SessionsQuery>, QueryRejection>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let Query(query) = query?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SESSION_LIMIT)
        .min(MAX_SESSION_LIMIT);

    let sessions = state.store.recent_sessions(limit).await.unwrap_or_else(|err| {
        tracing::error!(error = %format!("{err:#}"), "list sessions failed");
        Vec::new()
    });
    Ok(Json(SessionsResponse { sessions }))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    let session = state.store.session(session_id.trim()).await.unwrap_or_else(|err| {
        tracing::error!(error = %format!("{err:#}"), "read session failed");
        None
    });
    session
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Session non trouvée"))
}

/// ASCII fallback name plus an RFC 5987 `filename*` for accented names.
fn content_disposition(filename: &str) -> String {
    let ascii = filename
        .chars()
        .map(|c| if c.is_ascii_graphic() && c != '"' { c } else { '_' })
        .collect::<String>();
    format!(
        "attachment; filename=\"{ascii}\"; filename*=UTF-8''{}",
        percent_encode(filename)
    )
}

fn percent_encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}
