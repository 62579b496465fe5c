//! HTTP request surface served by `unitplan-app`.

pub mod error;
pub mod handlers;
pub mod model;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::catalog::Catalog;
use crate::descriptors::DescriptorCatalog;
use crate::render::DocumentRenderer;
use crate::store::SessionStore;
use crate::synth::UnitGenerator;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub descriptors: Arc<DescriptorCatalog>,
    pub store: Arc<dyn SessionStore>,
    /// `None` when no generative service is configured.
    pub generator: Option<Arc<dyn UnitGenerator>>,
    pub renderer: Arc<DocumentRenderer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok\n" }))
        .route("/api/matieres", get(handlers::list_subjects))
        .route("/api/matiere/:id", get(handlers::get_subject))
        .route("/api/generate-units", post(handlers::generate_units))
        .route("/api/generate-document", post(handlers::generate_document))
        .route("/api/generate-eval", post(handlers::generate_evaluation))
        .route("/download/:filename", get(handlers::download_document))
        .route("/api/save-units", post(handlers::save_units))
        .route("/api/units", get(handlers::list_units))
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/sessions/:id", get(handlers::get_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use tower::ServiceExt as _;

    use super::*;
    use crate::store::LocalFsSessionStore;

    struct Harness {
        _dir: tempfile::TempDir,
        app: Router,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = AppState {
            catalog: Arc::new(Catalog::builtin().expect("builtin catalog")),
            descriptors: Arc::new(DescriptorCatalog::builtin().expect("builtin descriptors")),
            store: Arc::new(LocalFsSessionStore::new(dir.path().join("data"))),
            generator: None,
            renderer: Arc::new(DocumentRenderer::new(None, dir.path().join("generated"))),
        };
        Harness {
            app: router(state),
            _dir: dir,
        }
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, body.to_vec())
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request");
        let (status, body) = call(app, request).await;
        (status, serde_json::from_slice(&body).expect("json body"))
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        let (status, body) = call(app, request).await;
        (status, serde_json::from_slice(&body).expect("json body"))
    }

    fn chapters(n: usize) -> Value {
        (1..=n)
            .map(|i| json!({"id": i, "titre": format!("Chapitre {i}"), "duree": 3}))
            .collect()
    }

    #[tokio::test]
    async fn subjects_are_listed_and_looked_up() {
        let h = harness();
        let (status, body) = get_json(&h.app, "/api/matieres").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["design"]["nom"], "Design");
        assert_eq!(body.as_object().map(|o| o.len()), Some(7));

        let (status, body) = get_json(&h.app, "/api/matiere/sciences").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nom"], "Sciences");

        let (status, body) = get_json(&h.app, "/api/matiere/histoire").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Matière non trouvée");
    }

    #[tokio::test]
    async fn generate_units_rejects_incomplete_requests() {
        let h = harness();

        let (status, body) = post_json(
            &h.app,
            "/api/generate-units",
            json!({"matiere": "design", "annee_pei": "pei1", "chapitres": []}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Données manquantes");

        let (status, body) = post_json(
            &h.app,
            "/api/generate-units",
            json!({"matiere": "histoire", "annee_pei": "pei1", "chapitres": chapters(2)}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Matière non trouvée");

        let (status, _) = post_json(
            &h.app,
            "/api/generate-units",
            json!({"matiere": "design", "annee_pei": "pei7", "chapitres": chapters(2)}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn generated_units_are_recorded_and_listed() {
        let h = harness();
        let (status, body) = post_json(
            &h.app,
            "/api/generate-units",
            json!({
                "matiere": "langue_litterature",
                "annee_pei": "PEI 2",
                "enseignant": "Mme Roux",
                "chapitres": chapters(8)
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let units = body["units"].as_array().expect("units");
        assert_eq!(units.len(), 6);
        assert_eq!(units[5]["chapitres_inclus"], json!([6, 7, 8]));
        assert_eq!(units[0]["duree"], json!(3));
        let session_id = body["session_id"].as_str().expect("session id").to_owned();

        let (status, body) = get_json(&h.app, &format!("/api/sessions/{session_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enseignant"], "Mme Roux");
        assert_eq!(body["chapitres"].as_array().map(Vec::len), Some(8));

        let (_, body) = get_json(
            &h.app,
            "/api/units?enseignant=Mme%20Roux&matiere=langue_litterature",
        )
        .await;
        assert_eq!(body["units"].as_array().map(Vec::len), Some(6));
        assert_eq!(body["units"][0]["essai"], json!(1));

        let (_, body) = get_json(&h.app, "/api/sessions?limit=5").await;
        assert_eq!(body["sessions"].as_array().map(Vec::len), Some(1));

        let (status, _) = get_json(&h.app, "/api/sessions/not-a-session").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn explicit_unit_count_overrides_catalog_default() {
        let h = harness();
        let (status, body) = post_json(
            &h.app,
            "/api/generate-units",
            json!({"matiere": "arts", "annee_pei": 5, "chapitres": chapters(3), "nb_unites": 2}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["units"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn unit_count_above_the_limit_is_rejected() {
        let h = harness();
        for count in [crate::synth::MAX_UNITS + 1, 20000] {
            let (status, body) = post_json(
                &h.app,
                "/api/generate-units",
                json!({
                    "matiere": "design",
                    "annee_pei": "pei1",
                    "chapitres": chapters(1),
                    "nb_unites": count
                }),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            let error = body["error"].as_str().expect("error message");
            assert!(error.contains("<= 12"), "{error}");
        }

        let (_, body) = get_json(&h.app, "/api/sessions").await;
        assert_eq!(body["sessions"], json!([]));
    }

    #[tokio::test]
    async fn attempts_are_echoed_recorded_and_filtered() {
        let h = harness();
        for essai in [1, 2] {
            let (status, body) = post_json(
                &h.app,
                "/api/generate-units",
                json!({
                    "matiere": "sciences",
                    "annee_pei": "pei4",
                    "enseignant": "M. Fall",
                    "chapitres": chapters(2),
                    "nb_unites": 1,
                    "essai": essai
                }),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["essai"], json!(essai));
        }

        let (_, body) = get_json(&h.app, "/api/units?enseignant=M.%20Fall&essai=2").await;
        let units = body["units"].as_array().expect("units");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0]["essai"], json!(2));

        let (_, body) = get_json(&h.app, "/api/units?enseignant=M.%20Fall").await;
        assert_eq!(body["units"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn evaluation_is_generated_and_downloadable() {
        let h = harness();
        let (status, body) = post_json(
            &h.app,
            "/api/generate-eval",
            json!({
                "unite": {
                    "titre_unite": "Emballages",
                    "enonce_recherche": "La forme suit la fonction."
                },
                "matiere": "design",
                "annee_pei": "PEI 2",
                "criteres": ["a", "D"]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["criteres"], json!(["A", "D"]));
        let exercises = body["exercices"].as_array().expect("exercises");
        assert_eq!(exercises.len(), 5);
        assert_eq!(exercises[0]["titre"], "Évaluation A.i");
        assert_eq!(exercises[0]["type"], "question_ouverte");
        assert_eq!(exercises[4]["titre"], "Évaluation D.i");

        let filename = body["filename"].as_str().expect("filename");
        assert!(filename.starts_with("Evaluation_PEI_Design_Criteres_A_D_"), "{filename}");
        let url = body["download_url"].as_str().expect("download url");
        let request = Request::builder().uri(url).body(Body::empty()).expect("request");
        let (status, bytes) = call(&h.app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(bytes.starts_with(b"PK"));
    }

    #[tokio::test]
    async fn evaluation_defaults_to_criterion_d() {
        let h = harness();
        let (status, body) = post_json(
            &h.app,
            "/api/generate-eval",
            json!({"unite": {"titre_unite": "Lumière"}, "matiere": "sciences", "annee_pei": 5}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["criteres"], json!(["D"]));
        assert!(
            body["exercices"]
                .as_array()
                .is_some_and(|e| !e.is_empty() && e.iter().all(|x| x["critere_ref"] == "D"))
        );
    }

    #[tokio::test]
    async fn evaluation_rejects_bad_requests() {
        let h = harness();
        let unit = json!({"titre_unite": "Lumière"});

        let (status, body) = post_json(
            &h.app,
            "/api/generate-eval",
            json!({"matiere": "sciences", "annee_pei": "pei3", "criteres": ["A"]}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Données manquantes");

        for criteres in [json!([]), json!(""), json!([" "])] {
            let (status, body) = post_json(
                &h.app,
                "/api/generate-eval",
                json!({
                    "unite": unit,
                    "matiere": "sciences",
                    "annee_pei": "pei3",
                    "criteres": criteres
                }),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], "Au moins un critère doit être fourni");
        }

        let (status, body) = post_json(
            &h.app,
            "/api/generate-eval",
            json!({"unite": unit, "matiere": "histoire", "annee_pei": "pei3"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Matière non trouvée");

        let (status, body) = post_json(
            &h.app,
            "/api/generate-eval",
            json!({"unite": unit, "matiere": "sciences", "annee_pei": "pei3", "criteres": "A,E"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error = body["error"].as_str().expect("error message");
        assert!(error.contains("criterion E not found"), "{error}");

        let (status, _) = post_json(
            &h.app,
            "/api/generate-eval",
            json!({"unite": unit, "matiere": "sciences", "annee_pei": "pei9"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn document_is_generated_and_downloadable() {
        let h = harness();
        let (status, body) = post_json(
            &h.app,
            "/api/generate-document",
            json!({
                "unite": {"titre_unite": "Couleurs", "objectifs_specifiques": "A.i, B.i"},
                "matiere": "arts",
                "annee_pei": "pei3",
                "enseignant": "M. Sow"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let filename = body["filename"].as_str().expect("filename");
        assert!(filename.starts_with("Unite_PEI_Arts_"));
        let url = body["download_url"].as_str().expect("download url");
        assert_eq!(url, format!("/download/{filename}"));

        let request = Request::builder().uri(url).body(Body::empty()).expect("request");
        let response = h.app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert!(bytes.starts_with(b"PK"));
    }

    #[tokio::test]
    async fn downloads_reject_foreign_and_missing_files() {
        let h = harness();
        let request = Request::builder()
            .uri("/download/..%2F..%2Fetc%2Fpasswd")
            .body(Body::empty())
            .expect("request");
        let (status, _) = call(&h.app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) =
            get_json(&h.app, "/download/Unite_PEI_Arts_20240101_000000.docx").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Fichier non trouvé");
    }

    #[tokio::test]
    async fn save_units_requires_units_and_stores_a_session() {
        let h = harness();
        let (status, _) = post_json(
            &h.app,
            "/api/save-units",
            json!({"enseignant": "A", "matiere": "design", "annee_pei": "pei1", "units": []}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post_json(
            &h.app,
            "/api/save-units",
            json!({
                "enseignant": "A",
                "matiere": "design",
                "annee_pei": "pei1",
                "units": [{"titre_unite": "Emballages"}]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let session_id = body["session_id"].as_str().expect("session id");

        let (_, body) = get_json(&h.app, &format!("/api/sessions/{session_id}")).await;
        assert_eq!(body["units"][0]["titre_unite"], "Emballages");
        assert_eq!(body["chapitres"], json!([]));
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let h = harness();
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .expect("request");
        let (status, body) = call(&h.app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok\n");
    }
}
