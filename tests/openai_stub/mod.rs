use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct OpenAiStubConfig {
    pub expected_api_key: String,
    pub behavior: StubBehavior,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum StubBehavior {
    /// One unit per requested slot, wrapped in a ```json fence; evaluation
    /// prompts get two exercises instead.
    FencedUnits,
    /// HTTP 500 with an OpenAI-style error body.
    ServerError,
    /// A 200 answer that is not JSON.
    Prose,
}

pub struct OpenAiStub {
    pub base_url: String,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OpenAiStub {
    pub fn spawn(config: OpenAiStubConfig) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start openai stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v1");

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let path = request.url().to_string();
                if request.method() != &tiny_http::Method::Post || path != "/v1/responses" {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }

                let expected_auth = format!("Bearer {}", config.expected_api_key);
                let authorized = request
                    .headers()
                    .iter()
                    .any(|h| h.field.equiv("Authorization") && h.value.as_str() == expected_auth);
                if !authorized {
                    let _ = request.respond(json_response(
                        401,
                        &serde_json::json!({"error": {"message": "invalid api key"}}),
                    ));
                    continue;
                }

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("invalid request body")
                            .with_status_code(400),
                    );
                    continue;
                }

                let parsed: Value = match serde_json::from_str(&body) {
                    Ok(value) => value,
                    Err(_) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string("invalid json").with_status_code(400),
                        );
                        continue;
                    }
                };

                let Some(prompt) = parsed.get("input").and_then(|v| v.as_str()) else {
                    let _ = request.respond(
                        tiny_http::Response::from_string("missing input").with_status_code(400),
                    );
                    continue;
                };

                let output_text = match config.behavior {
                    StubBehavior::ServerError => {
                        let _ = request.respond(json_response(
                            500,
                            &serde_json::json!({"error": {"message": "stub overloaded"}}),
                        ));
                        continue;
                    }
                    StubBehavior::Prose => "Je vous propose quatre unités captivantes.".to_owned(),
                    StubBehavior::FencedUnits if prompt.contains("Critères à évaluer") => {
                        exercises_response()
                    }
                    StubBehavior::FencedUnits => match units_response(prompt) {
                        Ok(text) => text,
                        Err(err) => {
                            let _ = request.respond(
                                tiny_http::Response::from_string(format!(
                                    "failed to build units response: {err}"
                                ))
                                .with_status_code(400),
                            );
                            continue;
                        }
                    },
                };

                let response_body = serde_json::json!({
                    "id": "resp_stub",
                    "object": "response",
                    "model": parsed
                        .get("model")
                        .cloned()
                        .unwrap_or(Value::String("stub-model".to_owned())),
                    "output": [
                        {
                            "type": "message",
                            "role": "assistant",
                            "content": [
                                { "type": "output_text", "text": output_text }
                            ]
                        }
                    ],
                    "output_text": output_text
                });
                let _ = request.respond(json_response(200, &response_body));
            }
        });

        Self {
            base_url,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }
}

impl Drop for OpenAiStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn json_response(status: u16, body: &Value) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("build header");
    tiny_http::Response::from_string(body.to_string())
        .with_status_code(status)
        .with_header(header)
}

fn extract_between<'a>(text: &'a str, begin: &str, end: &str) -> Option<&'a str> {
    let start = text.find(begin)? + begin.len();
    let rest = &text[start..];
    let end_rel = rest.find(end)?;
    Some(&rest[..end_rel])
}

/// Groups the prompt's chapters into the requested number of units, one
/// chapter each and the rest in the last unit.
fn units_response(prompt: &str) -> anyhow::Result<String> {
    let begin = "BEGIN_CHAPITRES_JSON\n";
    let end = "\nEND_CHAPITRES_JSON";
    let raw = extract_between(prompt, begin, end)
        .ok_or_else(|| anyhow::anyhow!("missing chapter markers: {begin:?} .. {end:?}"))?;
    let chapters: Vec<Value> = serde_json::from_str(raw).context("parse chapters json")?;

    let count = extract_between(prompt, "EXACTEMENT ", " unités")
        .ok_or_else(|| anyhow::anyhow!("missing unit count"))?
        .parse::<usize>()
        .context("parse unit count")?;

    let units = (0..count)
        .map(|i| {
            let ids = if i + 1 == count {
                chapters.iter().skip(i).collect::<Vec<_>>()
            } else {
                chapters.iter().skip(i).take(1).collect::<Vec<_>>()
            }
            .into_iter()
            .filter_map(|c| c.get("id").cloned())
            .collect::<Vec<_>>();
            serde_json::json!({
                "titre_unite": format!("Unité générée {}", i + 1),
                "chapitres_inclus": ids,
                "duree": "6",
                "concept_cle": "Systèmes",
                "concepts_connexes": ["Énergie", "Modèles"],
                "contexte_mondial": "Mondialisation et durabilité",
                "enonce_recherche": "Les systèmes évoluent.",
                "questions_factuelles": ["Qu'est-ce qu'un système ?"],
                "questions_conceptuelles": ["Comment un système change-t-il ?"],
                "questions_debat": ["Faut-il tout modéliser ?"],
                "objectifs_specifiques": "A.i, B.ii, D.i"
            })
        })
        .collect::<Vec<_>>();

    Ok(format!(
        "Voici les unités :\n```json\n{}\n```\n",
        serde_json::to_string_pretty(&serde_json::json!({ "unites": units }))?
    ))
}

fn exercises_response() -> String {
    let exercises = serde_json::json!({
        "exercices": [
            {
                "numero": 1,
                "titre": "Tester un prototype",
                "type": "application_pratique",
                "critere_ref": "D",
                "sous_critere_ref": "i",
                "objectif_ref": "définir une méthode d'essai",
                "contenu": "Proposez un protocole de test.",
                "answer_lines": 4
            },
            {
                "numero": 2,
                "titre": "Améliorer la solution",
                "type": "question_ouverte",
                "critere_ref": "D",
                "sous_critere_ref": "iii",
                "contenu": "Quelle amélioration proposez-vous ?",
                "answer_lines": "3"
            }
        ]
    });
    format!("```json\n{exercises}\n```")
}
