mod openai_stub;

use std::fs;
use std::io::Read as _;
use std::path::Path;

use predicates::prelude::*;
use unitplan::formats::{ChapterId, parse_units_document};

use openai_stub::{OpenAiStub, OpenAiStubConfig, StubBehavior};

const API_KEY: &str = "sk-stub";

fn write_chapters(dir: &Path, n: usize) -> anyhow::Result<std::path::PathBuf> {
    let chapters = (1..=n)
        .map(|i| {
            serde_json::json!({
                "id": i,
                "titre": format!("Chapitre {i}"),
                "contenu": "",
                "duree": 4
            })
        })
        .collect::<Vec<_>>();
    let path = dir.join("chapitres.json");
    fs::write(&path, serde_json::to_string(&serde_json::json!({ "chapitres": chapters }))?)?;
    Ok(path)
}

fn synthesize_cmd(chapters: &Path, out: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("unitplan");
    cmd.env_remove("OPENAI_API_KEY")
        .env_remove("UNITPLAN_OPENAI_BASE_URL")
        .args(["synthesize", "--subject", "sciences", "--grade", "pei4"])
        .arg("--chapters")
        .arg(chapters)
        .arg("--out")
        .arg(out);
    cmd
}

fn assert_fallback_partition(out: &Path) -> anyhow::Result<()> {
    let units = parse_units_document(&fs::read_to_string(out)?)?;
    let sizes = units
        .iter()
        .map(|u| u.chapitres_inclus.len())
        .collect::<Vec<_>>();
    assert_eq!(sizes, vec![1, 1, 1, 3]);
    assert_eq!(units[0].titre_unite, "Unité 1: Chapitre 1");
    assert_eq!(units[3].duree, 12.0);
    assert_eq!(units[2].objectifs_specifiques, vec!["A.i", "A.ii", "B.i", "C.i", "D.i"]);
    Ok(())
}

#[test]
fn noop_engine_partitions_chapters() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let chapters = write_chapters(temp.path(), 6)?;
    let out = temp.path().join("out").join("unites.json");

    synthesize_cmd(&chapters, &out)
        .args(["--engine", "noop"])
        .assert()
        .success();
    assert_fallback_partition(&out)?;

    // Refuses to overwrite without --force.
    synthesize_cmd(&chapters, &out)
        .args(["--engine", "noop"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    synthesize_cmd(&chapters, &out)
        .args(["--engine", "noop", "--units", "2", "--force"])
        .assert()
        .success();
    let units = parse_units_document(&fs::read_to_string(&out)?)?;
    assert_eq!(units.len(), 2);
    Ok(())
}

#[test]
fn openai_engine_without_key_partitions_chapters() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let chapters = write_chapters(temp.path(), 6)?;
    let out = temp.path().join("unites.json");

    synthesize_cmd(&chapters, &out)
        .args(["--engine", "openai"])
        .assert()
        .success();
    assert_fallback_partition(&out)
}

#[test]
fn openai_engine_uses_generated_units() -> anyhow::Result<()> {
    let stub = OpenAiStub::spawn(OpenAiStubConfig {
        expected_api_key: API_KEY.to_owned(),
        behavior: StubBehavior::FencedUnits,
    });
    let temp = tempfile::TempDir::new()?;
    let chapters = write_chapters(temp.path(), 5)?;
    let out = temp.path().join("unites.json");

    synthesize_cmd(&chapters, &out)
        .env("OPENAI_API_KEY", API_KEY)
        .env("UNITPLAN_OPENAI_BASE_URL", &stub.base_url)
        .args(["--engine", "openai", "--units", "3"])
        .assert()
        .success();

    let units = parse_units_document(&fs::read_to_string(&out)?)?;
    assert_eq!(units.len(), 3);
    assert_eq!(units[0].titre_unite, "Unité générée 1");
    assert_eq!(units[0].duree, 6.0);
    assert_eq!(
        units[2].chapitres_inclus,
        vec![
            ChapterId::from(3usize),
            ChapterId::from(4usize),
            ChapterId::from(5usize)
        ]
    );
    assert_eq!(units[1].objectifs_specifiques, vec!["A.i", "B.ii", "D.i"]);
    Ok(())
}

#[test]
fn openai_failures_fall_back_to_partitioning() -> anyhow::Result<()> {
    for behavior in [StubBehavior::ServerError, StubBehavior::Prose] {
        let stub = OpenAiStub::spawn(OpenAiStubConfig {
            expected_api_key: API_KEY.to_owned(),
            behavior,
        });
        let temp = tempfile::TempDir::new()?;
        let chapters = write_chapters(temp.path(), 6)?;
        let out = temp.path().join("unites.json");

        synthesize_cmd(&chapters, &out)
            .env("OPENAI_API_KEY", API_KEY)
            .env("UNITPLAN_OPENAI_BASE_URL", &stub.base_url)
            .args(["--engine", "openai"])
            .assert()
            .success()
            .stderr(predicate::str::contains("unit generation failed"));
        assert_fallback_partition(&out)?;
    }
    Ok(())
}

#[test]
fn wrong_api_key_falls_back_to_partitioning() -> anyhow::Result<()> {
    let stub = OpenAiStub::spawn(OpenAiStubConfig {
        expected_api_key: API_KEY.to_owned(),
        behavior: StubBehavior::FencedUnits,
    });
    let temp = tempfile::TempDir::new()?;
    let chapters = write_chapters(temp.path(), 6)?;
    let out = temp.path().join("unites.json");

    synthesize_cmd(&chapters, &out)
        .env("OPENAI_API_KEY", "sk-wrong")
        .env("UNITPLAN_OPENAI_BASE_URL", &stub.base_url)
        .assert()
        .success()
        .stderr(predicate::str::contains("invalid api key"));
    assert_fallback_partition(&out)
}

#[test]
fn synthesized_units_render_to_docx() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let chapters = write_chapters(temp.path(), 6)?;
    let units_path = temp.path().join("unites.json");
    let docs = temp.path().join("docs");

    synthesize_cmd(&chapters, &units_path)
        .args(["--engine", "noop"])
        .assert()
        .success();

    let output = assert_cmd::cargo::cargo_bin_cmd!("unitplan")
        .args(["render", "--subject", "sciences", "--grade", "pei4", "--teacher", "Mme Ba"])
        .arg("--units")
        .arg(&units_path)
        .arg("--out-dir")
        .arg(&docs)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let paths = String::from_utf8(output)?
        .lines()
        .map(str::to_owned)
        .collect::<Vec<_>>();
    assert_eq!(paths.len(), 4);

    for path in &paths {
        let file = fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)?;
        let mut xml = String::new();
        archive
            .by_name("word/document.xml")?
            .read_to_string(&mut xml)?;
        assert!(xml.contains("Mme Ba"));
        assert!(xml.contains("Sciences"));
        assert!(xml.contains("A: Analyse"));
        for field in ["{titre_unite}", "{duree}", "{objectifs_specifiques}", "{questions_debat}"] {
            assert!(!xml.contains(field), "{field} left in {path}");
        }
    }

    assert_cmd::cargo::cargo_bin_cmd!("unitplan")
        .args(["render", "--subject", "sciences", "--grade", "pei4", "--index", "9"])
        .arg("--units")
        .arg(&units_path)
        .arg("--out-dir")
        .arg(&docs)
        .assert()
        .failure()
        .stderr(predicate::str::contains("out of range"));
    Ok(())
}

fn evaluate_cmd(units: &Path, out_dir: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("unitplan");
    cmd.env_remove("OPENAI_API_KEY")
        .env_remove("UNITPLAN_OPENAI_BASE_URL")
        .args(["evaluate", "--subject", "sciences", "--grade", "pei4"])
        .arg("--units")
        .arg(units)
        .arg("--out-dir")
        .arg(out_dir);
    cmd
}

fn evaluation_xml(stdout: &[u8]) -> anyhow::Result<(String, String)> {
    let path = String::from_utf8(stdout.to_vec())?.trim().to_owned();
    let mut archive = zip::ZipArchive::new(fs::File::open(&path)?)?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")?
        .read_to_string(&mut xml)?;
    Ok((path, xml))
}

#[test]
fn synthesized_unit_renders_an_evaluation() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let chapters = write_chapters(temp.path(), 6)?;
    let units_path = temp.path().join("unites.json");
    let docs = temp.path().join("evaluations");

    synthesize_cmd(&chapters, &units_path)
        .args(["--engine", "noop"])
        .assert()
        .success();

    let output = evaluate_cmd(&units_path, &docs)
        .args(["--engine", "noop", "--index", "1", "--criteria", "a,C"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let (path, xml) = evaluation_xml(&output)?;
    assert!(
        path.contains("Evaluation_PEI_Sciences_Criteres_A_C_"),
        "{path}"
    );
    assert!(xml.contains("Évaluation critériée PEI"));
    assert!(xml.contains("Unité 2: Chapitre 2"));
    assert!(xml.contains("Évaluation A.i"));
    assert!(xml.contains("Critère C: "));
    for field in ["{exercices}", "{criteres_resume}", "{descripteur_5_6}"] {
        assert!(!xml.contains(field), "{field} left in {path}");
    }

    evaluate_cmd(&units_path, &docs)
        .args(["--engine", "noop", "--criteria", "Z"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("criterion Z not found"));
    Ok(())
}

#[test]
fn openai_engine_writes_generated_exercises() -> anyhow::Result<()> {
    let stub = OpenAiStub::spawn(OpenAiStubConfig {
        expected_api_key: API_KEY.to_owned(),
        behavior: StubBehavior::FencedUnits,
    });
    let temp = tempfile::TempDir::new()?;
    let units_path = temp.path().join("unites.json");
    fs::write(
        &units_path,
        r#"{"units": [{"titre_unite": "Systèmes", "enonce_recherche": "Tout change."}]}"#,
    )?;

    let output = evaluate_cmd(&units_path, temp.path())
        .env("OPENAI_API_KEY", API_KEY)
        .env("UNITPLAN_OPENAI_BASE_URL", &stub.base_url)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let (_, xml) = evaluation_xml(&output)?;
    assert!(xml.contains("Exercice 1: Tester un prototype (Critère D.i)"));
    assert!(xml.contains("Exercice 2: Améliorer la solution (Critère D.iii)"));
    assert!(!xml.contains("Évaluation D.i"));
    Ok(())
}
