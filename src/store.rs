use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::formats::{Chapter, Unit};

/// One synthesis (or explicit save) as it was requested and answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub enseignant: String,
    pub matiere: String,
    pub annee_pei: String,
    /// Attempt number chosen by the teacher; several attempts may cover the
    /// same subject and grade.
    #[serde(default = "first_attempt")]
    pub essai: u32,
    #[serde(default)]
    pub chapitres: Vec<Chapter>,
    pub units: Vec<Unit>,
    pub created_at: DateTime<Utc>,
}

/// Denormalized copy of one unit of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: String,
    pub session_id: String,
    pub enseignant: String,
    pub matiere: String,
    pub annee_pei: String,
    #[serde(default = "first_attempt")]
    pub essai: u32,
    pub position: usize,
    pub unit: Unit,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnitQuery {
    pub enseignant: String,
    #[serde(default)]
    pub matiere: Option<String>,
    #[serde(default)]
    pub annee_pei: Option<String>,
    #[serde(default)]
    pub essai: Option<u32>,
}

pub const fn first_attempt() -> u32 {
    1
}

impl UnitQuery {
    fn matches(&self, record: &UnitRecord) -> bool {
        record.enseignant == self.enseignant
            && self.matiere.as_ref().is_none_or(|m| *m == record.matiere)
            && self.annee_pei.as_ref().is_none_or(|g| *g == record.annee_pei)
            && self.essai.is_none_or(|e| e == record.essai)
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_session(&self, session: &SessionRecord) -> anyhow::Result<()>;
    async fn save_unit(&self, unit: &UnitRecord) -> anyhow::Result<()>;
    /// Newest first.
    async fn units_by_teacher(&self, query: &UnitQuery) -> anyhow::Result<Vec<UnitRecord>>;
    /// Newest first.
    async fn recent_sessions(&self, limit: usize) -> anyhow::Result<Vec<SessionRecord>>;
    async fn session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>>;
}

#[derive(Debug, Clone)]
pub struct LocalFsSessionStore {
    base_dir: PathBuf,
}

impl LocalFsSessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.base_dir.join("sessions")
    }

    fn units_dir(&self) -> PathBuf {
        self.base_dir.join("units")
    }

    fn session_json_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.json"))
    }

    fn unit_json_path(&self, unit_id: &str) -> PathBuf {
        self.units_dir().join(format!("{unit_id}.json"))
    }
}

#[async_trait]
impl SessionStore for LocalFsSessionStore {
    async fn save_session(&self, session: &SessionRecord) -> anyhow::Result<()> {
        let path = self.session_json_path(&validate_id(&session.id)?);
        write_json_atomic(&path, session)
            .await
            .with_context(|| format!("write session: {}", path.display()))
    }

    async fn save_unit(&self, unit: &UnitRecord) -> anyhow::Result<()> {
        let path = self.unit_json_path(&validate_id(&unit.id)?);
        write_json_atomic(&path, unit)
            .await
            .with_context(|| format!("write unit: {}", path.display()))
    }

    async fn units_by_teacher(&self, query: &UnitQuery) -> anyhow::Result<Vec<UnitRecord>> {
        let mut units = read_json_dir::<UnitRecord>(&self.units_dir())
            .await
            .context("read units")?
            .into_iter()
            .filter(|u| query.matches(u))
            .collect::<Vec<_>>();
        units.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(a.session_id.cmp(&b.session_id))
                .then(a.position.cmp(&b.position))
        });
        Ok(units)
    }

    async fn recent_sessions(&self, limit: usize) -> anyhow::Result<Vec<SessionRecord>> {
        let mut sessions = read_json_dir::<SessionRecord>(&self.sessions_dir())
            .await
            .context("read sessions")?;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        let Ok(session_id) = validate_id(session_id) else {
            return Ok(None);
        };
        let path = self.session_json_path(&session_id);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }
}

/// Record ids become file names; only uuid-shaped ids are accepted.
fn validate_id(id: &str) -> anyhow::Result<String> {
    uuid::Uuid::parse_str(id)
        .map(|u| u.to_string())
        .with_context(|| format!("invalid record id: {id:?}"))
}

/// Saves the session, then one record per unit.
///
/// Failures are logged and swallowed; the session id is returned only when
/// the session itself was stored.
pub async fn record_synthesis(
    store: &dyn SessionStore,
    teacher: &str,
    subject: &str,
    grade: &str,
    attempt: u32,
    chapters: Vec<Chapter>,
    units: &[Unit],
) -> Option<String> {
    let session = SessionRecord {
        id: uuid::Uuid::new_v4().to_string(),
        enseignant: teacher.to_owned(),
        matiere: subject.to_owned(),
        annee_pei: grade.to_owned(),
        essai: attempt,
        chapitres: chapters,
        units: units.to_vec(),
        created_at: Utc::now(),
    };

    if let Err(err) = store.save_session(&session).await {
        tracing::error!(error = %format!("{err:#}"), "save session failed");
        return None;
    }

    for (position, unit) in units.iter().enumerate() {
        let record = UnitRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            enseignant: session.enseignant.clone(),
            matiere: session.matiere.clone(),
            annee_pei: session.annee_pei.clone(),
            essai: session.essai,
            position,
            unit: unit.clone(),
            created_at: session.created_at,
        };
        if let Err(err) = store.save_unit(&record).await {
            tracing::error!(
                session_id = %session.id,
                position,
                error = %format!("{err:#}"),
                "save unit failed"
            );
        }
    }

    tracing::debug!(
        session_id = %session.id,
        essai = session.essai,
        units = units.len(),
        "session recorded"
    );
    Some(session.id)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

/// Every `*.json` record of `dir`; unreadable records are skipped with a
/// warning, a missing directory is empty.
async fn read_json_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> anyhow::Result<Vec<T>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("list: {}", dir.display())),
    };

    let mut records = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("list: {}", dir.display()))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_json(&path).await {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "skip record");
            }
        }
    }
    Ok(records)
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
