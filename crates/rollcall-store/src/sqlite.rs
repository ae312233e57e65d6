//! SQLite gallery store on a single `tokio-rusqlite` connection.

use crate::codec;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rollcall_core::{
    Embedding, FaceEmbedding, GalleryEntry, GalleryStore, Identity, IdentityFields, IdentityId,
    IdentityPatch, RecognitionLogEntry, RecognitionLogRecord, StoreError,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_rusqlite::Connection;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS persons (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    age         INTEGER,
    gender      TEXT,
    phone       TEXT,
    email       TEXT,
    address     TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS face_encodings (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id      INTEGER NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
    face_encoding  BLOB NOT NULL,
    dim            INTEGER NOT NULL,
    image_path     TEXT,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_face_encodings_person ON face_encodings(person_id);

CREATE TABLE IF NOT EXISTS recognition_logs (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id      INTEGER REFERENCES persons(id) ON DELETE SET NULL,
    confidence     REAL NOT NULL,
    image_path     TEXT NOT NULL,
    recognized_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_recognition_logs_time ON recognition_logs(recognized_at);
"#;

/// Default time a write may spend, lock waits included, before it gives up.
pub const DEFAULT_WRITE_BUDGET: Duration = Duration::from_secs(4);

const IDENTITY_COLUMNS: &str =
    "p.id, p.name, p.age, p.gender, p.phone, p.email, p.address, p.created_at, p.updated_at";

/// Durable gallery store backed by a SQLite file.
///
/// Every write runs under a budget: SQLite's busy timeout is set to what is
/// left of it, and a write whose budget ran out while queued never starts.
/// Keep the budget below the caller's store timeout so a write the caller has
/// given up on fails instead of committing afterwards.
pub struct SqliteStore {
    conn: Connection,
    write_budget: Duration,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).await.map_err(classify)?;
        conn.call(|conn| {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!(journal_mode = %mode, "journal mode set");
            Ok(())
        })
        .await
        .map_err(classify)?;
        let store = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "gallery database opened");
        Ok(store)
    }

    /// In-memory database, for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(classify)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(classify)?;
        Ok(Self {
            conn,
            write_budget: DEFAULT_WRITE_BUDGET,
        })
    }

    pub fn with_write_budget(mut self, budget: Duration) -> Self {
        self.write_budget = budget;
        self
    }

    fn write_deadline(&self) -> Instant {
        Instant::now() + self.write_budget
    }
}

/// Bound the next statement's lock waits by what is left until `deadline`.
fn arm(conn: &rusqlite::Connection, deadline: Instant) -> Result<(), tokio_rusqlite::Error> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
        .ok_or_else(|| {
            tokio_rusqlite::Error::Other("write budget spent before it started".into())
        })?;
    conn.busy_timeout(remaining)?;
    Ok(())
}

/// Current time at the precision stored in the database.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn classify(e: tokio_rusqlite::Error) -> StoreError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => classify_sqlite(e),
        tokio_rusqlite::Error::ConnectionClosed => {
            StoreError::Unavailable("database connection closed".into())
        }
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn classify_sqlite(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StoreError::Rejected(e.to_string()),
        Some(_) => StoreError::Unavailable(e.to_string()),
        None => match e {
            rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(e.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        },
    }
}

/// Identity row as read from SQLite, before timestamp parsing.
struct IdentityRow {
    id: IdentityId,
    name: String,
    age: Option<u32>,
    gender: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    address: Option<String>,
    created_at: String,
    updated_at: String,
}

impl IdentityRow {
    /// Reads the nine `IDENTITY_COLUMNS` starting at column `at`.
    fn read(row: &Row<'_>, at: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(at)?,
            name: row.get(at + 1)?,
            age: row.get(at + 2)?,
            gender: row.get(at + 3)?,
            phone: row.get(at + 4)?,
            email: row.get(at + 5)?,
            address: row.get(at + 6)?,
            created_at: row.get(at + 7)?,
            updated_at: row.get(at + 8)?,
        })
    }

    fn into_identity(self) -> Result<Identity, StoreError> {
        Ok(Identity {
            id: self.id,
            name: self.name,
            age: self.age,
            gender: self.gender,
            phone: self.phone,
            email: self.email,
            address: self.address,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

struct EmbeddingRow {
    id: i64,
    identity_id: IdentityId,
    blob: Vec<u8>,
    dim: usize,
    source_image: Option<String>,
}

impl EmbeddingRow {
    fn into_embedding(self) -> Result<FaceEmbedding, StoreError> {
        let embedding = codec::decode(&self.blob, self.dim)
            .map_err(|e| StoreError::Corrupt(format!("face_encodings row {}: {e}", self.id)))?;
        Ok(FaceEmbedding {
            id: self.id,
            identity_id: self.identity_id,
            embedding,
            source_image: self.source_image,
        })
    }
}

fn select_identity(
    conn: &rusqlite::Connection,
    id: IdentityId,
) -> rusqlite::Result<Option<IdentityRow>> {
    conn.query_row(
        &format!("SELECT {IDENTITY_COLUMNS} FROM persons p WHERE p.id = ?1"),
        params![id],
        |row| IdentityRow::read(row, 0),
    )
    .optional()
}

#[async_trait]
impl GalleryStore for SqliteStore {
    async fn create_identity(&self, fields: &IdentityFields) -> Result<Identity, StoreError> {
        let row = fields.clone();
        let at = now();
        let stamp = format_time(&at);
        let deadline = self.write_deadline();
        let id = self
            .conn
            .call(move |conn| {
                arm(conn, deadline)?;
                conn.execute(
                    "INSERT INTO persons
                         (name, age, gender, phone, email, address, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        row.name,
                        row.age,
                        row.gender,
                        row.phone,
                        row.email,
                        row.address,
                        stamp
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(classify)?;

        tracing::debug!(identity_id = id, "person row inserted");
        let IdentityFields {
            name,
            age,
            gender,
            phone,
            email,
            address,
        } = fields.clone();
        Ok(Identity {
            id,
            name,
            age,
            gender,
            phone,
            email,
            address,
            created_at: at,
            updated_at: at,
        })
    }

    async fn create_embedding(
        &self,
        identity_id: IdentityId,
        embedding: &Embedding,
        source_image: Option<&str>,
    ) -> Result<FaceEmbedding, StoreError> {
        let blob = codec::encode(embedding);
        let dim = embedding.dim() as i64;
        let source = source_image.map(str::to_string);
        let stamp = format_time(&now());
        let source_for_row = source.clone();
        let deadline = self.write_deadline();
        let inserted = self
            .conn
            .call(move |conn| {
                arm(conn, deadline)?;
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM persons WHERE id = ?1)",
                    params![identity_id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Ok(None);
                }
                conn.execute(
                    "INSERT INTO face_encodings
                         (person_id, face_encoding, dim, image_path, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![identity_id, blob, dim, source_for_row, stamp],
                )?;
                Ok(Some(conn.last_insert_rowid()))
            })
            .await
            .map_err(classify)?;

        let id = inserted.ok_or(StoreError::NotFound(identity_id))?;
        Ok(FaceEmbedding {
            id,
            identity_id,
            embedding: embedding.clone(),
            source_image: source,
        })
    }

    async fn read_all_embeddings(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {IDENTITY_COLUMNS}, fe.id, fe.face_encoding, fe.dim, fe.image_path
                     FROM face_encodings fe
                     JOIN persons p ON fe.person_id = p.id
                     ORDER BY p.id, fe.id"
                ))?;
                let rows = stmt
                    .query_map([], |row| {
                        let identity = IdentityRow::read(row, 0)?;
                        let embedding = EmbeddingRow {
                            id: row.get(9)?,
                            identity_id: identity.id,
                            blob: row.get(10)?,
                            dim: row.get::<_, i64>(11)? as usize,
                            source_image: row.get(12)?,
                        };
                        Ok((identity, embedding))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(classify)?;

        // One unreadable row must not take the whole gallery down.
        let entries = rows
            .into_iter()
            .filter_map(|(identity, embedding)| {
                let row_id = embedding.id;
                let entry = identity.into_identity().and_then(|identity| {
                    Ok(GalleryEntry {
                        identity,
                        embedding: embedding.into_embedding()?,
                    })
                });
                match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        tracing::warn!(
                            row_id,
                            error = %e,
                            "skipping unreadable face_encodings row"
                        );
                        None
                    }
                }
            })
            .collect();
        Ok(entries)
    }

    async fn read_identity(&self, id: IdentityId) -> Result<Option<Identity>, StoreError> {
        let row = self
            .conn
            .call(move |conn| Ok(select_identity(conn, id)?))
            .await
            .map_err(classify)?;
        row.map(IdentityRow::into_identity).transpose()
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {IDENTITY_COLUMNS} FROM persons p ORDER BY p.id"
                ))?;
                let rows = stmt
                    .query_map([], |row| IdentityRow::read(row, 0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(classify)?;
        rows.into_iter().map(IdentityRow::into_identity).collect()
    }

    async fn update_identity(
        &self,
        id: IdentityId,
        patch: &IdentityPatch,
    ) -> Result<Identity, StoreError> {
        let mut sets: Vec<&'static str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let text = |v: &Option<String>| v.clone().map(Value::Text);
        for (column, value) in [
            ("name", text(&patch.name)),
            ("age", patch.age.map(|a| Value::Integer(i64::from(a)))),
            ("gender", text(&patch.gender)),
            ("phone", text(&patch.phone)),
            ("email", text(&patch.email)),
            ("address", text(&patch.address)),
        ] {
            if let Some(value) = value {
                sets.push(column);
                values.push(value);
            }
        }
        let empty = sets.is_empty();
        let sql = {
            let mut assignments: Vec<String> =
                sets.iter().enumerate().map(|(i, c)| format!("{c} = ?{}", i + 1)).collect();
            assignments.push(format!("updated_at = ?{}", values.len() + 1));
            format!(
                "UPDATE persons SET {} WHERE id = ?{}",
                assignments.join(", "),
                values.len() + 2
            )
        };
        values.push(Value::Text(format_time(&now())));
        values.push(Value::Integer(id));

        let deadline = self.write_deadline();
        let row = self
            .conn
            .call(move |conn| {
                arm(conn, deadline)?;
                // Nothing to change: only confirm the identity exists.
                if empty {
                    return Ok(select_identity(conn, id)?);
                }
                let tx = conn.transaction()?;
                let changed = tx.execute(&sql, params_from_iter(values.iter()))?;
                let row = if changed == 0 { None } else { select_identity(&tx, id)? };
                tx.commit()?;
                Ok(row)
            })
            .await
            .map_err(classify)?;

        row.ok_or(StoreError::NotFound(id))?.into_identity()
    }

    async fn delete_identity(&self, id: IdentityId) -> Result<(), StoreError> {
        let deadline = self.write_deadline();
        let changed = self
            .conn
            .call(move |conn| {
                arm(conn, deadline)?;
                Ok(conn.execute("DELETE FROM persons WHERE id = ?1", params![id])?)
            })
            .await
            .map_err(classify)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        tracing::debug!(identity_id = id, "person row deleted");
        Ok(())
    }

    async fn append_recognition_log(&self, entry: &RecognitionLogEntry) -> Result<(), StoreError> {
        let identity_id = entry.identity_id;
        let confidence = f64::from(entry.confidence);
        let source = entry.source_image.clone();
        let stamp = format_time(&entry.recognized_at);
        let deadline = self.write_deadline();
        self.conn
            .call(move |conn| {
                arm(conn, deadline)?;
                conn.execute(
                    "INSERT INTO recognition_logs (person_id, confidence, image_path, recognized_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![identity_id, confidence, source, stamp],
                )?;
                Ok(())
            })
            .await
            .map_err(classify)
    }

    async fn read_recognition_logs(
        &self,
        limit: u32,
    ) -> Result<Vec<RecognitionLogRecord>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT rl.id, rl.person_id, rl.confidence, rl.image_path, rl.recognized_at,
                            p.name, p.age, p.gender
                     FROM recognition_logs rl
                     LEFT JOIN persons p ON rl.person_id = p.id
                     ORDER BY rl.recognized_at DESC, rl.id DESC
                     LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<IdentityId>>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, Option<u32>>(6)?,
                            row.get::<_, Option<String>>(7)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(classify)?;

        rows.into_iter()
            .map(|(id, identity_id, confidence, source_image, at, name, age, gender)| {
                Ok(RecognitionLogRecord {
                    id,
                    entry: RecognitionLogEntry {
                        identity_id,
                        confidence: confidence as f32,
                        source_image,
                        recognized_at: parse_time(&at)?,
                    },
                    name,
                    age,
                    gender,
                })
            })
            .collect()
    }
}
