//! SQLite-backed document store.
//!
//! Holds one user document per principal plus child collections under it.
//! The HTTP server serves it as the remote side, and the engine tests use
//! the in-memory flavour as a fake remote.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use uuid::Uuid;

use crate::models::Document;
use crate::store::RemoteStore;

/// A document stored in a child collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildDocument {
    pub id: String,
    pub fields: Document,
}

pub struct DocumentStore {
    conn: Mutex<Connection>,
}

impl DocumentStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open document store: {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS user_documents (
                user_id TEXT PRIMARY KEY NOT NULL,
                fields TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS child_documents (
                id TEXT PRIMARY KEY NOT NULL,
                user_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                local_id TEXT,
                fields TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (user_id, collection, local_id)
            );

            CREATE INDEX IF NOT EXISTS idx_child_documents_collection
                ON child_documents(user_id, collection, created_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_user_document(&self, user_id: &str) -> Result<Option<Document>> {
        let fields: Option<String> = self
            .lock()
            .query_row(
                "SELECT fields FROM user_documents WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        fields
            .map(|text| decode_fields(&text))
            .transpose()
    }

    /// Write the user document. With `merge`, fields absent from `doc`
    /// keep their stored value.
    pub fn set_user_document(&self, user_id: &str, doc: Document, merge: bool) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mut fields = if merge {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT fields FROM user_documents WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(text) => decode_fields(&text)?,
                None => Document::new(),
            }
        } else {
            Document::new()
        };
        fields.extend(doc);

        tx.execute(
            "INSERT INTO user_documents (user_id, fields, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                fields = excluded.fields,
                updated_at = excluded.updated_at",
            params![
                user_id,
                serde_json::to_string(&fields)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Create a document under `collection` and return its id.
    ///
    /// A document carrying a `localId` already stored in the collection is
    /// not written twice: the id of the stored copy is returned instead.
    pub fn create_child_document(
        &self,
        user_id: &str,
        collection: &str,
        doc: Document,
    ) -> Result<String> {
        if !is_valid_collection(collection) {
            bail!("Invalid collection name '{collection}'");
        }
        let local_id = doc
            .get("localId")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        let conn = self.lock();
        if let Some(ref local_id) = local_id {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM child_documents
                     WHERE user_id = ?1 AND collection = ?2 AND local_id = ?3",
                    params![user_id, collection, local_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(id);
            }
        }

        let id = Uuid::new_v4().simple().to_string();
        conn.execute(
            "INSERT INTO child_documents (id, user_id, collection, local_id, fields, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                user_id,
                collection,
                local_id,
                serde_json::to_string(&doc)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(id)
    }

    pub fn list_child_documents(
        &self,
        user_id: &str,
        collection: &str,
    ) -> Result<Vec<ChildDocument>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, fields FROM child_documents
             WHERE user_id = ?1 AND collection = ?2
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map(params![user_id, collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, text)| {
                Ok(ChildDocument {
                    id,
                    fields: decode_fields(&text)?,
                })
            })
            .collect()
    }
}

/// Collection names are short identifiers: letters, digits, `_` and `-`.
#[must_use]
pub fn is_valid_collection(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn decode_fields(text: &str) -> Result<Document> {
    serde_json::from_str(text).context("Stored document is not a JSON object")
}

#[async_trait]
impl RemoteStore for DocumentStore {
    async fn get_user_document(&self, user_id: &str) -> Result<Option<Document>> {
        DocumentStore::get_user_document(self, user_id)
    }

    async fn set_user_document(&self, user_id: &str, doc: Document, merge: bool) -> Result<()> {
        DocumentStore::set_user_document(self, user_id, doc, merge)
    }

    async fn create_child_document(
        &self,
        user_id: &str,
        collection: &str,
        doc: Document,
    ) -> Result<String> {
        DocumentStore::create_child_document(self, user_id, collection, doc)
    }
}
