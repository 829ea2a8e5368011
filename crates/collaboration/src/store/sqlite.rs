use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{ChangeHub, DocumentStore, Subscription};
use crate::{
    sort_by_recency, Account, AccountStore, CollaborationError, Document, DocumentEvent,
    DocumentId, DocumentQuery, Result, Role, UserId,
};

const DOCUMENT_COLUMNS: &str = "d.id, d.title, d.content, d.owner_id, d.created_at, d.updated_at";

/// SQLite-backed store used by the server
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    hub: ChangeHub,
}

impl SqliteStore {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| CollaborationError::StorageError(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self::from_connection(conn, Some(path.to_path_buf()))?;
        info!("Opened document database at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            hub: ChangeHub::new(),
        })
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("../../migrations/V0001__init.sql"))?;
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, strftime('%s','now'))",
        params!["V0001__init"],
    )?;
    Ok(())
}

struct DocumentRow {
    id: String,
    title: String,
    content: String,
    owner_id: String,
    created_at: String,
    updated_at: i64,
}

impl DocumentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            content: row.get(2)?,
            owner_id: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_document(self, conn: &Connection) -> Result<Document> {
        let id = DocumentId(parse_uuid(&self.id)?);
        Ok(Document {
            id,
            title: self.title,
            content: self.content,
            owner_id: UserId(parse_uuid(&self.owner_id)?),
            collaborators: load_collaborators(conn, id)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: self.updated_at,
        })
    }
}

fn parse_uuid(raw: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(raw)
        .map_err(|e| CollaborationError::StorageError(format!("corrupt id {raw:?}: {e}")))
}

fn parse_timestamp(raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| CollaborationError::StorageError(format!("corrupt timestamp {raw:?}: {e}")))
}

fn load_collaborators(conn: &Connection, id: DocumentId) -> Result<BTreeMap<String, Role>> {
    let mut stmt =
        conn.prepare_cached("SELECT email, role FROM collaborators WHERE document_id = ?1")?;
    let rows = stmt.query_map(params![id.0.to_string()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut collaborators = BTreeMap::new();
    for row in rows {
        let (email, role) = row?;
        let role: Role = role
            .parse()
            .map_err(|_| CollaborationError::StorageError(format!("corrupt role {role:?}")))?;
        collaborators.insert(email, role);
    }
    Ok(collaborators)
}

fn load_document(conn: &Connection, id: DocumentId) -> Result<Option<Document>> {
    let row = conn
        .query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents d WHERE d.id = ?1"),
            params![id.0.to_string()],
            DocumentRow::from_row,
        )
        .optional()?;
    row.map(|r| r.into_document(conn)).transpose()
}

fn write_collaborators(conn: &Connection, doc: &Document) -> Result<()> {
    let id = doc.id.0.to_string();
    conn.execute("DELETE FROM collaborators WHERE document_id = ?1", params![id])?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO collaborators(document_id, email, role) VALUES(?1, ?2, ?3)",
    )?;
    for (email, role) in &doc.collaborators {
        stmt.execute(params![id, email, role.as_str()])?;
    }
    Ok(())
}

fn query_documents(conn: &Connection, query: &DocumentQuery) -> Result<Vec<Document>> {
    let (sql, key) = match query {
        DocumentQuery::OwnedBy { owner_id } => (
            format!("SELECT {DOCUMENT_COLUMNS} FROM documents d WHERE d.owner_id = ?1"),
            owner_id.0.to_string(),
        ),
        DocumentQuery::SharedWith { email } => (
            format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents d \
                 JOIN collaborators c ON c.document_id = d.id WHERE c.email = ?1"
            ),
            email.clone(),
        ),
    };

    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params![key], DocumentRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut docs = rows
        .into_iter()
        .map(|r| r.into_document(conn))
        .collect::<Result<Vec<_>>>()?;
    sort_by_recency(&mut docs);
    Ok(docs)
}

impl DocumentStore for SqliteStore {
    fn insert(&self, doc: Document) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO documents(id, title, content, owner_id, created_at, updated_at) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                doc.id.0.to_string(),
                doc.title,
                doc.content,
                doc.owner_id.0.to_string(),
                doc.created_at.to_rfc3339(),
                doc.updated_at,
            ],
        )?;
        if inserted == 0 {
            return Err(CollaborationError::InvalidInput(format!(
                "document {} already exists",
                doc.id
            )));
        }
        write_collaborators(&tx, &doc)?;
        tx.commit()?;

        let conn = &*conn;
        self.hub
            .publish(doc.id, None, Some(&doc), |q| query_documents(conn, q));
        Ok(())
    }

    fn get(&self, id: DocumentId) -> Result<Option<Document>> {
        load_document(&self.conn.lock(), id)
    }

    fn modify(
        &self,
        id: DocumentId,
        f: &mut dyn FnMut(&mut Document) -> Result<()>,
    ) -> Result<Document> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let before = load_document(&tx, id)?
            .ok_or_else(|| CollaborationError::DocumentNotFound(id.to_string()))?;

        let mut after = before.clone();
        f(&mut after)?;
        tx.execute(
            "UPDATE documents SET title = ?2, content = ?3, updated_at = ?4 WHERE id = ?1",
            params![id.0.to_string(), after.title, after.content, after.updated_at],
        )?;
        if after.collaborators != before.collaborators {
            write_collaborators(&tx, &after)?;
        }
        tx.commit()?;

        let conn = &*conn;
        self.hub
            .publish(id, Some(&before), Some(&after), |q| query_documents(conn, q));
        Ok(after)
    }

    fn remove(&self, id: DocumentId) -> Result<bool> {
        let conn = self.conn.lock();
        let Some(before) = load_document(&conn, id)? else {
            return Ok(false);
        };
        conn.execute(
            "DELETE FROM documents WHERE id = ?1",
            params![id.0.to_string()],
        )?;

        let conn = &*conn;
        self.hub
            .publish(id, Some(&before), None, |q| query_documents(conn, q));
        Ok(true)
    }

    fn query(&self, query: &DocumentQuery) -> Result<Vec<Document>> {
        query_documents(&self.conn.lock(), query)
    }

    fn watch_document(&self, id: DocumentId) -> Result<Subscription<DocumentEvent>> {
        let conn = self.conn.lock();
        let current = load_document(&conn, id)?;
        Ok(self.hub.subscribe_document(id, current.as_ref()))
    }

    fn watch_query(&self, query: &DocumentQuery) -> Result<Subscription<Vec<Document>>> {
        let conn = self.conn.lock();
        let current = query_documents(&conn, query)?;
        Ok(self.hub.subscribe_query(query, current))
    }
}

impl AccountStore for SqliteStore {
    fn insert_account(&self, account: Account) -> Result<()> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO accounts(uid, email, password_hash, salt, created_at) \
             VALUES(?1, ?2, ?3, ?4, ?5)",
            params![
                account.uid.0.to_string(),
                account.email,
                account.password_hash,
                account.salt,
                account.created_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(CollaborationError::AuthFailed(format!(
                "an account already exists for {}",
                account.email
            )));
        }
        Ok(())
    }

    fn find_account(&self, email: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT uid, email, password_hash, salt, created_at FROM accounts WHERE email = ?1",
                params![email],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(uid, email, password_hash, salt, created_at)| {
            Ok(Account {
                uid: UserId(parse_uuid(&uid)?),
                email,
                password_hash,
                salt,
                created_at: parse_timestamp(&created_at)?,
            })
        })
        .transpose()
    }
}
