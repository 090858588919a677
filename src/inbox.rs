//! The SMS inbox — the external message store the scanner reads.
//!
//! The scanner only ever queries; it never mutates. `SqlInbox` is the
//! concrete libSQL-backed inbox used by the binary and the integration
//! tests; the feeding side (whatever delivers SMS rows) inserts into it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database, params};

use crate::error::InboxError;

/// One inbound SMS. Immutable, owned by the inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsMessage {
    /// Unique, strictly increasing, assigned by the inbox.
    pub id: i64,
    pub sender: String,
    pub body: String,
    /// Receive time, epoch millis.
    pub timestamp: i64,
}

/// Inbox query: messages with `id > min_id_exclusive`, newest first.
#[derive(Debug, Clone, Copy)]
pub struct InboxQuery {
    pub min_id_exclusive: i64,
    /// Cap on returned rows; `None` means backend-defined.
    pub limit: Option<usize>,
}

/// Read-only access to the message store.
#[async_trait]
pub trait MessageInbox: Send + Sync {
    /// Messages matching the query, ordered by id descending.
    async fn query(&self, query: InboxQuery) -> Result<Vec<SmsMessage>, InboxError>;
}

/// libSQL-backed inbox table.
pub struct SqlInbox {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
}

impl SqlInbox {
    /// Open (or create) the inbox database file.
    pub async fn open(path: &Path) -> Result<Self, InboxError> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| InboxError::Unavailable(format!("Failed to open inbox: {e}")))?;
        Self::from_db(db).await
    }

    /// In-memory inbox (for tests).
    pub async fn new_memory() -> Result<Self, InboxError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| InboxError::Unavailable(format!("Failed to create inbox: {e}")))?;
        Self::from_db(db).await
    }

    async fn from_db(db: Database) -> Result<Self, InboxError> {
        let conn = db
            .connect()
            .map_err(|e| InboxError::Unavailable(format!("Failed to connect to inbox: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sms_inbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender TEXT NOT NULL,
                body TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            )",
        )
        .await
        .map_err(|e| InboxError::Unavailable(format!("Failed to create inbox table: {e}")))?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Insert one message; returns the assigned id. Feeding side only.
    pub async fn insert(
        &self,
        sender: &str,
        body: &str,
        timestamp: i64,
    ) -> Result<i64, InboxError> {
        self.conn
            .execute(
                "INSERT INTO sms_inbox (sender, body, timestamp) VALUES (?1, ?2, ?3)",
                params![sender, body, timestamp],
            )
            .await
            .map_err(|e| InboxError::Query(e.to_string()))?;
        Ok(self.conn.last_insert_rowid())
    }
}

#[async_trait]
impl MessageInbox for SqlInbox {
    async fn query(&self, query: InboxQuery) -> Result<Vec<SmsMessage>, InboxError> {
        let limit = query.limit.map_or(-1_i64, |l| l as i64);
        let mut rows = self
            .conn
            .query(
                "SELECT id, sender, body, timestamp FROM sms_inbox
                 WHERE id > ?1 ORDER BY id DESC LIMIT ?2",
                params![query.min_id_exclusive, limit],
            )
            .await
            .map_err(|e| InboxError::Query(e.to_string()))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| InboxError::Query(e.to_string()))?
        {
            messages.push(SmsMessage {
                id: row.get(0).map_err(|e| InboxError::Query(e.to_string()))?,
                sender: row.get(1).map_err(|e| InboxError::Query(e.to_string()))?,
                body: row.get(2).map_err(|e| InboxError::Query(e.to_string()))?,
                timestamp: row.get(3).map_err(|e| InboxError::Query(e.to_string()))?,
            });
        }
        Ok(messages)
    }
}
