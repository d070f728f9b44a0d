use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// How many messages a feed snapshot carries. Matches the recent-window the
/// merge layer cares about, with headroom.
const FEED_SNAPSHOT_LIMIT: usize = 100;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    User,
    Persona,
}

impl SenderKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            SenderKind::User => "user",
            SenderKind::Persona => "persona",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "persona" => SenderKind::Persona,
            _ => SenderKind::User,
        }
    }
}

/// A persisted chat message. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub persona_id: String,
    #[serde(rename = "senderType")]
    pub sender: SenderKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "messageType")]
    pub kind: String,
    pub is_sent: bool,
}

/// Everything the caller supplies for a new message; the store assigns the id.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub room_id: String,
    pub persona_id: String,
    pub sender: SenderKind,
    pub content: String,
    pub kind: String,
}

impl MessageDraft {
    pub fn new(room_id: &str, persona_id: &str, sender: SenderKind, content: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            persona_id: persona_id.to_string(),
            sender,
            content: content.to_string(),
            kind: "text".to_string(),
        }
    }
}

/// One ongoing conversation between a user and a persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub user_id: String,
    pub persona_id: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_content: Option<String>,
    pub message_count: i64,
}

impl Room {
    pub fn new(id: &str, user_id: &str, persona_id: &str) -> Self {
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            persona_id: persona_id.to_string(),
            last_message_at: None,
            last_message_content: None,
            message_count: 0,
        }
    }
}

/// The append log the pipeline writes into and the live feed reads from.
///
/// `create` assigns the id and timestamps the row with the explicit instant
/// the caller computed; `subscribe` pushes whole-collection snapshots (most
/// recent messages, ascending) after every write to the room.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, draft: &MessageDraft, created_at: DateTime<Utc>) -> Result<String>;

    /// Most recent `limit` messages for the room, ascending by time.
    async fn read_recent(&self, room_id: &str, limit: usize) -> Result<Vec<Message>>;

    fn subscribe(&self, room_id: &str) -> flume::Receiver<Vec<Message>>;

    async fn get_room(&self, room_id: &str) -> Result<Option<Room>>;

    /// Create the room row if it does not exist yet.
    async fn ensure_room(&self, room: &Room) -> Result<()>;

    /// Best-effort room metadata bump after a successful persist.
    async fn update_room_last_message(
        &self,
        room_id: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_state(&self, key: &str) -> Result<Option<String>>;
    async fn set_state(&self, key: &str, value: &str) -> Result<()>;
    async fn delete_state(&self, key: &str) -> Result<()>;
}

type SnapshotSenders = HashMap<String, Vec<flume::Sender<Vec<Message>>>>;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    subscribers: Mutex<SnapshotSenders>,
}

impl SqliteStore {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            subscribers: Mutex::new(HashMap::new()),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                persona_id TEXT NOT NULL,
                last_message_at TEXT,
                last_message_content TEXT,
                message_count INTEGER NOT NULL DEFAULT 0
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                persona_id TEXT NOT NULL,
                sender_type TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                message_type TEXT NOT NULL DEFAULT 'text',
                is_sent INTEGER NOT NULL DEFAULT 1
            )"#,
            [],
        )?;

        // Feed reads are always (room, time-ordered)
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_room_created ON messages(room_id, created_at)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS session_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }

    fn message_from_row(row: &rusqlite::Row) -> rusqlite::Result<Message> {
        let created_str: String = row.get(5)?;
        let created_at = DateTime::parse_from_rfc3339(&created_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
        let sender: String = row.get(3)?;

        Ok(Message {
            id: row.get(0)?,
            room_id: row.get(1)?,
            persona_id: row.get(2)?,
            sender: SenderKind::from_db(&sender),
            content: row.get(4)?,
            created_at,
            kind: row.get(6)?,
            is_sent: row.get::<_, i64>(7)? != 0,
        })
    }

    fn read_recent_sync(&self, room_id: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, room_id, persona_id, sender_type, content, created_at, message_type, is_sent
             FROM messages WHERE room_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;

        let mut messages = stmt
            .query_map(params![room_id, limit as i64], Self::message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        // Fetched newest-first; callers want ascending
        messages.reverse();
        Ok(messages)
    }

    /// Push a fresh snapshot to every live subscriber of the room, dropping
    /// any whose receiving side has gone away.
    fn notify_room(&self, room_id: &str) {
        let snapshot = match self.read_recent_sync(room_id, FEED_SNAPSHOT_LIMIT) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Feed snapshot read failed for room {}: {}", room_id, e);
                return;
            }
        };

        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(senders) = subscribers.get_mut(room_id) {
            senders.retain(|tx| tx.send(snapshot.clone()).is_ok());
        }
    }

    fn room_from_row(row: &rusqlite::Row) -> rusqlite::Result<Room> {
        let last_at: Option<String> = row.get(3)?;
        let last_message_at = match last_at {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
            ),
            None => None,
        };

        Ok(Room {
            id: row.get(0)?,
            user_id: row.get(1)?,
            persona_id: row.get(2)?,
            last_message_at,
            last_message_content: row.get(4)?,
            message_count: row.get(5)?,
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn create(&self, draft: &MessageDraft, created_at: DateTime<Utc>) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let conn = self.lock_conn()?;
            conn.execute(
                "INSERT INTO messages (id, room_id, persona_id, sender_type, content, created_at, message_type, is_sent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
                params![
                    id,
                    draft.room_id,
                    draft.persona_id,
                    draft.sender.as_db_str(),
                    draft.content,
                    created_at.to_rfc3339(),
                    draft.kind,
                ],
            )?;
        }

        self.notify_room(&draft.room_id);
        Ok(id)
    }

    async fn read_recent(&self, room_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.read_recent_sync(room_id, limit)
    }

    fn subscribe(&self, room_id: &str) -> flume::Receiver<Vec<Message>> {
        let (tx, rx) = flume::unbounded();
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers
            .entry(room_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    async fn get_room(&self, room_id: &str) -> Result<Option<Room>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT id, user_id, persona_id, last_message_at, last_message_content, message_count
             FROM rooms WHERE id = ?1",
            [room_id],
            Self::room_from_row,
        );

        match result {
            Ok(room) => Ok(Some(room)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_room(&self, room: &Room) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO rooms (id, user_id, persona_id, last_message_at, last_message_content, message_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                room.id,
                room.user_id,
                room.persona_id,
                room.last_message_at.map(|at| at.to_rfc3339()),
                room.last_message_content,
                room.message_count,
            ],
        )?;
        Ok(())
    }

    async fn update_room_last_message(
        &self,
        room_id: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE rooms
             SET last_message_at = ?2, last_message_content = ?3, message_count = message_count + 1
             WHERE id = ?1",
            params![room_id, at.to_rfc3339(), content],
        )?;
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT value FROM session_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO session_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    async fn delete_state(&self, key: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM session_state WHERE key = ?1", [key])?;
        Ok(())
    }
}
