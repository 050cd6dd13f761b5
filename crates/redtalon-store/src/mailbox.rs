//! Inter-agent mailbox.
//!
//! Agents communicate exclusively through typed messages persisted here:
//! workers report `task_complete` / `error` to the Team Lead, the lead sends
//! `terminate` and `intervention`, peers exchange `peer_request` /
//! `peer_response`.  Messages are delivered to a recipient in send order and
//! consumed exactly once — `receive` marks them read in the same
//! transaction that returns them.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The coordination vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskComplete,
    ValidationRequest,
    Intervention,
    Broadcast,
    PeerRequest,
    PeerResponse,
    Terminate,
    Error,
    CriticalFinding,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskComplete => "task_complete",
            Self::ValidationRequest => "validation_request",
            Self::Intervention => "intervention",
            Self::Broadcast => "broadcast",
            Self::PeerRequest => "peer_request",
            Self::PeerResponse => "peer_response",
            Self::Terminate => "terminate",
            Self::Error => "error",
            Self::CriticalFinding => "critical_finding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task_complete" => Some(Self::TaskComplete),
            "validation_request" => Some(Self::ValidationRequest),
            "intervention" => Some(Self::Intervention),
            "broadcast" => Some(Self::Broadcast),
            "peer_request" => Some(Self::PeerRequest),
            "peer_response" => Some(Self::PeerResponse),
            "terminate" => Some(Self::Terminate),
            "error" => Some(Self::Error),
            "critical_finding" => Some(Self::CriticalFinding),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delivered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Monotonic id assigned at send time; defines delivery order.
    pub id: i64,
    pub from: String,
    pub to: String,
    pub kind: MessageKind,
    /// Free-form payload.
    pub payload: Value,
    /// Unix timestamp (seconds) at send time.
    pub ts: i64,
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// SQLite-backed inter-agent message bus.
#[derive(Clone)]
pub struct Mailbox {
    db: Database,
    registered: std::sync::Arc<Mutex<HashSet<String>>>,
}

impl Mailbox {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            registered: std::sync::Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Register an agent so broadcasts reach it.
    pub fn register(&self, agent_id: impl Into<String>) {
        if let Ok(mut set) = self.registered.lock() {
            set.insert(agent_id.into());
        }
    }

    /// Remove an agent from broadcast membership.
    pub fn unregister(&self, agent_id: &str) {
        if let Ok(mut set) = self.registered.lock() {
            set.remove(agent_id);
        }
    }

    /// Send a message to one recipient.  Returns the message id.
    #[instrument(skip(self, payload))]
    pub async fn send(
        &self,
        from: &str,
        to: &str,
        kind: MessageKind,
        payload: Value,
    ) -> StoreResult<i64> {
        let from = from.to_string();
        let to = to.to_string();
        let payload = serde_json::to_string(&payload)?;
        let ts = Utc::now().timestamp();

        let id = self
            .db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO messages (from_agent, to_agent, kind, payload, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![from, to, kind.as_str(), payload, ts],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        debug!(message_id = id, kind = %kind, "message sent");
        Ok(id)
    }

    /// Send to every registered agent except the sender.  Returns the number
    /// of copies delivered.
    pub async fn broadcast(
        &self,
        from: &str,
        kind: MessageKind,
        payload: Value,
    ) -> StoreResult<usize> {
        let recipients: Vec<String> = self
            .registered
            .lock()
            .map_err(|e| StoreError::TaskJoin(format!("registry lock poisoned: {e}")))?
            .iter()
            .filter(|id| id.as_str() != from)
            .cloned()
            .collect();

        for recipient in &recipients {
            self.send(from, recipient, kind, payload.clone()).await?;
        }
        Ok(recipients.len())
    }

    /// Fetch all unread messages for `agent_id` in send order.
    ///
    /// With `mark_read`, the messages are marked read in the same
    /// transaction — a second call will not return them again.
    #[instrument(skip(self))]
    pub async fn receive(&self, agent_id: &str, mark_read: bool) -> StoreResult<Vec<AgentMessage>> {
        let agent_id = agent_id.to_string();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let rows: Vec<(i64, String, String, String, String, i64)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, from_agent, to_agent, kind, payload, ts FROM messages
                         WHERE to_agent = ?1 AND read_status = 0
                         ORDER BY id ASC",
                    )?;
                    let rows = stmt
                        .query_map(params![agent_id], |row| {
                            Ok((
                                row.get(0)?,
                                row.get(1)?,
                                row.get(2)?,
                                row.get(3)?,
                                row.get(4)?,
                                row.get(5)?,
                            ))
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };

                let mut messages = Vec::with_capacity(rows.len());
                for (id, from, to, kind, payload, ts) in rows {
                    let kind = MessageKind::parse(&kind).ok_or_else(|| StoreError::Corrupt {
                        entity: "message",
                        id: id.to_string(),
                        reason: format!("unknown kind '{kind}'"),
                    })?;
                    let payload: Value = serde_json::from_str(&payload)?;
                    messages.push(AgentMessage {
                        id,
                        from,
                        to,
                        kind,
                        payload,
                        ts,
                    });
                }

                if mark_read && !messages.is_empty() {
                    let ids = messages
                        .iter()
                        .map(|m| m.id.to_string())
                        .collect::<Vec<_>>()
                        .join(",");
                    tx.execute(
                        &format!("UPDATE messages SET read_status = 1 WHERE id IN ({ids})"),
                        [],
                    )?;
                }
                tx.commit()?;

                Ok(messages)
            })
            .await
    }

    /// Whether `agent_id` has unread messages.
    pub async fn has_messages(&self, agent_id: &str) -> StoreResult<bool> {
        Ok(self.count(agent_id).await? > 0)
    }

    /// Count of unread messages for `agent_id`.
    pub async fn count(&self, agent_id: &str) -> StoreResult<i64> {
        let agent_id = agent_id.to_string();
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT count(*) FROM messages WHERE to_agent = ?1 AND read_status = 0",
                    params![agent_id],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }

    /// Delete all messages (fresh engagement).
    pub async fn reset(&self) -> StoreResult<()> {
        self.db
            .execute(|conn| {
                conn.execute("DELETE FROM messages", [])?;
                Ok(())
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
