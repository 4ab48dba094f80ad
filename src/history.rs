use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("chat log backend unavailable: {0}")]
    Backend(String),
}

/// A persisted chat message. Lobby chat uses the reserved room id.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub message_id: String,
    pub room_id: String,
    pub user_id: String,
    pub body: String,
    pub timestamp_ms: i64,
}

/// Boundary to the chat-log store. The core only depends on this contract;
/// persistence internals (tables, pooling) stay behind it. A failing append
/// is logged by callers and never blocks the broadcast.
#[async_trait]
pub trait ChatHistory: Send + Sync {
    /// Append-only insert.
    async fn append(&self, record: ChatRecord) -> Result<(), HistoryError>;

    /// Most-recent-first, bounded to the configured window.
    async fn retrieve(&self, room_id: &str) -> Result<Vec<ChatRecord>, HistoryError>;

    /// Caps retained records for a high-volume room, evicting oldest first.
    async fn trim(&self, room_id: &str) -> Result<(), HistoryError>;

    /// Drops every record for a room; used by room closure.
    async fn delete_all(&self, room_id: &str) -> Result<(), HistoryError>;
}

/// In-process chat log, per-room append order doubling as timestamp order.
pub struct MemoryChatLog {
    logs: RwLock<HashMap<String, Vec<ChatRecord>>>,
    window: usize,
    retain: usize,
}

impl MemoryChatLog {
    pub fn new(window: usize, retain: usize) -> Self {
        MemoryChatLog {
            logs: RwLock::new(HashMap::new()),
            window,
            retain,
        }
    }
}

#[async_trait]
impl ChatHistory for MemoryChatLog {
    async fn append(&self, record: ChatRecord) -> Result<(), HistoryError> {
        let mut logs = self.logs.write().await;
        logs.entry(record.room_id.clone()).or_default().push(record);
        Ok(())
    }

    async fn retrieve(&self, room_id: &str) -> Result<Vec<ChatRecord>, HistoryError> {
        let logs = self.logs.read().await;
        let records = logs
            .get(room_id)
            .map(|records| records.iter().rev().take(self.window).cloned().collect())
            .unwrap_or_default();
        Ok(records)
    }

    async fn trim(&self, room_id: &str) -> Result<(), HistoryError> {
        let mut logs = self.logs.write().await;
        if let Some(records) = logs.get_mut(room_id) {
            if records.len() > self.retain {
                let excess = records.len() - self.retain;
                records.drain(..excess);
            }
        }
        Ok(())
    }

    async fn delete_all(&self, room_id: &str) -> Result<(), HistoryError> {
        let mut logs = self.logs.write().await;
        logs.remove(room_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(room: &str, n: i64) -> ChatRecord {
        ChatRecord {
            message_id: format!("msg-{n}"),
            room_id: room.to_string(),
            user_id: "sjur".to_string(),
            body: format!("message {n}"),
            timestamp_ms: n,
        }
    }

    #[tokio::test]
    async fn retrieve_is_newest_first_and_bounded() {
        let log = MemoryChatLog::new(25, 200);
        for n in 0..40 {
            log.append(record("AB12", n)).await.unwrap();
        }

        let records = log.retrieve("AB12").await.unwrap();
        assert_eq!(records.len(), 25);
        assert_eq!(records[0].timestamp_ms, 39);
        assert!(records
            .windows(2)
            .all(|pair| pair[0].timestamp_ms >= pair[1].timestamp_ms));
    }

    #[tokio::test]
    async fn retrieve_unknown_room_is_empty() {
        let log = MemoryChatLog::new(25, 200);
        assert!(log.retrieve("ZZZZ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trim_evicts_oldest_first() {
        let log = MemoryChatLog::new(25, 200);
        for n in 0..250 {
            log.append(record("lobby", n)).await.unwrap();
            log.trim("lobby").await.unwrap();
        }

        let logs = log.logs.read().await;
        let records = logs.get("lobby").unwrap();
        assert_eq!(records.len(), 200);
        assert_eq!(records.first().unwrap().timestamp_ms, 50);
        assert_eq!(records.last().unwrap().timestamp_ms, 249);
    }

    #[tokio::test]
    async fn delete_all_scopes_to_one_room() {
        let log = MemoryChatLog::new(25, 200);
        log.append(record("AB12", 1)).await.unwrap();
        log.append(record("CD34", 2)).await.unwrap();

        log.delete_all("AB12").await.unwrap();
        assert!(log.retrieve("AB12").await.unwrap().is_empty());
        assert_eq!(log.retrieve("CD34").await.unwrap().len(), 1);
    }
}
