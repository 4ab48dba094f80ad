use std::collections::HashMap;

use tokio::sync::RwLock;

pub type ConnectionId = String;

/// Live mapping of username -> active connection. Owned by the server and
/// injected into handlers; never a process-wide singleton.
///
/// A username maps to exactly one connection. A second login for the same
/// name overwrites the first (last write wins); the earlier connection is
/// left orphaned, not closed.
#[derive(Default)]
pub struct Presence {
    entries: RwLock<HashMap<String, ConnectionId>>,
}

impl Presence {
    pub fn new() -> Self {
        Presence::default()
    }

    /// Registers `username` on `conn_id`, returning the connection it
    /// displaced, if any.
    pub async fn login(&self, username: &str, conn_id: &str) -> Option<ConnectionId> {
        let mut entries = self.entries.write().await;
        entries.insert(username.to_string(), conn_id.to_string())
    }

    /// No-op if the username was never logged in.
    pub async fn logout(&self, username: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(username);
    }

    /// Disconnect path: removes the entry for `username` only while it still
    /// points at `conn_id`. A newer login from another connection keeps its
    /// entry untouched.
    pub async fn logout_connection(&self, username: &str, conn_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        if entries.get(username).is_some_and(|current| current.as_str() == conn_id) {
            entries.remove(username);
            true
        } else {
            false
        }
    }

    /// Absent means offline or unknown; callers branch, nothing throws.
    pub async fn lookup(&self, username: &str) -> Option<ConnectionId> {
        let entries = self.entries.read().await;
        entries.get(username).cloned()
    }

    pub async fn list_all(&self) -> HashMap<String, ConnectionId> {
        let entries = self.entries.read().await;
        entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn login_then_lookup() {
        let presence = Presence::new();
        presence.login("sjur", "conn-1").await;
        assert_eq!(presence.lookup("sjur").await.as_deref(), Some("conn-1"));
        assert!(presence.lookup("nobody").await.is_none());
    }

    #[tokio::test]
    async fn second_login_overwrites_first() {
        let presence = Presence::new();
        assert!(presence.login("sjur", "conn-1").await.is_none());
        let displaced = presence.login("sjur", "conn-2").await;
        assert_eq!(displaced.as_deref(), Some("conn-1"));
        // Only the second connection is reachable; the first is orphaned.
        assert_eq!(presence.lookup("sjur").await.as_deref(), Some("conn-2"));
    }

    #[tokio::test]
    async fn logout_unknown_user_is_noop() {
        let presence = Presence::new();
        presence.logout("ghost").await;
        assert!(presence.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_only_clears_own_entry() {
        let presence = Presence::new();
        presence.login("sjur", "conn-1").await;
        presence.login("sjur", "conn-2").await;

        // The stale socket's teardown must not log out the fresh session.
        assert!(!presence.logout_connection("sjur", "conn-1").await);
        assert_eq!(presence.lookup("sjur").await.as_deref(), Some("conn-2"));

        assert!(presence.logout_connection("sjur", "conn-2").await);
        assert!(presence.lookup("sjur").await.is_none());
    }
}
