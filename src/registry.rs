//! Session registry: the only mutable map tying transport sessions to users.
//!
//! Transport handlers speak in session ids, storage speaks in user ids;
//! every cross-cutting operation resolves one to the other here. A user may
//! hold several live sessions (multiple tabs/devices); presence flips only
//! on the first registration and the last unregistration.

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a session to a user. Idempotent per session id. Returns `true`
    /// when this is the user's first live session (presence just came up).
    pub fn register(&self, session_id: &str, user_id: Uuid, username: &str) -> bool {
        let had_other = self.has_session_for(user_id, Some(session_id));
        self.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                user_id,
                username: username.to_string(),
            },
        );
        !had_other
    }

    /// Drop a session. Returns the entry plus `true` when it was the user's
    /// last live session (presence just went down).
    pub fn unregister(&self, session_id: &str) -> Option<(SessionEntry, bool)> {
        let (_, entry) = self.sessions.remove(session_id)?;
        let was_last = !self.has_session_for(entry.user_id, None);
        Some((entry, was_last))
    }

    /// Any one live session id for the user; iteration order tie-break.
    pub fn session_of(&self, user_id: Uuid) -> Option<String> {
        self.sessions
            .iter()
            .find(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.key().clone())
    }

    /// Every live session id for the user, for exactly-once fan-out.
    pub fn sessions_of(&self, user_id: Uuid) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn user_of(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn contains_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Distinct online users, for the `users_online` snapshot.
    pub fn online_users(&self) -> Vec<OnlineUser> {
        let mut out: Vec<OnlineUser> = Vec::new();
        for entry in self.sessions.iter() {
            if !out.iter().any(|u| u.user_id == entry.value().user_id) {
                out.push(OnlineUser {
                    user_id: entry.value().user_id,
                    username: entry.value().username.clone(),
                });
            }
        }
        out
    }

    fn has_session_for(&self, user_id: Uuid, excluding: Option<&str>) -> bool {
        self.sessions.iter().any(|entry| {
            entry.value().user_id == user_id && excluding != Some(entry.key().as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_resolve_both_ways() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();

        assert!(registry.register("s1", user, "alice"));
        assert_eq!(registry.session_of(user).as_deref(), Some("s1"));
        assert_eq!(registry.user_of("s1").unwrap().username, "alice");
    }

    #[test]
    fn second_session_does_not_flip_presence() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();

        assert!(registry.register("s1", user, "alice"));
        assert!(!registry.register("s2", user, "alice"));

        let (_, was_last) = registry.unregister("s1").unwrap();
        assert!(!was_last);
        let (_, was_last) = registry.unregister("s2").unwrap();
        assert!(was_last);
        assert!(registry.session_of(user).is_none());
    }

    #[test]
    fn re_register_same_session_is_idempotent() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();

        assert!(registry.register("s1", user, "alice"));
        // Same session re-announcing itself is still the only session.
        assert!(registry.register("s1", user, "alice"));
        assert_eq!(registry.online_users().len(), 1);
    }

    #[test]
    fn online_snapshot_dedups_users() {
        let registry = SessionRegistry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        registry.register("s1", alice, "alice");
        registry.register("s2", alice, "alice");
        registry.register("s3", bob, "bob");

        let online = registry.online_users();
        assert_eq!(online.len(), 2);
    }

    #[test]
    fn unknown_session_unregister_is_none() {
        let registry = SessionRegistry::new();
        assert!(registry.unregister("nope").is_none());
    }
}
