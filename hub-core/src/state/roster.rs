//! The shared roster.
//!
//! The server owns the authoritative [`State`]; every client keeps a
//! mirror that it updates only from received roster events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::{Event, PeerId, User};

/// Server-wide settings carried alongside the roster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Plaintext join password; empty means none.
    pub password: String,
}

impl ServerSettings {
    pub fn requires_password(&self) -> bool {
        !self.password.is_empty()
    }

    /// Whether `candidate` may join under these settings.
    pub fn accepts_password(&self, candidate: &str) -> bool {
        !self.requires_password() || self.password == candidate
    }
}

/// Roster of connected users plus server settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    users: BTreeMap<PeerId, User>,
    pub server_settings: ServerSettings,
}

impl State {
    pub fn new(server_settings: ServerSettings) -> Self {
        Self {
            users: BTreeMap::new(),
            server_settings,
        }
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user(&self, id: &PeerId) -> Option<&User> {
        self.users.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.users.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn add_user(&mut self, user: User) {
        self.users.insert(user.id, user);
    }

    /// Replace the entry with the same id, inserting if there is none.
    /// Returns the previous entry.
    pub fn update_user(&mut self, user: User) -> Option<User> {
        let previous = self.users.remove(&user.id);
        self.users.insert(user.id, user);
        previous
    }

    pub fn remove_user(&mut self, id: &PeerId) -> Option<User> {
        self.users.remove(id)
    }

    /// Apply a replicated roster event.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::UserAdded(user) => self.add_user(user.clone()),
            Event::UserUpdated(user) => {
                self.update_user(user.clone());
            }
            Event::UserLeft(user) => {
                self.remove_user(&user.id);
            }
        }
    }

    /// Copy safe to hand to clients: the password itself is never sent.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.server_settings.requires_password() {
            copy.server_settings.password = REDACTED_PASSWORD.to_string();
        }
        copy
    }
}

/// Stands in for a configured password in snapshots sent to clients.
pub const REDACTED_PASSWORD: &str = "********";

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> User {
        User::new(PeerId::new(), name)
    }

    #[test]
    fn update_replaces_existing_entry() {
        let mut state = State::default();
        let alice = user("alice");
        state.add_user(alice.clone());

        let renamed = User::new(alice.id, "alice2");
        let previous = state.update_user(renamed.clone());
        assert_eq!(previous, Some(alice.clone()));
        assert_eq!(state.len(), 1);
        assert_eq!(state.user(&alice.id), Some(&renamed));
    }

    #[test]
    fn update_inserts_when_missing() {
        let mut state = State::default();
        state.add_user(user("alice"));
        let bob = user("bob");
        assert!(state.update_user(bob.clone()).is_none());
        assert_eq!(state.len(), 2);
        assert!(state.contains(&bob.id));
    }

    #[test]
    fn apply_mirrors_server_operations() {
        let mut state = State::default();
        let carol = user("carol");
        state.apply(&Event::UserAdded(carol.clone()));
        assert!(state.contains(&carol.id));

        let updated = User::new(carol.id, "caroline");
        state.apply(&Event::UserUpdated(updated.clone()));
        assert_eq!(state.user(&carol.id), Some(&updated));

        state.apply(&Event::UserLeft(updated));
        assert!(state.is_empty());
    }

    #[test]
    fn removing_unknown_user_is_noop() {
        let mut state = State::default();
        state.add_user(user("dave"));
        assert!(state.remove_user(&PeerId::new()).is_none());
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn password_checks() {
        let open = ServerSettings::default();
        assert!(open.accepts_password("anything"));

        let locked = ServerSettings {
            password: "hunter2".into(),
        };
        assert!(locked.accepts_password("hunter2"));
        assert!(!locked.accepts_password(""));
    }

    #[test]
    fn redacted_hides_password() {
        let state = State::new(ServerSettings {
            password: "hunter2".into(),
        });
        let copy = state.redacted();
        assert_ne!(copy.server_settings.password, "hunter2");
        assert!(copy.server_settings.requires_password());
        assert_eq!(State::default().redacted(), State::default());
    }
}
