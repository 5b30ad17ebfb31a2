use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::RegistryError;
use crate::session::user::User;

/// In-memory table of logged-in users keyed by username.
/// Holds at most one live session per username. Empty at startup, never persisted.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    users: Arc<DashMap<String, Arc<User>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly logged-in user.
    pub fn add(&self, user: Arc<User>) -> Result<(), RegistryError> {
        match self.users.entry(user.name().to_string()) {
            Entry::Occupied(_) => Err(RegistryError::Conflict(user.name().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(user);
                Ok(())
            }
        }
    }

    /// Remove `user` if it is the registered session for its name.
    /// Returns whether anything was removed.
    pub fn remove(&self, user: &Arc<User>) -> bool {
        self.users
            .remove_if(user.name(), |_, live| Arc::ptr_eq(live, user))
            .is_some()
    }

    /// Unregister `user`, then log it out. While a name is registered its
    /// token is live, so a login racing the teardown never meets a
    /// logged-out session. Returns whether `user` was registered.
    pub fn end_session(&self, user: &Arc<User>) -> bool {
        let removed = self.remove(user);
        user.logout();
        removed
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<User>> {
        self.users.get(name).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::Token;

    #[test]
    fn test_add_find_remove() {
        let registry = SessionRegistry::new();
        let alice = User::new("alice", 1, "/");

        registry.add(alice.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.find_by_name("alice").unwrap(), &alice));

        assert!(registry.remove(&alice));
        assert!(!registry.remove(&alice));
        assert!(registry.is_empty());
        assert!(registry.find_by_name("alice").is_none());
    }

    #[test]
    fn test_duplicate_session_conflicts() {
        let registry = SessionRegistry::new();
        registry.add(User::new("alice", 1, "/")).unwrap();
        assert_eq!(
            registry.add(User::new("alice", 1, "/")),
            Err(RegistryError::Conflict("alice".to_string()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_session_unregisters_before_logout() {
        let registry = SessionRegistry::new();
        let alice = User::new("alice", 1, "/");
        alice.set_token(Token::from_bytes(b"0123456789abcdef".to_vec()));
        registry.add(alice.clone()).unwrap();
        let mut channel = alice.attach_channel(b"0123456789abcdef", "peer", 4).unwrap();

        let observer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                channel.closed().await;
                registry.find_by_name("alice").is_none()
            })
        };
        tokio::task::yield_now().await;

        assert!(registry.end_session(&alice));
        assert!(alice.is_logged_out());
        assert!(observer.await.unwrap(), "name still registered after logout was signalled");
        assert!(!registry.end_session(&alice));
    }

    #[test]
    fn test_remove_ignores_other_session_with_same_name() {
        let registry = SessionRegistry::new();
        let live = User::new("alice", 1, "/");
        let stale = User::new("alice", 1, "/");
        registry.add(live.clone()).unwrap();

        assert!(!registry.remove(&stale));
        assert_eq!(registry.len(), 1);
    }
}
