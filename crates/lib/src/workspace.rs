//! Workspace snapshot: the bot's own user id plus user and channel directories (id <-> name).
//!
//! Built by the transport on every (re)connect and swapped in wholesale; the dispatcher
//! reads a cheap `Arc` snapshot per message, so rules never observe a half-updated directory.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Bidirectional id <-> name map (users or channels).
#[derive(Debug, Clone, Default)]
pub struct Directory {
    id_to_name: HashMap<String, String>,
    name_to_id: HashMap<String, String>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry; a later entry with the same id or name overwrites the earlier one.
    pub fn insert(&mut self, id: impl Into<String>, name: impl Into<String>) {
        let id = id.into();
        let name = name.into();
        if let Some(old_name) = self.id_to_name.insert(id.clone(), name.clone()) {
            self.name_to_id.remove(&old_name);
        }
        if let Some(old_id) = self.name_to_id.insert(name, id) {
            self.id_to_name.remove(&old_id);
        }
    }

    pub fn name(&self, id: &str) -> Option<&str> {
        self.id_to_name.get(id).map(String::as_str)
    }

    pub fn id(&self, name: &str) -> Option<&str> {
        self.name_to_id.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.id_to_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_name.is_empty()
    }
}

impl<I, N> FromIterator<(I, N)> for Directory
where
    I: Into<String>,
    N: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (I, N)>>(iter: T) -> Self {
        let mut d = Directory::new();
        for (id, name) in iter {
            d.insert(id, name);
        }
        d
    }
}

/// Session state of the chat transport, as seen by rules.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    /// The bot's own user id; None until the transport has connected.
    pub bot_user_id: Option<String>,
    pub users: Directory,
    pub channels: Directory,
}

impl Workspace {
    /// Human-readable `#channel` / `@user` description of a message origin, for logs.
    pub fn describe(&self, channel: &str, sender: &str) -> String {
        let channel = self.channels.name(channel).unwrap_or(channel);
        let sender = self.users.name(sender).unwrap_or(sender);
        format!("#{} @{}", channel, sender)
    }
}

/// Shared handle to the current workspace snapshot.
#[derive(Debug, Clone, Default)]
pub struct SharedWorkspace {
    inner: Arc<RwLock<Arc<Workspace>>>,
}

impl SharedWorkspace {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(workspace))),
        }
    }

    pub async fn snapshot(&self) -> Arc<Workspace> {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, workspace: Workspace) {
        *self.inner.write().await = Arc::new(workspace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_insert_overwrites_both_sides() {
        let mut d = Directory::new();
        d.insert("C1", "general");
        d.insert("C1", "town-square");
        assert_eq!(d.name("C1"), Some("town-square"));
        assert_eq!(d.id("general"), None);
        assert_eq!(d.id("town-square"), Some("C1"));

        d.insert("C2", "town-square");
        assert_eq!(d.name("C1"), None);
        assert_eq!(d.id("town-square"), Some("C2"));
        assert_eq!(d.len(), 1);
    }

    #[tokio::test]
    async fn replace_swaps_whole_snapshot() {
        let shared = SharedWorkspace::default();
        let before = shared.snapshot().await;
        assert!(before.bot_user_id.is_none());

        shared
            .replace(Workspace {
                bot_user_id: Some("UBOT".into()),
                users: [("U1", "ana")].into_iter().collect(),
                channels: [("C1", "random")].into_iter().collect(),
            })
            .await;
        let after = shared.snapshot().await;
        assert_eq!(after.bot_user_id.as_deref(), Some("UBOT"));
        assert_eq!(after.describe("C1", "U1"), "#random @ana");
        assert_eq!(after.describe("C9", "U9"), "#C9 @U9");
        assert!(before.channels.is_empty());
    }
}
