//! Registry of active remote-forward listeners.
//!
//! The registry is shared by every connection of a daemon. Entries are keyed by
//! the (bind address, port) pair the client asked for, own the accept task
//! for that listener and remember the connection that created them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// Key of a forwarded listener: the bind address as requested and the bound port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    pub address: String,
    pub port: u32,
}

impl ListenerKey {
    pub fn new(address: impl Into<String>, port: u32) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

/// Identifies one daemon connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A running listener and the means to stop it.
#[derive(Debug)]
pub struct ListenerEntry {
    owner: ConnectionId,
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ListenerEntry {
    /// `task` must drop its listener once `stop` fires.
    pub fn new(
        owner: ConnectionId,
        local_addr: SocketAddr,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            owner,
            local_addr,
            stop: Some(stop),
            task,
        }
    }

    pub fn owner(&self) -> ConnectionId {
        self.owner
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal the accept task to stop without waiting for it.
    pub fn cancel(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Stop the accept task and wait until the listening socket is closed.
    pub async fn shutdown(mut self) {
        self.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for ListenerEntry {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Thread-safe map of forwarded listeners.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    entries: Mutex<HashMap<ListenerKey, ListenerEntry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns the entry back if the key is already taken.
    pub fn insert(&self, key: ListenerKey, entry: ListenerEntry) -> Result<(), ListenerEntry> {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            return Err(entry);
        }
        debug!("Registered listener {:?} on {}", key, entry.local_addr);
        entries.insert(key, entry);
        Ok(())
    }

    /// Remove a listener, handing it to the caller to shut down.
    pub fn remove(&self, key: &ListenerKey) -> Option<ListenerEntry> {
        self.lock().remove(key)
    }

    /// Remove every listener created by `owner`.
    pub fn remove_owned_by(&self, owner: ConnectionId) -> Vec<(ListenerKey, ListenerEntry)> {
        let mut entries = self.lock();
        let keys: Vec<ListenerKey> = entries
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
            .collect()
    }

    pub fn contains(&self, key: &ListenerKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ListenerKey, ListenerEntry>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    async fn spawn_listener() -> ListenerEntry {
        spawn_owned_listener(ConnectionId::next()).await
    }

    async fn spawn_owned_listener(owner: ConnectionId) -> ListenerEntry {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    accepted = listener.accept() => {
                        if accepted.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        ListenerEntry::new(owner, local_addr, stop_tx, task)
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let registry = ListenerRegistry::new();
        let key = ListenerKey::new("127.0.0.1", 8080);

        assert!(registry.insert(key.clone(), spawn_listener().await).is_ok());
        let rejected = registry.insert(key.clone(), spawn_listener().await);
        assert!(rejected.is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_unknown_key() {
        let registry = ListenerRegistry::new();
        assert!(registry.remove(&ListenerKey::new("127.0.0.1", 1)).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_listener() {
        let registry = ListenerRegistry::new();
        let entry = spawn_listener().await;
        let addr = entry.local_addr();
        let key = ListenerKey::new("127.0.0.1", addr.port() as u32);
        registry.insert(key.clone(), entry).unwrap();

        assert!(TcpStream::connect(addr).await.is_ok());

        registry.remove(&key).unwrap().shutdown().await;
        assert!(!registry.contains(&key));
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_inserts_for_distinct_keys() {
        let registry = Arc::new(ListenerRegistry::new());
        let mut tasks = Vec::new();
        for port in 0..16u32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let entry = spawn_listener().await;
                registry
                    .insert(ListenerKey::new("127.0.0.1", 9000 + port), entry)
                    .is_ok()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(registry.len(), 16);
    }

    #[tokio::test]
    async fn test_remove_owned_by_leaves_other_owners() {
        let registry = ListenerRegistry::new();
        let first = ConnectionId::next();
        let second = ConnectionId::next();
        let key = ListenerKey::new("127.0.0.1", 7000);

        registry.insert(key.clone(), spawn_owned_listener(first).await).unwrap();
        registry
            .insert(ListenerKey::new("127.0.0.1", 7001), spawn_owned_listener(first).await)
            .unwrap();

        // Another connection cancels the first forward and takes over its key.
        registry.remove(&key).unwrap().shutdown().await;
        registry.insert(key.clone(), spawn_owned_listener(second).await).unwrap();

        let removed = registry.remove_owned_by(first);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, ListenerKey::new("127.0.0.1", 7001));

        assert!(registry.contains(&key));
        assert!(registry.remove_owned_by(first).is_empty());
        assert_eq!(registry.remove(&key).unwrap().owner(), second);
    }
}
