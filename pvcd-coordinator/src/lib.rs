//! Coordination Store Client: a thin wrapper over a hierarchical key-value
//! store (ZooKeeper) giving read/write/create/delete/list-children/
//! transaction/advisory-lock plus data and children watches.
//!
//! Watch callbacks dispatch onto a short-lived worker task per watch (spawned
//! by [`Coordinator::watch_data`]/[`watch_children`](Coordinator::watch_children))
//! so the session's own event loop never blocks; the callback itself must
//! stay cheap and hand heavy work off to its own channel. A callback returning
//! [`WatchAction::Stop`] (or observing [`WatchEvent::Deleted`]) tears the
//! watch task down. Session loss surfaces as a single [`WatchEvent::Expired`]
//! on the state watcher; callers are expected to treat it as fatal and
//! restart the node process, per the contract in the node supervisor.

use std::time::Duration;

use thiserror::Error;
use zookeeper_client as zk;

/// Taxonomy matching the cluster's error handling design: distinguishes
/// errors a caller should retry with backoff from ones that mean "this
/// command makes no sense" or "this node must die".
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("transient coordination-store error: {0}")]
    Transient(#[source] zk::Error),
    #[error("requested key does not exist")]
    NoNode,
    #[error("key already exists")]
    NodeExists,
    #[error("version mismatch on write")]
    BadVersion,
    #[error("coordination-store session expired, node must restart")]
    SessionLost,
    #[error("coordination-store error: {0}")]
    Other(#[source] zk::Error),
}

impl From<zk::Error> for CoordinationError {
    fn from(err: zk::Error) -> Self {
        match err {
            zk::Error::NoNode => CoordinationError::NoNode,
            zk::Error::NodeExists => CoordinationError::NodeExists,
            zk::Error::BadVersion => CoordinationError::BadVersion,
            zk::Error::SessionExpired => CoordinationError::SessionLost,
            zk::Error::ConnectionLoss | zk::Error::Timeout | zk::Error::Throttled => {
                CoordinationError::Transient(err)
            }
            other => CoordinationError::Other(other),
        }
    }
}

impl From<zk::MultiWriteError> for CoordinationError {
    fn from(err: zk::MultiWriteError) -> Self {
        match err {
            zk::MultiWriteError::RequestFailed { source } => source.into(),
            zk::MultiWriteError::OperationFailed { source, .. } => source.into(),
        }
    }
}

/// The coordination-store surface controllers depend on, so tests can
/// substitute an in-memory [`FakeStore`] for the real ZooKeeper-backed
/// [`Coordinator`] (spec §9: "pass an explicit context object... tests
/// substitute fakes").
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError>;
    async fn write(&self, key: &str, value: &[u8]) -> Result<(), CoordinationError>;
    async fn compare_and_swap(&self, key: &str, expected: &[u8], new: &[u8]) -> Result<bool, CoordinationError>;
    async fn create(
        &self,
        key: &str,
        value: &[u8],
        ephemeral: bool,
        sequential: bool,
    ) -> Result<String, CoordinationError>;
    async fn delete(&self, key: &str, recursive: bool) -> Result<(), CoordinationError>;
    async fn list_children(&self, key: &str) -> Result<Vec<String>, CoordinationError>;
    async fn transaction(&self, ops: Vec<TransactionOp<'_>>) -> Result<(), CoordinationError>;
}

/// A single operation within an atomic [`Coordinator::transaction`] call.
/// Updating a domain's `node` and `state` together (spec §5: "it MUST update
/// `/node` and `/state` in a single transaction") goes through this.
pub enum TransactionOp<'a> {
    SetData { path: &'a str, value: &'a [u8] },
    Create { path: &'a str, value: &'a [u8], ephemeral: bool },
    Delete { path: &'a str },
}

/// Node-or-session event delivered to a watch task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
    /// The session expired; the watch task tears itself down after
    /// delivering this once.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Continue,
    Stop,
}

/// A scoped advisory lock. Released when dropped, mirroring the ephemeral
/// release-on-crash semantics the command queue relies on (spec §4.5:
/// "a handler crash releases the ephemeral lock automatically").
pub struct LockGuard {
    _inner: zk::OwnedLockClient,
}

pub struct Coordinator {
    client: zk::Client,
}

impl Coordinator {
    /// Connects to the coordination store ensemble at `connect_string`
    /// (`host1:port,host2:port/chroot`), waiting up to `session_timeout`.
    pub async fn connect(connect_string: &str, session_timeout: Duration) -> Result<Self, CoordinationError> {
        let client = zk::Client::connector()
            .with_session_timeout(session_timeout)
            .connect(connect_string)
            .await?;
        Ok(Self { client })
    }

    /// Reads the raw value at `key`, or `None` if it does not exist.
    pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        match self.client.get_data(key).await {
            Ok((data, _stat)) => Ok(Some(data)),
            Err(zk::Error::NoNode) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically swaps `key`'s value from `expected` to `new`: reads the
    /// current value and version, and if it still matches `expected`,
    /// writes `new` conditioned on that version. Returns `Ok(false)` rather
    /// than an error if another writer won the race (stale read, or a
    /// concurrent `BadVersion` on the conditional write) — the caller
    /// decides what losing an election means, this just reports the
    /// outcome (spec §4.3: "contend... via a compare-and-swap").
    pub async fn compare_and_swap(&self, key: &str, expected: &[u8], new: &[u8]) -> Result<bool, CoordinationError> {
        let (data, stat) = match self.client.get_data(key).await {
            Ok(v) => v,
            Err(zk::Error::NoNode) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if data != expected {
            return Ok(false);
        }
        match self.client.set_data(key, new, Some(stat.version)).await {
            Ok(_stat) => Ok(true),
            Err(zk::Error::BadVersion) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes `value` at `key`, creating a persistent node if it does not
    /// already exist.
    pub async fn write(&self, key: &str, value: &[u8]) -> Result<(), CoordinationError> {
        match self.client.set_data(key, value, None).await {
            Ok(_stat) => Ok(()),
            Err(zk::Error::NoNode) => {
                self.client
                    .mkdir(key, &zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all()))
                    .await?;
                self.client.set_data(key, value, None).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Creates `key` with `value`. Fails with [`CoordinationError::NodeExists`]
    /// if it is already present.
    pub async fn create(
        &self,
        key: &str,
        value: &[u8],
        ephemeral: bool,
        sequential: bool,
    ) -> Result<String, CoordinationError> {
        let mode = match (ephemeral, sequential) {
            (false, false) => zk::CreateMode::Persistent,
            (false, true) => zk::CreateMode::PersistentSequential,
            (true, false) => zk::CreateMode::Ephemeral,
            (true, true) => zk::CreateMode::EphemeralSequential,
        };
        let options = mode.with_acls(zk::Acls::anyone_all());
        let (_stat, sequence) = self.client.create(key, value, &options).await?;
        Ok(if sequential {
            format!("{key}{sequence}")
        } else {
            key.to_string()
        })
    }

    /// Deletes `key`. If `recursive`, children are removed first (the store
    /// itself requires an empty node before deletion).
    pub async fn delete(&self, key: &str, recursive: bool) -> Result<(), CoordinationError> {
        if recursive {
            for child in self.list_children(key).await? {
                Box::pin(self.delete(&format!("{key}/{child}"), true)).await?;
            }
        }
        match self.client.delete(key, None).await {
            Ok(()) | Err(zk::Error::NoNode) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_children(&self, key: &str) -> Result<Vec<String>, CoordinationError> {
        match self.client.list_children(key).await {
            Ok(children) => Ok(children),
            Err(zk::Error::NoNode) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Applies `ops` as a single atomic multi-op. Used whenever two fields
    /// of the same entity must change together, e.g. migrating a domain's
    /// `node` and `state` (spec §5).
    pub async fn transaction(&self, ops: Vec<TransactionOp<'_>>) -> Result<(), CoordinationError> {
        let mut writer = self.client.new_multi_writer();
        for op in &ops {
            match op {
                TransactionOp::SetData { path, value } => {
                    writer.add_set_data(path, value, None)?;
                }
                TransactionOp::Create { path, value, ephemeral } => {
                    let mode = if *ephemeral {
                        zk::CreateMode::Ephemeral
                    } else {
                        zk::CreateMode::Persistent
                    };
                    writer.add_create(path, value, &mode.with_acls(zk::Acls::anyone_all()))?;
                }
                TransactionOp::Delete { path } => {
                    writer.add_delete(path, None)?;
                }
            }
        }
        writer.commit().await?;
        Ok(())
    }

    /// Acquires an advisory lock scoped under `lock_dir` (spec §4.5 command
    /// queue, §4.6 "only one node performs fencing"). Released on drop.
    pub async fn lock(&self, lock_dir: &str) -> Result<LockGuard, CoordinationError> {
        let prefix = zk::LockPrefix::new_curator(lock_dir, "lock-")?;
        let options = zk::LockOptions::new(zk::Acls::anyone_all());
        let owned = self.client.lock(prefix, b"", options).await?.into_owned();
        Ok(LockGuard { _inner: owned })
    }

    /// Spawns a task that watches `key` for data changes and session loss,
    /// invoking `on_event` for each. Rearms automatically after every
    /// delivered event except [`WatchEvent::Deleted`] and
    /// [`WatchEvent::Expired`], or whenever `on_event` returns
    /// [`WatchAction::Stop`].
    pub fn watch_data<F>(&self, key: &str, mut on_event: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(WatchEvent) -> WatchAction + Send + 'static,
    {
        let client = self.client.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            loop {
                let watcher = match client.get_and_watch_data(&key).await {
                    Ok((_data, _stat, watcher)) => watcher,
                    Err(zk::Error::NoNode) => {
                        if on_event(WatchEvent::Deleted) == WatchAction::Stop {
                            return;
                        }
                        // Keep polling for the node to reappear; a watch on an
                        // absent node has nothing to attach to.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    Err(zk::Error::SessionExpired) => {
                        on_event(WatchEvent::Expired);
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(key, %err, "failed to arm data watch, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let event = watcher.changed().await;
                let action = match event.event_type {
                    zk::EventType::NodeDeleted => on_event(WatchEvent::Deleted),
                    zk::EventType::NodeDataChanged | zk::EventType::NodeCreated => {
                        on_event(WatchEvent::DataChanged)
                    }
                    zk::EventType::Session if event.session_state == zk::SessionState::Expired => {
                        on_event(WatchEvent::Expired);
                        return;
                    }
                    _ => WatchAction::Continue,
                };

                if matches!(event.event_type, zk::EventType::NodeDeleted) || action == WatchAction::Stop {
                    return;
                }
            }
        })
    }

    /// Spawns a task that watches `key`'s children, invoking `on_event` on
    /// every change. Same rearm/teardown contract as [`Self::watch_data`].
    pub fn watch_children<F>(&self, key: &str, mut on_event: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(WatchEvent) -> WatchAction + Send + 'static,
    {
        let client = self.client.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            loop {
                let watcher = match client.get_and_watch_children(&key).await {
                    Ok((_children, _stat, watcher)) => watcher,
                    Err(zk::Error::NoNode) => {
                        if on_event(WatchEvent::Deleted) == WatchAction::Stop {
                            return;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    Err(zk::Error::SessionExpired) => {
                        on_event(WatchEvent::Expired);
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(key, %err, "failed to arm children watch, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let event = watcher.changed().await;
                let action = match event.event_type {
                    zk::EventType::NodeDeleted => on_event(WatchEvent::Deleted),
                    zk::EventType::NodeChildrenChanged => on_event(WatchEvent::ChildrenChanged),
                    zk::EventType::Session if event.session_state == zk::SessionState::Expired => {
                        on_event(WatchEvent::Expired);
                        return;
                    }
                    _ => WatchAction::Continue,
                };

                if matches!(event.event_type, zk::EventType::NodeDeleted) || action == WatchAction::Stop {
                    return;
                }
            }
        })
    }

    /// Spawns a task that watches the session itself, calling `on_expired`
    /// exactly once when the session is irrecoverably lost. This is the
    /// node supervisor's trigger to self-restart (spec §4.1, §5).
    pub fn session_state_listener<F>(&self, on_expired: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut watcher = self.client.state_watcher();
        tokio::spawn(async move {
            loop {
                let state = watcher.changed().await;
                if state.is_terminated() {
                    on_expired();
                    return;
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl CoordinationStore for Coordinator {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        Coordinator::read(self, key).await
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), CoordinationError> {
        Coordinator::write(self, key, value).await
    }

    async fn compare_and_swap(&self, key: &str, expected: &[u8], new: &[u8]) -> Result<bool, CoordinationError> {
        Coordinator::compare_and_swap(self, key, expected, new).await
    }

    async fn create(
        &self,
        key: &str,
        value: &[u8],
        ephemeral: bool,
        sequential: bool,
    ) -> Result<String, CoordinationError> {
        Coordinator::create(self, key, value, ephemeral, sequential).await
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), CoordinationError> {
        Coordinator::delete(self, key, recursive).await
    }

    async fn list_children(&self, key: &str) -> Result<Vec<String>, CoordinationError> {
        Coordinator::list_children(self, key).await
    }

    async fn transaction(&self, ops: Vec<TransactionOp<'_>>) -> Result<(), CoordinationError> {
        Coordinator::transaction(self, ops).await
    }
}

/// An in-memory [`CoordinationStore`] used in tests in place of a live
/// ZooKeeper ensemble. Children are derived from key prefixes rather than
/// tracked as a real hierarchy, which is enough to exercise controller
/// reconciliation logic without a server.
pub struct FakeStore {
    entries: std::sync::Mutex<std::collections::BTreeMap<String, Vec<u8>>>,
}

impl Default for FakeStore {
    fn default() -> Self {
        Self {
            entries: std::sync::Mutex::new(std::collections::BTreeMap::new()),
        }
    }
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, key: &str, value: &[u8]) {
        self.entries.lock().unwrap().insert(key.to_string(), value.to_vec());
    }
}

#[async_trait::async_trait]
impl CoordinationStore for FakeStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), CoordinationError> {
        self.entries.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn compare_and_swap(&self, key: &str, expected: &[u8], new: &[u8]) -> Result<bool, CoordinationError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).map(Vec::as_slice) != Some(expected) {
            return Ok(false);
        }
        entries.insert(key.to_string(), new.to_vec());
        Ok(true)
    }

    async fn create(
        &self,
        key: &str,
        value: &[u8],
        _ephemeral: bool,
        _sequential: bool,
    ) -> Result<String, CoordinationError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(key) {
            return Err(CoordinationError::NodeExists);
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(key.to_string())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), CoordinationError> {
        let mut entries = self.entries.lock().unwrap();
        if recursive {
            let prefix = format!("{key}/");
            entries.retain(|k, _| !k.starts_with(&prefix) && k != key);
        } else {
            entries.remove(key);
        }
        Ok(())
    }

    async fn list_children(&self, key: &str) -> Result<Vec<String>, CoordinationError> {
        let prefix = format!("{key}/");
        let entries = self.entries.lock().unwrap();
        let mut children: Vec<String> = entries
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(|s| s.to_string())
            .collect();
        children.sort();
        children.dedup();
        Ok(children)
    }

    async fn transaction(&self, ops: Vec<TransactionOp<'_>>) -> Result<(), CoordinationError> {
        let mut entries = self.entries.lock().unwrap();
        for op in ops {
            match op {
                TransactionOp::SetData { path, value } => {
                    entries.insert(path.to_string(), value.to_vec());
                }
                TransactionOp::Create { path, value, .. } => {
                    if entries.contains_key(path) {
                        return Err(CoordinationError::NodeExists);
                    }
                    entries.insert(path.to_string(), value.to_vec());
                }
                TransactionOp::Delete { path } => {
                    entries.remove(path);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_no_node_to_coordination_error() {
        let err: CoordinationError = zk::Error::NoNode.into();
        assert!(matches!(err, CoordinationError::NoNode));
    }

    #[test]
    fn maps_connection_loss_to_transient() {
        let err: CoordinationError = zk::Error::ConnectionLoss.into();
        assert!(matches!(err, CoordinationError::Transient(_)));
    }

    #[test]
    fn maps_session_expired_to_session_lost() {
        let err: CoordinationError = zk::Error::SessionExpired.into();
        assert!(matches!(err, CoordinationError::SessionLost));
    }

    #[tokio::test]
    async fn fake_store_round_trips_and_lists_children() {
        let store = FakeStore::new();
        store.write("/nodes/hv1/daemon_state", b"run").await.unwrap();
        store.write("/nodes/hv2/daemon_state", b"run").await.unwrap();
        assert_eq!(
            store.read("/nodes/hv1/daemon_state").await.unwrap(),
            Some(b"run".to_vec())
        );
        let mut children = store.list_children("/nodes").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["hv1".to_string(), "hv2".to_string()]);
    }

    #[tokio::test]
    async fn fake_store_transaction_applies_all_ops_together() {
        let store = FakeStore::new();
        store
            .transaction(vec![
                TransactionOp::SetData {
                    path: "/domains/u/node",
                    value: b"hv2",
                },
                TransactionOp::SetData {
                    path: "/domains/u/state",
                    value: b"migrate",
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.read("/domains/u/node").await.unwrap(), Some(b"hv2".to_vec()));
        assert_eq!(store.read("/domains/u/state").await.unwrap(), Some(b"migrate".to_vec()));
    }
}
