//! Object-store interface and the in-memory cluster used for tests.
//!
//! [`ObjectStore`] is the seam between the generation coordinator and a real
//! distributed store. It deliberately exposes only what the coordinator
//! consumes: versioned reads and compare-and-swap writes on single objects,
//! exclusive creation, object maintenance, and a watch/notify channel.
//!
//! [`MemoryObjectStore`] implements the full surface (including the FIFO and
//! OMAP-log client traits from the sibling modules) against an in-process
//! cluster and is what the workspace tests run on.

use crate::error::{Error, Result};
use crate::version::ObjectVersion;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Notification callbacks delivered to a registered watcher.
///
/// A sink is registered with [`ObjectStore::watch`] and held weakly by the
/// store, so dropping the owner revokes delivery without an explicit
/// unwatch.
#[async_trait]
pub trait WatchSink: Send + Sync {
    /// A notify fired on the watched object. Implementations must
    /// acknowledge via [`ObjectStore::notify_ack`].
    async fn handle_notify(&self, notify_id: u64, cookie: u64, notifier_id: u64, payload: Vec<u8>);

    /// The watch was torn down by the server or the connection.
    async fn handle_error(&self, cookie: u64, err: Error);
}

/// A distributed object store, reduced to the capabilities the generation
/// coordinator needs.
#[async_trait]
pub trait ObjectStore: Debug + Send + Sync {
    /// Identity of this handle, reported as `notifier_id` for notifies it
    /// sends. Watchers use it to recognize self-notifications.
    fn instance_id(&self) -> u64;

    /// Read the object body and its current version.
    ///
    /// The store asserts `stored.ver >= floor.ver` before returning, so a
    /// successful read never yields a version below one already observed.
    /// A violation surfaces as [`Error::Canceled`].
    async fn read_versioned(
        &self,
        oid: &str,
        floor: &ObjectVersion,
    ) -> Result<(Vec<u8>, ObjectVersion)>;

    /// Overwrite the object body if the stored version equals `held`
    /// exactly, atomically incrementing the stored counter. A mismatch is a
    /// CAS miss, surfaced as [`Error::Canceled`].
    async fn write_versioned(&self, oid: &str, body: &[u8], held: &ObjectVersion) -> Result<()>;

    /// Create the object with an initial body and version. Losing a
    /// creation race surfaces as [`Error::AlreadyExists`].
    async fn create_versioned(&self, oid: &str, body: &[u8], version: &ObjectVersion)
        -> Result<()>;

    /// Remove an object. Removing a missing object is [`Error::NotFound`].
    async fn remove(&self, oid: &str) -> Result<()>;

    /// Clear every key in the object's key-value area.
    async fn omap_clear(&self, oid: &str) -> Result<()>;

    /// Replace the OMAP header. Empty bytes reset it.
    async fn omap_set_header(&self, oid: &str, header: Vec<u8>) -> Result<()>;

    /// Truncate object data to `size` bytes.
    async fn truncate(&self, oid: &str, size: u64) -> Result<()>;

    /// Register `sink` for notifications on `oid`. Returns the watch cookie.
    async fn watch(&self, oid: &str, sink: Arc<dyn WatchSink>) -> Result<u64>;

    /// Revoke a watch registration.
    async fn unwatch(&self, cookie: u64) -> Result<()>;

    /// Send a notification to every watcher of `oid` and collect their
    /// acknowledgements within `timeout`.
    async fn notify(&self, oid: &str, payload: Vec<u8>, timeout: Duration) -> Result<()>;

    /// Acknowledge a received notification.
    async fn notify_ack(&self, oid: &str, notify_id: u64, cookie: u64, reply: Vec<u8>)
        -> Result<()>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// FIFO metadata carried on a FIFO's head object.
///
/// Lives in the object's key-value area: clearing the OMAP destroys it.
#[derive(Debug, Clone)]
pub(crate) struct FifoState {
    pub(crate) tail_part_num: i64,
    pub(crate) head_part_num: i64,
}

/// One stored object: data, key-value area, version, and (for FIFO heads
/// and parts) the FIFO bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct ObjectState {
    pub(crate) data: Vec<u8>,
    pub(crate) omap_header: Vec<u8>,
    pub(crate) omap: BTreeMap<String, Vec<u8>>,
    pub(crate) version: ObjectVersion,
    pub(crate) fifo: Option<FifoState>,
    pub(crate) fifo_entries: Vec<crate::fifo::FifoEntry>,
}

struct WatchRegistration {
    oid: String,
    sink: Weak<dyn WatchSink>,
}

impl Debug for WatchRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRegistration")
            .field("oid", &self.oid)
            .finish()
    }
}

/// A recorded notify acknowledgement, exposed for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyAck {
    pub notify_id: u64,
    pub cookie: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ClusterState {
    pub(crate) objects: Mutex<HashMap<String, ObjectState>>,
    watches: Mutex<HashMap<u64, WatchRegistration>>,
    acks: Mutex<Vec<NotifyAck>>,
    next_cookie: AtomicU64,
    next_notify_id: AtomicU64,
    next_instance_id: AtomicU64,
}

/// A complete in-memory object store for tests.
///
/// One `MemoryObjectStore` is a handle onto a shared cluster; [`handle`]
/// mints a new handle with its own instance id, the way independent clients
/// connect to the same backing store. Cloning keeps the instance id.
///
/// Notifications are delivered inline: `notify` invokes every live watcher
/// and returns once all have run, so the reply-timeout budget is accepted
/// but never exceeded here.
///
/// [`handle`]: MemoryObjectStore::handle
#[derive(Clone)]
pub struct MemoryObjectStore {
    pub(crate) cluster: Arc<ClusterState>,
    instance_id: u64,
}

impl Debug for MemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryObjectStore")
            .field("instance_id", &self.instance_id)
            .field("object_count", &self.cluster.objects.lock().len())
            .finish()
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    /// Create a fresh cluster with this as its first handle.
    pub fn new() -> Self {
        let cluster = Arc::new(ClusterState::default());
        let instance_id = cluster.next_instance_id.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            cluster,
            instance_id,
        }
    }

    /// A new handle onto the same cluster with its own instance id.
    pub fn handle(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            instance_id: self.cluster.next_instance_id.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Insert a bare object with the given data. Test seeding helper.
    pub fn insert_object(&self, oid: impl Into<String>, data: Vec<u8>) {
        let mut objects = self.cluster.objects.lock();
        let state = objects.entry(oid.into()).or_default();
        state.data = data;
    }

    /// Whether an object currently exists.
    pub fn object_exists(&self, oid: &str) -> bool {
        self.cluster.objects.lock().contains_key(oid)
    }

    /// Data length of an object, if it exists.
    pub fn data_len(&self, oid: &str) -> Option<usize> {
        self.cluster.objects.lock().get(oid).map(|o| o.data.len())
    }

    /// Number of keys in an object's key-value area, if it exists.
    pub fn omap_len(&self, oid: &str) -> Option<usize> {
        self.cluster.objects.lock().get(oid).map(|o| o.omap.len())
    }

    /// Acknowledgements recorded so far.
    pub fn acks(&self) -> Vec<NotifyAck> {
        self.cluster.acks.lock().clone()
    }

    /// Tear down every watch on `oid` as a server would, delivering
    /// `handle_error` to each registered sink. Test helper for the re-arm
    /// path.
    pub async fn break_watches(&self, oid: &str) {
        let torn_down: Vec<(u64, Arc<dyn WatchSink>)> = {
            let mut watches = self.cluster.watches.lock();
            let cookies: Vec<u64> = watches
                .iter()
                .filter(|(_, reg)| reg.oid == oid)
                .map(|(cookie, _)| *cookie)
                .collect();
            cookies
                .into_iter()
                .filter_map(|cookie| {
                    let reg = watches.remove(&cookie)?;
                    reg.sink.upgrade().map(|sink| (cookie, sink))
                })
                .collect()
        };
        for (cookie, sink) in torn_down {
            sink.handle_error(cookie, Error::io("watch torn down"))
                .await;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn instance_id(&self) -> u64 {
        self.instance_id
    }

    async fn read_versioned(
        &self,
        oid: &str,
        floor: &ObjectVersion,
    ) -> Result<(Vec<u8>, ObjectVersion)> {
        let objects = self.cluster.objects.lock();
        let state = objects.get(oid).ok_or_else(|| Error::not_found(oid))?;
        if !state.version.at_least(floor) {
            return Err(Error::canceled(format!(
                "stored version {} below floor {}: oid={oid}",
                state.version, floor
            )));
        }
        Ok((state.data.clone(), state.version.clone()))
    }

    async fn write_versioned(&self, oid: &str, body: &[u8], held: &ObjectVersion) -> Result<()> {
        let mut objects = self.cluster.objects.lock();
        let state = objects.get_mut(oid).ok_or_else(|| Error::not_found(oid))?;
        if state.version != *held {
            return Err(Error::canceled(format!(
                "stored version {} does not match held {}: oid={oid}",
                state.version, held
            )));
        }
        state.data = body.to_vec();
        state.version.inc();
        Ok(())
    }

    async fn create_versioned(
        &self,
        oid: &str,
        body: &[u8],
        version: &ObjectVersion,
    ) -> Result<()> {
        let mut objects = self.cluster.objects.lock();
        if objects.contains_key(oid) {
            return Err(Error::already_exists(oid));
        }
        objects.insert(
            oid.to_string(),
            ObjectState {
                data: body.to_vec(),
                version: version.clone(),
                ..ObjectState::default()
            },
        );
        Ok(())
    }

    async fn remove(&self, oid: &str) -> Result<()> {
        let mut objects = self.cluster.objects.lock();
        objects
            .remove(oid)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(oid))
    }

    async fn omap_clear(&self, oid: &str) -> Result<()> {
        let mut objects = self.cluster.objects.lock();
        let state = objects.get_mut(oid).ok_or_else(|| Error::not_found(oid))?;
        state.omap.clear();
        // FIFO metadata lives in the key-value area; clearing it destroys
        // the FIFO.
        state.fifo = None;
        state.fifo_entries.clear();
        Ok(())
    }

    async fn omap_set_header(&self, oid: &str, header: Vec<u8>) -> Result<()> {
        let mut objects = self.cluster.objects.lock();
        let state = objects.get_mut(oid).ok_or_else(|| Error::not_found(oid))?;
        state.omap_header = header;
        Ok(())
    }

    async fn truncate(&self, oid: &str, size: u64) -> Result<()> {
        let mut objects = self.cluster.objects.lock();
        let state = objects.get_mut(oid).ok_or_else(|| Error::not_found(oid))?;
        state.data.truncate(size as usize);
        Ok(())
    }

    async fn watch(&self, oid: &str, sink: Arc<dyn WatchSink>) -> Result<u64> {
        let cookie = self.cluster.next_cookie.fetch_add(1, Ordering::SeqCst) + 1;
        self.cluster.watches.lock().insert(
            cookie,
            WatchRegistration {
                oid: oid.to_string(),
                sink: Arc::downgrade(&sink),
            },
        );
        Ok(cookie)
    }

    async fn unwatch(&self, cookie: u64) -> Result<()> {
        self.cluster
            .watches
            .lock()
            .remove(&cookie)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("watch cookie {cookie}")))
    }

    async fn notify(&self, oid: &str, payload: Vec<u8>, _timeout: Duration) -> Result<()> {
        let notify_id = self.cluster.next_notify_id.fetch_add(1, Ordering::SeqCst) + 1;
        let targets: Vec<(u64, Arc<dyn WatchSink>)> = {
            let mut watches = self.cluster.watches.lock();
            // Prune registrations whose owner has gone away.
            watches.retain(|_, reg| reg.sink.strong_count() > 0);
            watches
                .iter()
                .filter(|(_, reg)| reg.oid == oid)
                .filter_map(|(cookie, reg)| reg.sink.upgrade().map(|sink| (*cookie, sink)))
                .collect()
        };
        for (cookie, sink) in targets {
            sink.handle_notify(notify_id, cookie, self.instance_id, payload.clone())
                .await;
        }
        Ok(())
    }

    async fn notify_ack(
        &self,
        _oid: &str,
        notify_id: u64,
        cookie: u64,
        _reply: Vec<u8>,
    ) -> Result<()> {
        self.cluster.acks.lock().push(NotifyAck { notify_id, cookie });
        Ok(())
    }
}
