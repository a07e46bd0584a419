//! The generation manager: versioned metadata, watch/notify convergence,
//! and the lifecycle operations.
//!
//! Every participant holds the same metadata object under optimistic
//! concurrency: mutations are compare-and-swap writes retried a bounded
//! number of times, and a change notification on the object tells everyone
//! else to refresh. The in-memory `(entries, version)` pair is guarded by a
//! mutex that is never held across I/O; mutators snapshot under the lock,
//! release it for the store round trip, and reacquire it to install the
//! result.

use crate::error::{Error, Result};
use crate::gen_map::{
    decode_generations, encode_generations, lowest_nonempty, BackingKind, Generation, Generations,
};
use crate::probe::{remove_generation, resolve_backing};
use async_trait::async_trait;
use parking_lot::Mutex;
use shardlog_core::{
    Error as StoreError, FifoClient, ObjectStore, ObjectVersion, OmapLog, WatchSink,
};
use std::fmt::Debug;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Configuration for a generation manager.
#[derive(Clone, Debug)]
pub struct GenerationsConfig {
    /// Well-known name of the metadata object.
    pub meta_oid: String,
    /// Number of shards per generation.
    pub shards: u32,
    /// Ceiling on CAS retries in mutators. A defensive bound, not a
    /// correctness property: under heavy contention callers still see
    /// `Canceled` once it is exhausted.
    pub max_write_attempts: u32,
    /// Reply budget for the change notification after a successful
    /// mutation.
    pub notify_timeout: Duration,
}

impl GenerationsConfig {
    pub fn new(meta_oid: impl Into<String>, shards: u32) -> Self {
        Self {
            meta_oid: meta_oid.into(),
            shards,
            max_write_attempts: 10,
            notify_timeout: Duration::from_secs(10),
        }
    }
}

/// Callbacks a consumer supplies to the manager.
///
/// Callbacks run inline on the fiber of the triggering operation, which may
/// be a remote notification as easily as a local mutator. A consumer that
/// needs to do long work should hand off to its own queue. Errors returned
/// from callbacks propagate out of the enclosing operation.
#[async_trait]
pub trait GenerationsListener: Send + Sync + 'static {
    /// Object name for one shard of a generation. The manager treats the
    /// returned name as opaque.
    fn shard_oid(&self, gen_id: u64, shard: u32) -> String;

    /// Delivered once at setup with every non-empty generation.
    async fn handle_init(&self, active: Generations) -> Result<()>;

    /// Delivered whenever new generations appear, created locally or
    /// observed remotely.
    async fn handle_new_gens(&self, added: Generations) -> Result<()>;

    /// Delivered whenever the empty-prefix boundary advances to `gen_id`.
    async fn handle_empty_to(&self, gen_id: u64) -> Result<()>;
}

struct GenState {
    entries: Generations,
    version: ObjectVersion,
}

struct WatchHandle {
    cookie: u64,
    // Keeps the sink alive; the store only holds a weak reference.
    _sink: Arc<dyn WatchSink>,
}

/// Coordinates the generation lifecycle of one sharded log.
///
/// Create with [`init`], which performs setup (reading or racing to create
/// the metadata object), arms the watch, and delivers `handle_init`. Call
/// [`shutdown`] before dropping to revoke the watch registration.
///
/// [`init`]: LogBackingGenerations::init
/// [`shutdown`]: LogBackingGenerations::shutdown
pub struct LogBackingGenerations<S> {
    store: S,
    cfg: GenerationsConfig,
    listener: Arc<dyn GenerationsListener>,
    my_id: u64,
    state: Mutex<GenState>,
    watch_handle: Mutex<Option<WatchHandle>>,
}

impl<S> Debug for LogBackingGenerations<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBackingGenerations")
            .field("meta_oid", &self.cfg.meta_oid)
            .field("shards", &self.cfg.shards)
            .field("my_id", &self.my_id)
            .finish()
    }
}

impl<S> LogBackingGenerations<S>
where
    S: ObjectStore + FifoClient + OmapLog + 'static,
{
    /// Set up a manager: adopt the existing metadata object or race to
    /// create it, arm the watch, and deliver `handle_init` with every
    /// non-empty generation.
    pub async fn init(
        store: S,
        cfg: GenerationsConfig,
        listener: Arc<dyn GenerationsListener>,
        default: BackingKind,
    ) -> Result<Arc<Self>> {
        let my_id = store.instance_id();
        let mgr = Arc::new(Self {
            store,
            cfg,
            listener,
            my_id,
            state: Mutex::new(GenState {
                entries: Generations::new(),
                version: ObjectVersion::default(),
            }),
            watch_handle: Mutex::new(None),
        });
        Self::setup(&mgr, default).await?;
        Ok(mgr)
    }

    async fn setup(this: &Arc<Self>, default: BackingKind) -> Result<()> {
        match this.read_meta().await {
            Ok((entries, version)) => {
                let mut state = this.state.lock();
                state.entries = entries;
                state.version = version;
            }
            Err(Error::Store(StoreError::NotFound(_))) => {
                debug!(oid = %this.cfg.meta_oid, "metadata object not found, creating");
                this.create_meta(default).await?;
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = Self::watch(this).await {
            error!(
                oid = %this.cfg.meta_oid, error = %e,
                "failed to establish watch, unsafe to continue"
            );
        }

        let active = {
            let state = this.state.lock();
            active_suffix(&state.entries)
        };
        this.listener.handle_init(active).await
    }

    /// First participant ever: resolve the backing for generation 0 and race
    /// to create the metadata object.
    async fn create_meta(&self, default: BackingKind) -> Result<()> {
        let backing = resolve_backing(&self.store, default, self.cfg.shards, |shard| {
            self.listener.shard_oid(0, shard)
        })
        .await?;

        let mut entries = Generations::new();
        entries.insert(0, Generation::new(0, backing));
        let version = ObjectVersion::initial();
        let body = encode_generations(&entries);

        match self
            .store
            .create_versioned(&self.cfg.meta_oid, &body, &version)
            .await
        {
            Ok(()) => {
                let mut state = self.state.lock();
                state.entries = entries;
                state.version = version;
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => {
                // Someone raced us; adopt what they wrote.
                let (entries, version) = self.read_meta().await?;
                let Some(lowest) = entries.keys().next().copied() else {
                    return Err(Error::inconsistency(
                        "metadata object exists but holds no generations",
                    ));
                };
                // If the winners already advanced past generation 0, don't
                // leave our half-created generation 0 lying around.
                if lowest != 0 {
                    remove_generation(&self.store, self.cfg.shards, |shard| {
                        self.listener.shard_oid(0, shard)
                    }, true)
                    .await?;
                }
                let mut state = self.state.lock();
                state.entries = entries;
                state.version = version;
                Ok(())
            }
            Err(e) => {
                error!(oid = %self.cfg.meta_oid, error = %e, "failed creating metadata object");
                Err(e.into())
            }
        }
    }

    async fn read_meta(&self) -> Result<(Generations, ObjectVersion)> {
        let floor = self.state.lock().version.clone();
        let (body, version) = self
            .store
            .read_versioned(&self.cfg.meta_oid, &floor)
            .await?;
        let entries = decode_generations(&body)?;
        Ok((entries, version))
    }

    /// CAS the metadata object to `entries` under `held` and install the new
    /// state locally. A CAS miss refreshes local state once via [`update`]
    /// and then surfaces `Canceled` for the caller's retry loop.
    ///
    /// [`update`]: LogBackingGenerations::update
    async fn write_meta(&self, entries: Generations, held: ObjectVersion) -> Result<()> {
        let body = encode_generations(&entries);
        match self
            .store
            .write_versioned(&self.cfg.meta_oid, &body, &held)
            .await
        {
            Ok(()) => {
                let mut next = held;
                next.inc();
                let mut state = self.state.lock();
                // A watcher may have refreshed past us while the write was
                // in flight; never install backwards.
                if next.ver > state.version.ver {
                    state.entries = entries;
                    state.version = next;
                }
                Ok(())
            }
            Err(StoreError::Canceled(_)) => {
                self.update().await?;
                Err(StoreError::canceled("metadata version advanced under us").into())
            }
            Err(e) => {
                error!(oid = %self.cfg.meta_oid, error = %e, "failed writing metadata object");
                Err(e.into())
            }
        }
    }

    /// Incremental refresh: re-read the metadata object and, if it changed,
    /// validate the observed map, install it, and dispatch callbacks.
    ///
    /// Validation failures are [`Error::Inconsistency`] and leave the local
    /// state untouched; the manager makes no attempt to recover from a
    /// metadata object that breaks the state machine's rules.
    pub async fn update(&self) -> Result<()> {
        let (es, v) = self.read_meta().await?;

        let (highest_empty, new_entries) = {
            let mut state = self.state.lock();
            if v == state.version {
                return Ok(());
            }
            if es.is_empty() {
                error!(oid = %self.cfg.meta_oid, "read an empty entries map");
                return Err(Error::inconsistency("read an empty entries map"));
            }
            let Some(cur_low) = lowest_nonempty(&state.entries) else {
                return Err(Error::inconsistency("local entries map has no active head"));
            };
            let Some(cur_max) = state.entries.keys().next_back().copied() else {
                return Err(Error::inconsistency("local entries map is empty"));
            };
            let Some(new_low) = lowest_nonempty(&es) else {
                error!(oid = %self.cfg.meta_oid, "read an update with no active head");
                return Err(Error::inconsistency("read an update with no active head"));
            };
            let Some(new_max) = es.keys().next_back().copied() else {
                return Err(Error::inconsistency("read an empty entries map"));
            };
            if new_low < cur_low {
                error!(oid = %self.cfg.meta_oid, new_low, cur_low, "tail moved backwards");
                return Err(Error::inconsistency("tail moved backwards"));
            }
            if new_max < cur_max {
                error!(oid = %self.cfg.meta_oid, new_max, cur_max, "head moved backwards");
                return Err(Error::inconsistency("head moved backwards"));
            }

            // Boundary advanced, and the drained run is still present in the
            // observed map.
            let highest_empty = if new_low > cur_low {
                es.range(..new_low).next_back().map(|(k, _)| *k)
            } else {
                None
            };
            let new_entries: Generations = es
                .range(cur_max + 1..)
                .map(|(k, g)| (*k, g.clone()))
                .collect();

            state.entries = es;
            state.version = v;
            (highest_empty, new_entries)
        };

        if let Some(gen_id) = highest_empty {
            self.listener.handle_empty_to(gen_id).await?;
        }
        if !new_entries.is_empty() {
            self.listener.handle_new_gens(new_entries).await?;
        }
        Ok(())
    }

    /// Append a generation with a different backing type.
    ///
    /// Idempotent: if the head generation already has the requested backing
    /// this is a no-op with no version advance.
    pub async fn new_backing(&self, backing: BackingKind) -> Result<()> {
        self.update().await?;

        let mut written = None;
        for _ in 0..self.cfg.max_write_attempts {
            let (es, held, added) = {
                let state = self.state.lock();
                let Some(last) = state.entries.values().next_back() else {
                    return Err(Error::inconsistency("entries map is empty"));
                };
                if last.backing == backing {
                    return Ok(());
                }
                let newgen = Generation::new(last.gen_id + 1, backing);
                let mut es = state.entries.clone();
                es.insert(newgen.gen_id, newgen.clone());
                let mut added = Generations::new();
                added.insert(newgen.gen_id, newgen);
                (es, state.version.clone(), added)
            };
            match self.write_meta(es, held).await {
                Ok(()) => {
                    written = Some(added);
                    break;
                }
                Err(e) if e.is_canceled() => continue,
                Err(e) => return Err(e),
            }
        }
        let Some(added) = written else {
            error!(oid = %self.cfg.meta_oid, "exhausted retry attempts appending a generation");
            return Err(StoreError::canceled("exhausted retry attempts").into());
        };

        self.notify().await?;
        self.listener.handle_new_gens(added).await
    }

    /// Mark every generation with id `<= gen_id` as drained.
    ///
    /// The head generation can never be emptied; asking to is
    /// [`Error::InvalidArgument`].
    pub async fn empty_to(&self, gen_id: u64) -> Result<()> {
        self.update().await?;

        let mut done = false;
        for _ in 0..self.cfg.max_write_attempts {
            let (es, held) = {
                let state = self.state.lock();
                let Some(head) = state.entries.keys().next_back().copied() else {
                    return Err(Error::inconsistency("entries map is empty"));
                };
                if gen_id >= head {
                    warn!(oid = %self.cfg.meta_oid, gen_id, head, "attempt to trim beyond the possible");
                    return Err(Error::invalid_argument(
                        "cannot empty the current head generation",
                    ));
                }
                let mut es = state.entries.clone();
                let mut any = false;
                for (_, g) in es.range_mut(..=gen_id) {
                    g.empty = true;
                    any = true;
                }
                if !any {
                    return Ok(());
                }
                (es, state.version.clone())
            };
            match self.write_meta(es, held).await {
                Ok(()) => {
                    done = true;
                    break;
                }
                Err(e) if e.is_canceled() => continue,
                Err(e) => return Err(e),
            }
        }
        if !done {
            error!(oid = %self.cfg.meta_oid, "exhausted retry attempts marking generations empty");
            return Err(StoreError::canceled("exhausted retry attempts").into());
        }

        self.notify().await?;
        self.listener.handle_empty_to(gen_id).await
    }

    /// Physically remove the drained prefix, then drop it from the map.
    ///
    /// Shard removal runs before the CAS; on a miss the prefix is recomputed
    /// from the refreshed state and removal re-runs, which is harmless
    /// because removal is idempotent.
    pub async fn remove_empty(&self) -> Result<()> {
        self.update().await?;

        for _ in 0..self.cfg.max_write_attempts {
            let prefix = {
                let state = self.state.lock();
                let Some(low) = lowest_nonempty(&state.entries) else {
                    return Err(Error::inconsistency("entries map has no active head"));
                };
                state
                    .entries
                    .range(..low)
                    .map(|(k, g)| (*k, g.clone()))
                    .collect::<Generations>()
            };
            if prefix.is_empty() {
                return Ok(());
            }

            for (gen_id, g) in &prefix {
                if !g.empty {
                    return Err(Error::inconsistency(format!(
                        "generation {gen_id} in the removable prefix is not empty"
                    )));
                }
                remove_generation(&self.store, self.cfg.shards, |shard| {
                    self.listener.shard_oid(*gen_id, shard)
                }, *gen_id == 0)
                .await?;
            }

            let (es, held) = {
                let state = self.state.lock();
                let Some(low) = lowest_nonempty(&state.entries) else {
                    return Err(Error::inconsistency("entries map has no active head"));
                };
                let es: Generations = state
                    .entries
                    .range(low..)
                    .map(|(k, g)| (*k, g.clone()))
                    .collect();
                (es, state.version.clone())
            };
            match self.write_meta(es, held).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_canceled() => continue,
                Err(e) => return Err(e),
            }
        }
        error!(oid = %self.cfg.meta_oid, "exhausted retry attempts removing the empty prefix");
        Err(StoreError::canceled("exhausted retry attempts").into())
    }

    async fn notify(&self) -> Result<()> {
        self.store
            .notify(&self.cfg.meta_oid, Vec::new(), self.cfg.notify_timeout)
            .await
            .map_err(|e| {
                error!(oid = %self.cfg.meta_oid, error = %e, "notify failed");
                Error::from(e)
            })
    }

    /// Register as the notification sink on the metadata object. At most one
    /// watch is active per manager; re-arming replaces the previous cookie.
    async fn watch(this: &Arc<Self>) -> Result<()> {
        let sink = Arc::new(GenerationsSink {
            mgr: Arc::downgrade(this),
        });
        let cookie = this
            .store
            .watch(&this.cfg.meta_oid, sink.clone())
            .await
            .map_err(Error::from)?;
        *this.watch_handle.lock() = Some(WatchHandle {
            cookie,
            _sink: sink,
        });
        Ok(())
    }

    /// Revoke the watch registration. Failing to unwatch is logged, not
    /// fatal.
    pub async fn shutdown(&self) {
        let handle = self.watch_handle.lock().take();
        if let Some(h) = handle {
            if let Err(e) = self.store.unwatch(h.cookie).await {
                warn!(oid = %self.cfg.meta_oid, error = %e, "failed unwatching metadata object");
            }
        }
    }

    /// Snapshot of the current entries map.
    pub fn entries(&self) -> Generations {
        self.state.lock().entries.clone()
    }

    /// Snapshot of the current metadata version.
    pub fn version(&self) -> ObjectVersion {
        self.state.lock().version.clone()
    }
}

/// Entries from the lowest non-empty generation onward.
fn active_suffix(entries: &Generations) -> Generations {
    match lowest_nonempty(entries) {
        Some(low) => entries.range(low..).map(|(k, g)| (*k, g.clone())).collect(),
        None => Generations::new(),
    }
}

struct GenerationsSink<S> {
    mgr: Weak<LogBackingGenerations<S>>,
}

#[async_trait]
impl<S> WatchSink for GenerationsSink<S>
where
    S: ObjectStore + FifoClient + OmapLog + 'static,
{
    async fn handle_notify(&self, notify_id: u64, cookie: u64, notifier_id: u64, _payload: Vec<u8>) {
        let Some(mgr) = self.mgr.upgrade() else {
            return;
        };
        if notifier_id != mgr.my_id {
            if let Err(e) = mgr.update().await {
                // No caller to surface this to, and silently diverging
                // state is worse than dying.
                error!(
                    oid = %mgr.cfg.meta_oid, error = %e,
                    "refresh after change notification failed"
                );
                std::process::abort();
            }
        }
        if let Err(e) = mgr
            .store
            .notify_ack(&mgr.cfg.meta_oid, notify_id, cookie, Vec::new())
            .await
        {
            warn!(oid = %mgr.cfg.meta_oid, error = %e, "failed acknowledging notification");
        }
    }

    async fn handle_error(&self, cookie: u64, err: StoreError) {
        let Some(mgr) = self.mgr.upgrade() else {
            return;
        };
        warn!(oid = %mgr.cfg.meta_oid, cookie, error = %err, "watch torn down, re-arming");

        let handle = mgr.watch_handle.lock().take();
        if let Some(h) = handle {
            if let Err(e) = mgr.store.unwatch(h.cookie).await {
                warn!(oid = %mgr.cfg.meta_oid, error = %e, "failed unwatching metadata object");
            }
        }
        if let Err(e) = LogBackingGenerations::watch(&mgr).await {
            error!(
                oid = %mgr.cfg.meta_oid, error = %e,
                "failed to re-establish watch, unsafe to continue"
            );
        }
    }
}
