//! Shard probing, backing-type resolution, and physical generation removal.

use crate::error::{Error, Result};
use crate::gen_map::BackingKind;
use shardlog_core::{Error as StoreError, FifoClient, ObjectStore, OmapLog};
use tracing::{error, warn};

/// Classification of a probed shard object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardCheck {
    Absent,
    Omap,
    Fifo,
    Corrupt,
}

/// Classify a shard object and report whether it holds entries.
///
/// Unexpected failures never propagate: they classify the shard as
/// [`ShardCheck::Corrupt`] and the caller decides how fatal that is. An
/// object that exists but has never had FIFO or log entries written to it
/// (likely just a marker OMAP left by earlier tooling) counts as absent so
/// a default backing can still be established on it.
pub async fn probe_shard<S>(store: &S, oid: &str) -> (ShardCheck, bool)
where
    S: ObjectStore + FifoClient + OmapLog,
{
    let omap = match OmapLog::head(store, oid).await {
        Ok(header) => !header.is_empty(),
        Err(StoreError::NotFound(_)) => return (ShardCheck::Absent, false),
        Err(e) => {
            error!(oid = %oid, error = %e, "error probing for omap");
            return (ShardCheck::Corrupt, false);
        }
    };

    let fifo = match FifoClient::open(store, oid).await {
        Ok(info) => info.is_some(),
        Err(StoreError::NotFound(_)) => false,
        Err(e) => {
            error!(oid = %oid, error = %e, "error probing for fifo");
            return (ShardCheck::Corrupt, false);
        }
    };

    if fifo && omap {
        error!(oid = %oid, "fifo and omap both found");
        return (ShardCheck::Corrupt, false);
    }
    if fifo {
        return match FifoClient::list(store, oid, 1, None).await {
            Ok((entries, _)) => (ShardCheck::Fifo, !entries.is_empty()),
            Err(e) => {
                error!(oid = %oid, error = %e, "unable to list fifo entries");
                (ShardCheck::Corrupt, false)
            }
        };
    }
    if omap {
        return match OmapLog::list(store, oid, 1).await {
            Ok((entries, _)) => (ShardCheck::Omap, !entries.is_empty()),
            Err(e) => {
                error!(oid = %oid, error = %e, "unable to list omap entries");
                (ShardCheck::Corrupt, false)
            }
        };
    }

    (ShardCheck::Absent, false)
}

/// Resolve the backing type across every shard of a generation.
///
/// Absent shards are ignored; all present shards must agree. If every shard
/// is absent the default wins, and a FIFO default is materialized on shard 0
/// only (the remaining shards are created lazily by the consumer on first
/// write; an OMAP default needs no I/O at all, absence is its starting
/// state).
pub async fn resolve_backing<S, F>(
    store: &S,
    default: BackingKind,
    shards: u32,
    get_oid: F,
) -> Result<BackingKind>
where
    S: ObjectStore + FifoClient + OmapLog,
    F: Fn(u32) -> String,
{
    let mut check = ShardCheck::Absent;
    for shard in 0..shards {
        let oid = get_oid(shard);
        let (c, _has_entries) = probe_shard(store, &oid).await;
        if c == ShardCheck::Corrupt {
            return Err(StoreError::io(format!("corrupt shard: oid={oid}")).into());
        }
        if c == ShardCheck::Absent {
            continue;
        }
        if check == ShardCheck::Absent {
            check = c;
            continue;
        }
        if check != c {
            error!(oid = %oid, found = ?c, expected = ?check, "clashing shard backing types");
            return Err(StoreError::io(format!("clashing shard backing types: oid={oid}")).into());
        }
    }

    match check {
        ShardCheck::Fifo => Ok(BackingKind::Fifo),
        ShardCheck::Omap => Ok(BackingKind::Omap),
        ShardCheck::Absent => {
            if default == BackingKind::Fifo {
                let oid = get_oid(0);
                match FifoClient::create(store, &oid).await {
                    // Another participant resolving the same generation may
                    // have materialized it first.
                    Ok(()) | Err(StoreError::AlreadyExists(_)) => {}
                    Err(e) => {
                        error!(oid = %oid, error = %e, "error creating fifo");
                        return Err(e.into());
                    }
                }
            }
            Ok(default)
        }
        ShardCheck::Corrupt => Err(StoreError::io("corrupt shard state").into()),
    }
}

/// Remove every physical object of a generation.
///
/// With `leave_zero`, shard 0 survives as an empty placeholder: its OMAP
/// header and keys are cleared and its data truncated to zero. External
/// lock services store attributes on that object and need it to keep
/// existing.
///
/// Every shard is processed even after a failure; the first error seen is
/// returned at the end.
pub async fn remove_generation<S, F>(
    store: &S,
    shards: u32,
    get_oid: F,
    leave_zero: bool,
) -> Result<()>
where
    S: ObjectStore + FifoClient,
    F: Fn(u32) -> String,
{
    let mut first_err: Option<Error> = None;
    for shard in 0..shards {
        let oid = get_oid(shard);
        match FifoClient::get_meta(store, &oid).await {
            // No shard object at all.
            Err(StoreError::NotFound(_)) => continue,
            Err(e) => {
                warn!(oid = %oid, error = %e, "failed checking fifo metadata");
                if first_err.is_none() {
                    first_err = Some(e.into());
                }
            }
            Ok(Some(info)) if info.has_parts() => {
                for part in info.tail_part_num..=info.head_part_num {
                    let part_oid = info.part_oid(part);
                    match store.remove(&part_oid).await {
                        Ok(()) | Err(StoreError::NotFound(_)) => {}
                        Err(e) => {
                            warn!(part_oid = %part_oid, error = %e, "failed removing fifo part");
                            if first_err.is_none() {
                                first_err = Some(e.into());
                            }
                        }
                    }
                }
            }
            Ok(_) => {}
        }

        let result = if leave_zero && shard == 0 {
            clear_shard(store, &oid).await
        } else {
            store.remove(&oid).await
        };
        match result {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => {
                warn!(oid = %oid, error = %e, "failed removing shard");
                if first_err.is_none() {
                    first_err = Some(e.into());
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn clear_shard<S: ObjectStore>(store: &S, oid: &str) -> shardlog_core::Result<()> {
    store.omap_set_header(oid, Vec::new()).await?;
    store.omap_clear(oid).await?;
    store.truncate(oid, 0).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardlog_core::{MemoryObjectStore, OmapLogEntry};

    async fn seed_omap_log(store: &MemoryObjectStore, oid: &str, entries: usize) {
        for i in 0..entries {
            OmapLog::add(
                store,
                oid,
                OmapLogEntry {
                    id: format!("1_{i:08}"),
                    data: vec![i as u8],
                },
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn probe_classifies_absent_and_marker_only_objects() {
        let store = MemoryObjectStore::new();
        assert_eq!(probe_shard(&store, "shard").await, (ShardCheck::Absent, false));

        // Exists, but neither backing ever wrote to it.
        store.insert_object("shard", Vec::new());
        assert_eq!(probe_shard(&store, "shard").await, (ShardCheck::Absent, false));
    }

    #[tokio::test]
    async fn probe_classifies_omap_shards() {
        let store = MemoryObjectStore::new();
        seed_omap_log(&store, "shard", 2).await;
        assert_eq!(probe_shard(&store, "shard").await, (ShardCheck::Omap, true));

        // Header written but no entries left.
        store.insert_object("empty", Vec::new());
        store
            .omap_set_header("empty", b"1_00000000".to_vec())
            .await
            .unwrap();
        assert_eq!(probe_shard(&store, "empty").await, (ShardCheck::Omap, false));
    }

    #[tokio::test]
    async fn probe_classifies_fifo_shards() {
        let store = MemoryObjectStore::new();
        FifoClient::create(&store, "shard").await.unwrap();
        assert_eq!(probe_shard(&store, "shard").await, (ShardCheck::Fifo, false));

        FifoClient::push(&store, "shard", b"x".to_vec()).await.unwrap();
        assert_eq!(probe_shard(&store, "shard").await, (ShardCheck::Fifo, true));
    }

    #[tokio::test]
    async fn probe_flags_dual_backed_shards_as_corrupt() {
        let store = MemoryObjectStore::new();
        FifoClient::create(&store, "shard").await.unwrap();
        store
            .omap_set_header("shard", b"1_00000000".to_vec())
            .await
            .unwrap();
        assert_eq!(probe_shard(&store, "shard").await, (ShardCheck::Corrupt, false));
    }

    fn oid_for(shard: u32) -> String {
        format!("log.0.{shard}")
    }

    #[tokio::test]
    async fn resolve_agrees_with_existing_shards() {
        let store = MemoryObjectStore::new();
        seed_omap_log(&store, "log.0.2", 1).await;

        let backing = resolve_backing(&store, BackingKind::Fifo, 4, oid_for)
            .await
            .unwrap();
        assert_eq!(backing, BackingKind::Omap);
        // Nothing new was materialized.
        assert!(!store.object_exists("log.0.0"));
    }

    #[tokio::test]
    async fn resolve_creates_default_fifo_on_shard_zero_only() {
        let store = MemoryObjectStore::new();
        let backing = resolve_backing(&store, BackingKind::Fifo, 4, oid_for)
            .await
            .unwrap();
        assert_eq!(backing, BackingKind::Fifo);
        assert!(FifoClient::get_meta(&store, "log.0.0")
            .await
            .unwrap()
            .is_some());
        for shard in 1..4 {
            assert!(!store.object_exists(&oid_for(shard)));
        }
    }

    #[tokio::test]
    async fn resolve_default_omap_needs_no_objects() {
        let store = MemoryObjectStore::new();
        let backing = resolve_backing(&store, BackingKind::Omap, 4, oid_for)
            .await
            .unwrap();
        assert_eq!(backing, BackingKind::Omap);
        assert!(!store.object_exists("log.0.0"));
    }

    #[tokio::test]
    async fn resolve_rejects_clashing_shards() {
        let store = MemoryObjectStore::new();
        seed_omap_log(&store, "log.0.0", 1).await;
        FifoClient::create(&store, "log.0.1").await.unwrap();

        let err = resolve_backing(&store, BackingKind::Fifo, 4, oid_for)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn resolve_rejects_corrupt_shards() {
        let store = MemoryObjectStore::new();
        FifoClient::create(&store, "log.0.1").await.unwrap();
        store
            .omap_set_header("log.0.1", b"1_00000000".to_vec())
            .await
            .unwrap();

        let err = resolve_backing(&store, BackingKind::Fifo, 4, oid_for)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn remove_deletes_shards_and_fifo_parts() {
        let store = MemoryObjectStore::new();
        FifoClient::create(&store, "log.0.0").await.unwrap();
        FifoClient::push(&store, "log.0.0", b"a".to_vec()).await.unwrap();
        seed_omap_log(&store, "log.0.1", 1).await;

        remove_generation(&store, 4, oid_for, false).await.unwrap();

        assert!(!store.object_exists("log.0.0"));
        assert!(!store.object_exists("log.0.0.0"));
        assert!(!store.object_exists("log.0.1"));
    }

    #[tokio::test]
    async fn remove_leave_zero_keeps_a_cleared_placeholder() {
        let store = MemoryObjectStore::new();
        FifoClient::create(&store, "log.0.0").await.unwrap();
        FifoClient::push(&store, "log.0.0", b"a".to_vec()).await.unwrap();
        store.insert_object("log.0.0", b"payload".to_vec());
        seed_omap_log(&store, "log.0.3", 1).await;

        remove_generation(&store, 4, oid_for, true).await.unwrap();

        assert!(store.object_exists("log.0.0"));
        assert_eq!(store.data_len("log.0.0"), Some(0));
        assert_eq!(store.omap_len("log.0.0"), Some(0));
        assert!(FifoClient::get_meta(&store, "log.0.0").await.unwrap().is_none());
        assert!(!store.object_exists("log.0.0.0"));
        assert!(!store.object_exists("log.0.3"));
        assert_eq!(probe_shard(&store, "log.0.0").await, (ShardCheck::Absent, false));
    }
}
