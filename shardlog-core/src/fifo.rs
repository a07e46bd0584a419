//! FIFO part-log client interface.
//!
//! A FIFO is a segmented log: a head object carrying metadata plus a range
//! of numbered part objects holding the entries. The coordinator only
//! creates, opens, lists, and inspects FIFOs; appends go through [`push`].
//!
//! [`push`]: FifoClient::push

use crate::error::{Error, Result};
use crate::store::MemoryObjectStore;
use async_trait::async_trait;
use std::fmt::Debug;

/// Entries per part in the in-memory implementation.
const MEMORY_PART_ENTRIES: usize = 16;

/// One listed FIFO entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifoEntry {
    /// Opaque resume cursor for this entry.
    pub marker: String,
    pub data: Vec<u8>,
}

/// FIFO metadata: the live part range and how part objects are named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifoInfo {
    /// Head object name.
    pub oid: String,
    /// Lowest live part number.
    pub tail_part_num: i64,
    /// Highest live part number, `-1` before the first part is created.
    pub head_part_num: i64,
}

impl FifoInfo {
    /// Object name of part `n`.
    pub fn part_oid(&self, n: i64) -> String {
        format!("{}.{}", self.oid, n)
    }

    /// Whether any part objects exist.
    pub fn has_parts(&self) -> bool {
        self.head_part_num > -1
    }
}

/// Client interface of the FIFO library.
#[async_trait]
pub trait FifoClient: Debug + Send + Sync {
    /// Create a FIFO on `oid`. The object must not already be a FIFO.
    async fn create(&self, oid: &str) -> Result<()>;

    /// Open an existing FIFO without creating one.
    ///
    /// Returns `Ok(None)` when the object exists but carries no FIFO
    /// metadata, and [`Error::NotFound`] when the object is missing
    /// entirely.
    async fn open(&self, oid: &str) -> Result<Option<FifoInfo>>;

    /// Append an entry.
    async fn push(&self, oid: &str, data: Vec<u8>) -> Result<()>;

    /// List up to `max` entries after `cursor`, oldest first. The flag
    /// reports whether more entries remain.
    async fn list(
        &self,
        oid: &str,
        max: usize,
        cursor: Option<String>,
    ) -> Result<(Vec<FifoEntry>, bool)>;

    /// Fetch FIFO metadata with the same absence semantics as [`open`].
    ///
    /// [`open`]: FifoClient::open
    async fn get_meta(&self, oid: &str) -> Result<Option<FifoInfo>>;
}

#[async_trait]
impl FifoClient for MemoryObjectStore {
    async fn create(&self, oid: &str) -> Result<()> {
        let mut objects = self.cluster.objects.lock();
        let state = objects.entry(oid.to_string()).or_default();
        if state.fifo.is_some() {
            return Err(Error::already_exists(oid));
        }
        state.fifo = Some(crate::store::FifoState {
            tail_part_num: 0,
            head_part_num: -1,
        });
        Ok(())
    }

    async fn open(&self, oid: &str) -> Result<Option<FifoInfo>> {
        self.get_meta(oid).await
    }

    async fn push(&self, oid: &str, data: Vec<u8>) -> Result<()> {
        let part_oid = {
            let mut objects = self.cluster.objects.lock();
            let state = objects.get_mut(oid).ok_or_else(|| Error::not_found(oid))?;
            let fifo = state
                .fifo
                .as_mut()
                .ok_or_else(|| Error::not_found(format!("no fifo on object: {oid}")))?;
            if fifo.head_part_num < 0 {
                fifo.head_part_num = fifo.tail_part_num;
            }
            let head = fifo.head_part_num;
            let head_oid = format!("{oid}.{head}");
            let full = objects
                .get(&head_oid)
                .map(|p| p.fifo_entries.len() >= MEMORY_PART_ENTRIES)
                .unwrap_or(false);
            if full {
                let state = objects
                    .get_mut(oid)
                    .ok_or_else(|| Error::not_found(oid))?;
                let fifo = state
                    .fifo
                    .as_mut()
                    .ok_or_else(|| Error::not_found(format!("no fifo on object: {oid}")))?;
                fifo.head_part_num += 1;
                format!("{oid}.{}", fifo.head_part_num)
            } else {
                head_oid
            }
        };
        let mut objects = self.cluster.objects.lock();
        let part = objects.entry(part_oid.clone()).or_default();
        let marker = format!("{part_oid}:{:08}", part.fifo_entries.len());
        part.fifo_entries.push(FifoEntry { marker, data });
        Ok(())
    }

    async fn list(
        &self,
        oid: &str,
        max: usize,
        cursor: Option<String>,
    ) -> Result<(Vec<FifoEntry>, bool)> {
        let objects = self.cluster.objects.lock();
        let state = objects.get(oid).ok_or_else(|| Error::not_found(oid))?;
        let fifo = state
            .fifo
            .as_ref()
            .ok_or_else(|| Error::not_found(format!("no fifo on object: {oid}")))?;

        let mut all: Vec<FifoEntry> = Vec::new();
        if fifo.head_part_num > -1 {
            for part in fifo.tail_part_num..=fifo.head_part_num {
                if let Some(p) = objects.get(&format!("{oid}.{part}")) {
                    all.extend(p.fifo_entries.iter().cloned());
                }
            }
        }
        let start = match cursor {
            Some(marker) => all
                .iter()
                .position(|e| e.marker == marker)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        let remaining = &all[start.min(all.len())..];
        let more = remaining.len() > max;
        Ok((remaining.iter().take(max).cloned().collect(), more))
    }

    async fn get_meta(&self, oid: &str) -> Result<Option<FifoInfo>> {
        let objects = self.cluster.objects.lock();
        let state = objects.get(oid).ok_or_else(|| Error::not_found(oid))?;
        Ok(state.fifo.as_ref().map(|f| FifoInfo {
            oid: oid.to_string(),
            tail_part_num: f.tail_part_num,
            head_part_num: f.head_part_num,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStore;

    #[tokio::test]
    async fn create_then_open() {
        let store = MemoryObjectStore::new();
        store.create("log.0.0").await.unwrap();

        let info = store.open("log.0.0").await.unwrap().unwrap();
        assert_eq!(info.tail_part_num, 0);
        assert_eq!(info.head_part_num, -1);
        assert!(!info.has_parts());
    }

    #[tokio::test]
    async fn open_missing_and_non_fifo_objects() {
        let store = MemoryObjectStore::new();
        assert!(matches!(
            store.open("gone").await.unwrap_err(),
            Error::NotFound(_)
        ));

        store.insert_object("plain", b"data".to_vec());
        assert!(store.open("plain").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let store = MemoryObjectStore::new();
        store.create("f").await.unwrap();
        assert!(matches!(
            store.create("f").await.unwrap_err(),
            Error::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn push_and_list_round_trip() {
        let store = MemoryObjectStore::new();
        store.create("f").await.unwrap();
        for i in 0..3u8 {
            store.push("f", vec![i]).await.unwrap();
        }

        let (entries, more) = store.list("f", 10, None).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(!more);
        assert_eq!(entries[0].data, vec![0]);

        let (page, more) = store.list("f", 2, None).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(more);
        let (rest, more) = store
            .list("f", 10, Some(page[1].marker.clone()))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert!(!more);
        assert_eq!(rest[0].data, vec![2]);
    }

    #[tokio::test]
    async fn parts_rotate_when_full() {
        let store = MemoryObjectStore::new();
        store.create("f").await.unwrap();
        for i in 0..(MEMORY_PART_ENTRIES + 4) {
            store.push("f", vec![i as u8]).await.unwrap();
        }

        let info = store.get_meta("f").await.unwrap().unwrap();
        assert_eq!(info.head_part_num, 1);
        assert!(store.object_exists(&info.part_oid(0)));
        assert!(store.object_exists(&info.part_oid(1)));

        let (entries, _) = store.list("f", 100, None).await.unwrap();
        assert_eq!(entries.len(), MEMORY_PART_ENTRIES + 4);
    }

    #[tokio::test]
    async fn omap_clear_destroys_fifo_metadata() {
        let store = MemoryObjectStore::new();
        store.create("f").await.unwrap();
        store.push("f", b"x".to_vec()).await.unwrap();

        store.omap_clear("f").await.unwrap();
        assert!(store.get_meta("f").await.unwrap().is_none());
    }
}
