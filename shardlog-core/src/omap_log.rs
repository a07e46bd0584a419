//! OMAP structured-log primitives.
//!
//! An OMAP log keeps its entries as keys in an object's key-value area and
//! summarizes the high-water mark in the OMAP header. A header equal to the
//! default value means the log has never been written, which is how probes
//! distinguish a live OMAP log from an object that merely exists.

use crate::error::{Error, Result};
use crate::store::MemoryObjectStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Header summarizing an OMAP log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapLogHeader {
    /// Marker of the newest entry ever written.
    pub max_marker: String,
}

impl OmapLogHeader {
    /// Whether the log has ever been written.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One structured-log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OmapLogEntry {
    pub id: String,
    pub data: Vec<u8>,
}

/// Client interface of the OMAP log primitives.
#[async_trait]
pub trait OmapLog: Debug + Send + Sync {
    /// Read the log header. [`Error::NotFound`] when the object is missing.
    async fn head(&self, oid: &str) -> Result<OmapLogHeader>;

    /// List up to `max` entries in marker order. The flag reports whether
    /// more entries remain.
    async fn list(&self, oid: &str, max: usize) -> Result<(Vec<OmapLogEntry>, bool)>;

    /// Append an entry, creating the object if needed.
    async fn add(&self, oid: &str, entry: OmapLogEntry) -> Result<()>;
}

#[async_trait]
impl OmapLog for MemoryObjectStore {
    async fn head(&self, oid: &str) -> Result<OmapLogHeader> {
        let objects = self.cluster.objects.lock();
        let state = objects.get(oid).ok_or_else(|| Error::not_found(oid))?;
        Ok(OmapLogHeader {
            max_marker: String::from_utf8_lossy(&state.omap_header).into_owned(),
        })
    }

    async fn list(&self, oid: &str, max: usize) -> Result<(Vec<OmapLogEntry>, bool)> {
        let objects = self.cluster.objects.lock();
        let state = objects.get(oid).ok_or_else(|| Error::not_found(oid))?;
        let entries: Vec<OmapLogEntry> = state
            .omap
            .iter()
            .take(max)
            .map(|(id, data)| OmapLogEntry {
                id: id.clone(),
                data: data.clone(),
            })
            .collect();
        Ok((entries, state.omap.len() > max))
    }

    async fn add(&self, oid: &str, entry: OmapLogEntry) -> Result<()> {
        let mut objects = self.cluster.objects.lock();
        let state = objects.entry(oid.to_string()).or_default();
        state.omap_header = entry.id.clone().into_bytes();
        state.omap.insert(entry.id, entry.data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStore;

    #[tokio::test]
    async fn head_of_missing_object_is_not_found() {
        let store = MemoryObjectStore::new();
        assert!(matches!(
            store.head("gone").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn untouched_object_has_empty_header() {
        let store = MemoryObjectStore::new();
        store.insert_object("plain", Vec::new());
        assert!(store.head("plain").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_then_list() {
        let store = MemoryObjectStore::new();
        for i in 0..3u8 {
            store
                .add(
                    "log",
                    OmapLogEntry {
                        id: format!("1_{i:08}"),
                        data: vec![i],
                    },
                )
                .await
                .unwrap();
        }

        let header = store.head("log").await.unwrap();
        assert!(!header.is_empty());
        assert_eq!(header.max_marker, "1_00000002");

        let (entries, more) = store.list("log", 2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(more);
        assert_eq!(entries[0].data, vec![0]);
    }

    #[tokio::test]
    async fn clearing_omap_resets_the_log() {
        let store = MemoryObjectStore::new();
        store
            .add(
                "log",
                OmapLogEntry {
                    id: "1".into(),
                    data: Vec::new(),
                },
            )
            .await
            .unwrap();

        store.omap_clear("log").await.unwrap();
        store.omap_set_header("log", Vec::new()).await.unwrap();

        assert!(store.head("log").await.unwrap().is_empty());
        let (entries, _) = store.list("log", 10).await.unwrap();
        assert!(entries.is_empty());
    }
}
