use std::collections::BTreeMap;

use crate::error::Result;
use crate::vector_db::{ChunkPayload, PointId, StoredEntry, VectorIndex};

/// Points requested per scroll call while rebuilding.
const SCROLL_PAGE_SIZE: usize = 1000;

/// Local mirror of the chunks indexed in one collection, keyed by point id.
#[derive(Debug, Default, Clone)]
pub struct DocMap {
    entries: BTreeMap<u64, ChunkPayload>,
    /// Highest numeric id present in the index without a usable payload.
    unmirrored_max: Option<u64>,
}

impl DocMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the whole collection back from the index.
    pub async fn rebuild(index: &dyn VectorIndex, collection: &str) -> Result<Self> {
        let entries = index.scroll(collection, SCROLL_PAGE_SIZE).await?;
        let map = Self::from_entries(collection, entries);
        tracing::info!(collection, entries = map.len(), "document map rebuilt");
        Ok(map)
    }

    fn from_entries(collection: &str, entries: Vec<StoredEntry>) -> Self {
        let mut map = Self::new();
        let mut foreign_ids = 0usize;
        let mut unreadable = 0usize;
        for entry in entries {
            match (entry.id, entry.payload) {
                (PointId::Num(id), Some(payload)) => {
                    map.entries.insert(id, payload);
                }
                (PointId::Num(id), None) => {
                    unreadable += 1;
                    map.unmirrored_max = map.unmirrored_max.max(Some(id));
                }
                (PointId::Uuid(_), _) => foreign_ids += 1,
            }
        }
        if foreign_ids > 0 {
            tracing::warn!(
                collection,
                foreign_ids,
                "ignored points without sequential ids while rebuilding document map"
            );
        }
        if unreadable > 0 {
            tracing::warn!(
                collection,
                unreadable,
                "points with unreadable payloads are not mirrored; their ids stay reserved"
            );
        }
        map
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&ChunkPayload> {
        self.entries.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &ChunkPayload)> {
        self.entries.iter().map(|(id, payload)| (*id, payload))
    }

    /// Id the next inserted chunk receives: one past the highest id known to
    /// be in the index, mirrored or not.
    pub fn next_id(&self) -> u64 {
        let mirrored = self.entries.last_key_value().map(|(max, _)| *max);
        mirrored.max(self.unmirrored_max).map_or(0, |max| max + 1)
    }

    /// Reserves `count` consecutive ids starting at [`DocMap::next_id`].
    pub fn reserve_ids(&self, count: usize) -> Vec<u64> {
        let first = self.next_id();
        (first..first + count as u64).collect()
    }

    pub fn insert(&mut self, id: u64, payload: ChunkPayload) {
        self.entries.insert(id, payload);
    }

    /// Drops every entry from `source`, returning how many were removed.
    pub fn remove_source(&mut self, source: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, payload| payload.source != source);
        before - self.entries.len()
    }

    /// Distinct sources, sorted.
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .entries
            .values()
            .map(|payload| payload.source.clone())
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }
}
