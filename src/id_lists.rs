//! ID lists: large sets of hashed IDs used by `in_segment_list` conditions.
//!
//! Lists are downloaded incrementally. The manifest endpoint reports each list's current size and
//! the sync fetches only the bytes past what is already held, as `+id` / `-id` lines.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use serde::Deserialize;

use crate::{
    network::NetworkClient, observability::OpsStats, output_logger::OutputLogger, Result,
    StatsigError,
};

pub const DEFAULT_ID_LISTS_URL: &str = "https://api.statsigcdn.com/v1/get_id_lists";

/// Manifest entry for one list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdListMetadata {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub creation_time: i64,
    #[serde(rename = "fileID", default)]
    pub file_id: Option<String>,
}

#[derive(Debug)]
struct IdList {
    metadata: IdListMetadata,
    /// Bytes of the list file applied so far.
    size: u64,
    ids: HashSet<String>,
}

impl IdList {
    fn new(metadata: IdListMetadata) -> IdList {
        IdList {
            metadata,
            size: 0,
            ids: HashSet::new(),
        }
    }

    /// Apply `+id` / `-id` lines. Returns `false` if the content isn't a list diff.
    fn apply(&mut self, content: &str) -> bool {
        if !content.is_empty() && !content.starts_with(['+', '-']) {
            return false;
        }
        for line in content.lines() {
            let line = line.trim();
            if let Some(id) = line.strip_prefix('+') {
                self.ids.insert(id.to_owned());
            } else if let Some(id) = line.strip_prefix('-') {
                self.ids.remove(id);
            }
        }
        self.size += content.len() as u64;
        true
    }
}

/// Current contents of every known ID list.
#[derive(Debug, Default)]
pub struct IdListStore {
    lists: RwLock<HashMap<String, IdList>>,
}

impl IdListStore {
    /// Whether `hashed_id` is in the list named `list_name`. Unknown lists contain nothing.
    pub fn contains(&self, list_name: &str, hashed_id: &str) -> bool {
        self.read()
            .get(list_name)
            .is_some_and(|list| list.ids.contains(hashed_id))
    }

    pub fn list_names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Number of IDs in `list_name`.
    pub fn list_len(&self, list_name: &str) -> Option<usize> {
        self.read().get(list_name).map(|list| list.ids.len())
    }

    /// Reconcile with a fresh manifest. Lists missing from the manifest are dropped, and lists
    /// whose file was replaced start over. Returns the lists that have new bytes to fetch, with
    /// the offset to fetch from.
    fn apply_manifest(
        &self,
        manifest: HashMap<String, IdListMetadata>,
    ) -> Vec<(IdListMetadata, u64)> {
        let mut lists = self.write();
        lists.retain(|name, _| manifest.contains_key(name));

        let mut pending = Vec::new();
        for (name, metadata) in manifest {
            let list = lists
                .entry(name)
                .or_insert_with(|| IdList::new(metadata.clone()));

            if metadata.file_id != list.metadata.file_id
                || metadata.creation_time > list.metadata.creation_time
            {
                if metadata.creation_time < list.metadata.creation_time {
                    continue;
                }
                *list = IdList::new(metadata.clone());
            }

            if metadata.size > list.size {
                pending.push((metadata, list.size));
            }
        }
        pending
    }

    /// Apply downloaded `content` to the list. Content that isn't a list diff resets the list so
    /// the next sync downloads it from scratch.
    fn apply_content(&self, metadata: &IdListMetadata, offset: u64, content: &str) -> bool {
        let mut lists = self.write();
        let Some(list) = lists.get_mut(&metadata.name) else {
            return false;
        };
        if list.size != offset || list.metadata.file_id != metadata.file_id {
            // The list changed while downloading.
            return false;
        }
        if list.apply(content) {
            true
        } else {
            lists.remove(&metadata.name);
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_ids(&self, list_name: &str, ids: impl IntoIterator<Item = String>) {
        let mut lists = self.write();
        let list = lists.entry(list_name.to_owned()).or_insert_with(|| {
            IdList::new(IdListMetadata {
                name: list_name.to_owned(),
                url: String::new(),
                size: 0,
                creation_time: 0,
                file_id: None,
            })
        });
        list.ids.extend(ids);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, IdList>> {
        self.lists
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, IdList>> {
        self.lists
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Downloads manifest and list diffs into an [`IdListStore`].
pub(crate) struct IdListSyncer {
    store: Arc<IdListStore>,
    network: NetworkClient,
    url: String,
    ops: OpsStats,
    logger: OutputLogger,
}

impl IdListSyncer {
    pub(crate) fn new(
        store: Arc<IdListStore>,
        network: NetworkClient,
        url: String,
        ops: OpsStats,
        logger: OutputLogger,
    ) -> IdListSyncer {
        IdListSyncer {
            store,
            network,
            url,
            ops,
            logger,
        }
    }

    /// One sync pass. A failing list doesn't prevent the others from updating.
    pub(crate) async fn sync(&self) -> Result<()> {
        let response = self.network.post(&self.url, HashMap::new(), b"{}".to_vec()).await?;
        let data = response.data.unwrap_or_default();
        let manifest: HashMap<String, IdListMetadata> = serde_json::from_slice(&data)
            .map_err(|err| StatsigError::JsonParse("id list manifest", Arc::new(err)))?;

        for (metadata, offset) in self.store.apply_manifest(manifest) {
            if let Err(err) = self.sync_list(&metadata, offset).await {
                let name = metadata.name.as_str();
                log::debug!(target: "statsig", name; "failed to sync id list: {err}");
                self.ops.error("id_list_sync", &err);
            }
        }
        Ok(())
    }

    async fn sync_list(&self, metadata: &IdListMetadata, offset: u64) -> Result<()> {
        let headers = HashMap::from([("Range".to_owned(), format!("bytes={offset}-"))]);
        let response = self.network.get(&metadata.url, headers).await?;
        let data = response.data.unwrap_or_default();
        let content = String::from_utf8_lossy(&data);

        if !self.store.apply_content(metadata, offset, &content) {
            self.logger.warn(
                "IdListSyncer",
                format!("discarded update for id list {}", metadata.name),
            );
        }
        Ok(())
    }
}
