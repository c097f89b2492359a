//! Documentation metadata catalog.
//!
//! Records name, source, category, tags, and description per document. The
//! catalog persists as one JSON file per category in its configured
//! directory; the cache itself is volatile and rebuilt from these sources.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::fetcher::DocSource;

/// One cataloged document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocRecord {
    pub name: String,
    pub source: DocSource,
    pub category: String,
    pub tags: Vec<String>,
    pub description: String,
}

/// Records within one category file, keyed by document name.
type CategoryRecords = HashMap<String, DocRecord>;

pub struct CatalogStore {
    records: RwLock<HashMap<String, DocRecord>>,
    catalog_dir: PathBuf,
}

impl CatalogStore {
    pub fn new(catalog_dir: PathBuf) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            catalog_dir,
        }
    }

    pub async fn add(&self, record: DocRecord) {
        self.records
            .write()
            .await
            .insert(record.name.clone(), record);
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.records.write().await.remove(name).is_some()
    }

    pub async fn get(&self, name: &str) -> Option<DocRecord> {
        self.records.read().await.get(name).cloned()
    }

    /// All records, or only those in `category` when given.
    pub async fn list(&self, category: Option<&str>) -> Vec<DocRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|record| category.is_none_or(|c| record.category == c))
            .cloned()
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .collect()
    }

    /// Case-insensitive substring match over name, tags, and description,
    /// strongest field first. Full relevance scoring over fetched text lives
    /// upstream; this only ranks the metadata.
    pub async fn search(&self, query: &str) -> Vec<DocRecord> {
        let needle = query.to_lowercase();
        self.records
            .read()
            .await
            .values()
            .filter_map(|record| {
                let mut score = 0u32;
                if record.name.to_lowercase().contains(&needle) {
                    score += 4;
                }
                if record
                    .tags
                    .iter()
                    .any(|tag| tag.to_lowercase().contains(&needle))
                {
                    score += 2;
                }
                if record.description.to_lowercase().contains(&needle) {
                    score += 1;
                }
                (score > 0).then(|| (score, record.clone()))
            })
            .sorted_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)))
            .map(|(_, record)| record)
            .collect()
    }

    /// Saves the catalog as one JSON file per category, removing files for
    /// categories that no longer exist.
    pub async fn save(&self) -> Result<(), io::Error> {
        let dir_path = &self.catalog_dir;
        let by_category: HashMap<String, CategoryRecords> = {
            let records = self.records.read().await;
            records
                .values()
                .sorted_by(|a, b| a.category.cmp(&b.category))
                .chunk_by(|record| record.category.clone())
                .into_iter()
                .map(|(category, group)| {
                    let records: CategoryRecords = group
                        .map(|record| (record.name.clone(), record.clone()))
                        .collect();
                    (category, records)
                })
                .collect()
        };

        fs::create_dir_all(dir_path).await?;

        let mut saved_files = std::collections::HashSet::new();
        for (category, records) in &by_category {
            let file_path = dir_path.join(format!("{}.json", category));
            let serialized = serde_json::to_string_pretty(records).map_err(io::Error::other)?;
            fs::write(&file_path, serialized).await?;
            saved_files.insert(file_path);
            tracing::debug!(category, "saved catalog category");
        }

        let mut entries = fs::read_dir(dir_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file()
                && path.extension().is_some_and(|ext| ext == "json")
                && !saved_files.contains(&path)
            {
                match fs::remove_file(&path).await {
                    Ok(()) => tracing::info!(?path, "removed stale catalog file"),
                    Err(err) => tracing::warn!(?path, %err, "failed to remove stale catalog file"),
                }
            }
        }
        Ok(())
    }

    /// Loads every category file from the catalog directory, replacing the
    /// in-memory records. Missing directory means an empty catalog; files
    /// that fail to parse are skipped with an error log.
    pub async fn load(&self) -> Result<(), io::Error> {
        let dir_path = &self.catalog_dir;
        if !dir_path.is_dir() {
            tracing::info!(?dir_path, "catalog directory not found, starting empty");
            self.records.write().await.clear();
            return Ok(());
        }

        let mut loaded = HashMap::new();
        let mut file_count = 0;
        let mut entries = fs::read_dir(dir_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(err) => {
                    tracing::error!(?path, %err, "failed to read catalog file, skipping");
                    continue;
                }
            };
            if content.trim().is_empty() {
                tracing::warn!(?path, "catalog file is empty, skipping");
                continue;
            }
            match serde_json::from_str::<CategoryRecords>(&content) {
                Ok(records) => {
                    file_count += 1;
                    loaded.extend(records);
                }
                Err(err) => {
                    tracing::error!(?path, %err, "failed to parse catalog file, skipping");
                }
            }
        }

        let mut records = self.records.write().await;
        let item_count = loaded.len();
        *records = loaded;
        tracing::info!(?dir_path, file_count, item_count, "catalog loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(name: &str, category: &str, tags: &[&str]) -> DocRecord {
        DocRecord {
            name: name.to_string(),
            source: DocSource::Website {
                url: format!("https://example.com/{name}"),
            },
            category: category.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            description: format!("{name} reference material"),
        }
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let dir = tempdir().unwrap();
        let catalog = CatalogStore::new(dir.path().to_path_buf());
        catalog.add(record("tokio", "async", &["runtime"])).await;

        assert_eq!(catalog.get("tokio").await.unwrap().category, "async");
        assert!(catalog.remove("tokio").await);
        assert!(!catalog.remove("tokio").await);
        assert!(catalog.get("tokio").await.is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_category() {
        let dir = tempdir().unwrap();
        let catalog = CatalogStore::new(dir.path().to_path_buf());
        catalog.add(record("tokio", "async", &[])).await;
        catalog.add(record("serde", "serialization", &[])).await;
        catalog.add(record("hyper", "async", &[])).await;

        let all = catalog.list(None).await;
        assert_eq!(all.len(), 3);
        let async_docs = catalog.list(Some("async")).await;
        assert_eq!(async_docs.len(), 2);
        assert_eq!(async_docs[0].name, "hyper");
        assert_eq!(async_docs[1].name, "tokio");
    }

    #[tokio::test]
    async fn test_search_ranks_name_above_description() {
        let dir = tempdir().unwrap();
        let catalog = CatalogStore::new(dir.path().to_path_buf());
        catalog.add(record("tokio", "async", &["runtime"])).await;
        let mut about = record("async-book", "async", &[]);
        about.description = "covers tokio internals".to_string();
        catalog.add(about).await;

        let results = catalog.search("tokio").await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "tokio");
        assert_eq!(results[1].name, "async-book");

        assert!(catalog.search("nonexistent").await.is_empty());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let catalog = CatalogStore::new(path.clone());
        catalog.add(record("tokio", "async", &["runtime"])).await;
        catalog.add(record("hyper", "async", &["http"])).await;
        catalog.add(record("serde", "serialization", &[])).await;
        catalog.save().await.unwrap();

        assert!(path.join("async.json").exists());
        assert!(path.join("serialization.json").exists());

        let restored = CatalogStore::new(path);
        restored.load().await.unwrap();
        assert_eq!(restored.list(None).await.len(), 3);
        assert_eq!(
            restored.get("tokio").await.unwrap(),
            record("tokio", "async", &["runtime"])
        );
    }

    #[tokio::test]
    async fn test_save_removes_stale_category_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let catalog = CatalogStore::new(path.clone());
        catalog.add(record("tokio", "async", &[])).await;
        catalog.add(record("serde", "serialization", &[])).await;
        catalog.save().await.unwrap();
        assert!(path.join("serialization.json").exists());

        assert!(catalog.remove("serde").await);
        catalog.save().await.unwrap();
        assert!(path.join("async.json").exists());
        assert!(
            !path.join("serialization.json").exists(),
            "emptied category file should be removed"
        );
    }

    #[tokio::test]
    async fn test_load_missing_directory_starts_empty() {
        let dir = tempdir().unwrap();
        let catalog = CatalogStore::new(dir.path().join("nope"));
        catalog.load().await.unwrap();
        assert!(catalog.list(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_load_skips_invalid_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let catalog = CatalogStore::new(path.clone());
        catalog.add(record("tokio", "async", &[])).await;
        catalog.save().await.unwrap();
        fs::write(path.join("broken.json"), "{not json}").await.unwrap();

        let restored = CatalogStore::new(path);
        restored.load().await.unwrap();
        assert_eq!(restored.list(None).await.len(), 1);
    }
}
