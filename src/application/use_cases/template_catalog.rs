//! Template Catalog
//!
//! Read-mostly store of vetted templates. Readers load an immutable snapshot
//! through `ArcSwap` and never block; writers serialise on a mutex, build a
//! new snapshot (templates plus rebuilt ANN index) and swap it in whole, so
//! no reader ever sees a half-updated index. Usage counters are atomics
//! shared between snapshots and are allowed to lose updates.

use super::ivf_index::{IvfConfig, IvfIndex};
use crate::domain::error::{AppError, Result};
use crate::domain::template::{CatalogStats, NewTemplate, Template, TemplateUsage};
use crate::infrastructure::db::catalog::CatalogRepository;
use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct CatalogEntry {
    template: Template,
    usage: AtomicU64,
}

impl CatalogEntry {
    fn new(template: Template) -> Self {
        let usage = AtomicU64::new(template.usage_count);
        Self { template, usage }
    }

    fn to_template(&self) -> Template {
        let mut template = self.template.clone();
        template.usage_count = self.usage.load(Ordering::Relaxed);
        template
    }
}

struct CatalogSnapshot {
    templates: BTreeMap<i64, Arc<CatalogEntry>>,
    by_fingerprint: HashMap<String, i64>,
    index: IvfIndex,
    version: u64,
}

impl CatalogSnapshot {
    fn build(config: IvfConfig, templates: Vec<Template>, version: u64) -> Result<Self> {
        let vectors: Vec<(i64, Vec<f32>)> = templates
            .iter()
            .map(|t| (t.id, t.embedding.clone()))
            .collect();
        let index = IvfIndex::build(config, &vectors)?;

        let mut by_fingerprint = HashMap::with_capacity(templates.len());
        let mut entries = BTreeMap::new();
        for template in templates {
            by_fingerprint.insert(template.fingerprint.clone(), template.id);
            entries.insert(template.id, Arc::new(CatalogEntry::new(template)));
        }

        Ok(Self {
            templates: entries,
            by_fingerprint,
            index,
            version,
        })
    }
}

pub struct TemplateCatalog {
    snapshot: ArcSwap<CatalogSnapshot>,
    write_lock: Mutex<()>,
    /// Serialises whole inserts, store write included.
    insert_lock: tokio::sync::Mutex<()>,
    store: Option<Arc<CatalogRepository>>,
    config: IvfConfig,
    next_local_id: AtomicU64,
}

impl TemplateCatalog {
    /// Memory-only catalog.
    pub fn new(config: IvfConfig) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(CatalogSnapshot {
                templates: BTreeMap::new(),
                by_fingerprint: HashMap::new(),
                index: IvfIndex::empty(config),
                version: 0,
            }),
            write_lock: Mutex::new(()),
            insert_lock: tokio::sync::Mutex::new(()),
            store: None,
            config,
            next_local_id: AtomicU64::new(1),
        }
    }

    /// Loads every persisted template and builds the first snapshot.
    pub async fn load(config: IvfConfig, store: Arc<CatalogRepository>) -> Result<Self> {
        let templates = store.load_templates().await?;
        let next_id = templates.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let count = templates.len();
        let snapshot = CatalogSnapshot::build(config, templates, 1)?;
        info!(
            templates = count,
            cells = snapshot.index.cell_occupancy().len(),
            "Template catalog loaded"
        );

        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            write_lock: Mutex::new(()),
            insert_lock: tokio::sync::Mutex::new(()),
            store: Some(store),
            config,
            next_local_id: AtomicU64::new(next_id.max(1) as u64),
        })
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    pub fn get(&self, id: i64) -> Option<Template> {
        self.snapshot
            .load()
            .templates
            .get(&id)
            .map(|entry| entry.to_template())
    }

    pub fn find_by_fingerprint(&self, fingerprint: &str) -> Option<i64> {
        self.snapshot.load().by_fingerprint.get(fingerprint).copied()
    }

    /// All templates ordered by id.
    pub fn all(&self) -> Vec<Template> {
        self.snapshot
            .load()
            .templates
            .values()
            .map(|entry| entry.to_template())
            .collect()
    }

    /// Up to `k` templates by descending cosine similarity, ties broken by
    /// lower id.
    pub fn nearest_neighbors(&self, query_embedding: &[f32], k: usize) -> Result<Vec<(i64, f32)>> {
        let snapshot = self.snapshot.load();
        let hits = snapshot.index.search(query_embedding, k)?;
        Ok(hits.into_iter().map(|hit| (hit.id, hit.similarity)).collect())
    }

    /// Persists (when backed by a store) and publishes a new template.
    /// A fingerprint already in the catalog, or already stored by another
    /// writer, returns the existing id.
    pub async fn insert(&self, input: NewTemplate) -> Result<i64> {
        if let Some(existing) = self.find_by_fingerprint(&input.fingerprint) {
            debug!(template_id = existing, "Template fingerprint already catalogued");
            return Ok(existing);
        }
        let _insert_guard = self.insert_lock.lock().await;
        if let Some(existing) = self.find_by_fingerprint(&input.fingerprint) {
            debug!(template_id = existing, "Template fingerprint catalogued concurrently");
            return Ok(existing);
        }
        if input.embedding.is_empty() {
            return Err(AppError::Embedding("Template embedding is empty".to_string()));
        }
        if let Some(dims) = self.snapshot.load().index.dims() {
            if input.embedding.len() != dims {
                return Err(AppError::Embedding(format!(
                    "Template embedding has {} dimensions, catalog uses {}",
                    input.embedding.len(),
                    dims
                )));
            }
        }

        let (template, created) = match &self.store {
            Some(store) => {
                let stored = store.insert_template(&input).await?;
                (stored.template, stored.created)
            }
            None => {
                let now = Utc::now();
                let template = Template {
                    id: self.next_local_id.fetch_add(1, Ordering::Relaxed) as i64,
                    canonical_sql: input.canonical_sql,
                    raw_sql: input.raw_sql,
                    fingerprint: input.fingerprint,
                    embedding: input.embedding,
                    description: input.description,
                    parameter_types: input.parameter_types,
                    placeholder_count: input.placeholder_count,
                    usage_count: 0,
                    created_at: now,
                    updated_at: now,
                };
                (template, true)
            }
        };

        let id = template.id;
        match self.publish(template) {
            Ok(published) => Ok(published),
            Err(e) => {
                // Keep the store in step with the snapshot.
                if let (Some(store), true) = (&self.store, created) {
                    if let Err(cleanup) = store.delete_template(id).await {
                        warn!(
                            template_id = id,
                            "Failed to roll back unpublished template: {}", cleanup
                        );
                    }
                }
                Err(e)
            }
        }
    }

    fn publish(&self, template: Template) -> Result<i64> {
        let _guard = self.write_lock.lock();
        let current = self.snapshot.load_full();

        if let Some(existing) = current.by_fingerprint.get(&template.fingerprint) {
            return Ok(*existing);
        }

        let id = template.id;
        let index = current.index.with_entry(id, &template.embedding)?;
        let mut templates = current.templates.clone();
        let mut by_fingerprint = current.by_fingerprint.clone();
        by_fingerprint.insert(template.fingerprint.clone(), id);
        templates.insert(id, Arc::new(CatalogEntry::new(template)));

        let version = current.version + 1;
        self.snapshot.store(Arc::new(CatalogSnapshot {
            templates,
            by_fingerprint,
            index,
            version,
        }));

        info!(template_id = id, version, "Template published");
        Ok(id)
    }

    /// Best-effort counter bump. Returns the new in-memory count, or `None`
    /// for an unknown id. Persisting runs in the background.
    pub fn increment_usage(&self, id: i64) -> Option<u64> {
        let snapshot = self.snapshot.load();
        let entry = snapshot.templates.get(&id)?;
        let count = entry.usage.fetch_add(1, Ordering::Relaxed) + 1;

        if let Some(store) = &self.store {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let store = Arc::clone(store);
                handle.spawn(async move {
                    if let Err(e) = store.set_usage(id, count).await {
                        warn!(template_id = id, "Failed to persist usage count: {}", e);
                    }
                });
            }
        }

        Some(count)
    }

    pub fn stats(&self, top_n: usize) -> CatalogStats {
        let snapshot = self.snapshot.load();
        let mut usage: Vec<TemplateUsage> = snapshot
            .templates
            .values()
            .map(|entry| TemplateUsage {
                template_id: entry.template.id,
                description: entry.template.description.clone(),
                usage_count: entry.usage.load(Ordering::Relaxed),
            })
            .collect();
        let total_usage = usage.iter().map(|u| u.usage_count).sum();
        usage.sort_by(|a, b| {
            b.usage_count
                .cmp(&a.usage_count)
                .then(a.template_id.cmp(&b.template_id))
        });
        usage.truncate(top_n);

        CatalogStats {
            template_count: snapshot.templates.len(),
            total_usage,
            most_used: usage,
            cell_occupancy: snapshot.index.cell_occupancy(),
            snapshot_version: snapshot.version,
        }
    }

    pub fn index_config(&self) -> IvfConfig {
        self.config
    }
}
