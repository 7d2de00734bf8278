//! Catalog Growth Monitor
//!
//! Counts successful slow-path fingerprints over a rolling window and promotes
//! recurring shapes into the template catalog. The request path only does a
//! non-blocking `try_send`; counting, embedding and inserting happen on the
//! worker task.

use crate::application::use_cases::embedding_service::Embedder;
use crate::application::use_cases::template_catalog::TemplateCatalog;
use crate::domain::error::Result;
use crate::domain::template::{FingerprintOccurrence, NewTemplate};
use crate::infrastructure::db::catalog::CatalogRepository;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrowthConfig {
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Cosine similarity at which a candidate counts as a near-duplicate of an
    /// existing template.
    #[serde(default = "default_duplicate_similarity")]
    pub duplicate_similarity: f32,
}

fn default_promotion_threshold() -> usize {
    5
}

fn default_window_secs() -> u64 {
    86_400
}

fn default_channel_capacity() -> usize {
    256
}

fn default_duplicate_similarity() -> f32 {
    0.95
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: default_promotion_threshold(),
            window_secs: default_window_secs(),
            channel_capacity: default_channel_capacity(),
            duplicate_similarity: default_duplicate_similarity(),
        }
    }
}

/// Request-side handle. Cloning is cheap.
#[derive(Clone)]
pub struct GrowthMonitor {
    tx: mpsc::Sender<FingerprintOccurrence>,
}

impl GrowthMonitor {
    /// Starts the worker on the current runtime.
    pub fn spawn(worker: GrowthWorker) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(worker.config.channel_capacity.max(1));
        let handle = tokio::spawn(worker.run(rx));
        (Self { tx }, handle)
    }

    /// Never waits. Returns false when the observation was dropped.
    pub fn observe(&self, occurrence: FingerprintOccurrence) -> bool {
        match self.tx.try_send(occurrence) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(occurrence)) => {
                warn!(
                    fingerprint = %short(&occurrence.fingerprint),
                    "Growth channel full, dropping observation"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Growth worker stopped, dropping observation");
                false
            }
        }
    }
}

/// What happened to one observation.
#[derive(Debug, Clone, PartialEq)]
pub enum GrowthEvent {
    Counted { occurrences: usize },
    AlreadyCatalogued,
    NearDuplicate { template_id: i64, similarity: f32 },
    Promoted { template_id: i64 },
    PromotionFailed,
}

pub struct GrowthWorker {
    catalog: Arc<TemplateCatalog>,
    embedder: Arc<dyn Embedder>,
    store: Option<Arc<CatalogRepository>>,
    config: GrowthConfig,
    windows: HashMap<String, VecDeque<DateTime<Utc>>>,
    /// Fingerprints that already went through promotion, whatever the result.
    settled: HashSet<String>,
}

impl GrowthWorker {
    pub fn new(
        catalog: Arc<TemplateCatalog>,
        embedder: Arc<dyn Embedder>,
        store: Option<Arc<CatalogRepository>>,
        config: GrowthConfig,
    ) -> Self {
        Self {
            catalog,
            embedder,
            store,
            config,
            windows: HashMap::new(),
            settled: HashSet::new(),
        }
    }

    fn window(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.window_secs.min(i64::MAX as u64) as i64)
    }

    /// How often the worker drops expired windows. Never longer than an hour.
    fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.config.window_secs.clamp(1, 3_600))
    }

    /// Rebuilds the in-memory windows from the persisted occurrence log, so
    /// counts survive restarts. Older rows are pruned. Calling it again
    /// replaces the windows rather than adding to them.
    pub async fn restore(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let cutoff = now - self.window();
        let pruned = store.prune_occurrences_before(cutoff).await?;
        let occurrences = store.load_occurrences_since(cutoff).await?;
        let restored = occurrences.len();
        self.windows.clear();
        for occurrence in occurrences {
            self.windows
                .entry(occurrence.fingerprint)
                .or_default()
                .push_back(occurrence.observed_at);
        }
        info!(restored, pruned, "Growth window restored");
        Ok(restored)
    }

    pub fn occurrences(&self, fingerprint: &str) -> usize {
        self.windows.get(fingerprint).map_or(0, |w| w.len())
    }

    pub fn tracked_fingerprints(&self) -> usize {
        self.windows.len()
    }

    /// Drops expired timestamps from every window, forgets fingerprints left
    /// with none, and prunes the persisted log to match. Returns the number
    /// of fingerprints forgotten.
    pub async fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window();
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            while window.front().is_some_and(|t| *t < cutoff) {
                window.pop_front();
            }
            !window.is_empty()
        });
        let forgotten = before - self.windows.len();

        if let Some(store) = &self.store {
            match store.prune_occurrences_before(cutoff).await {
                Ok(pruned) => debug!(forgotten, pruned, "Growth window swept"),
                Err(e) => warn!("Failed to prune occurrences: {}", e),
            }
        }
        forgotten
    }

    pub async fn handle(&mut self, occurrence: FingerprintOccurrence) -> GrowthEvent {
        if self.settled.contains(&occurrence.fingerprint)
            || self.catalog.find_by_fingerprint(&occurrence.fingerprint).is_some()
        {
            return GrowthEvent::AlreadyCatalogued;
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.record_occurrence(&occurrence).await {
                warn!("Failed to persist occurrence: {}", e);
            }
        }

        let cutoff = occurrence.observed_at - self.window();
        let window = self
            .windows
            .entry(occurrence.fingerprint.clone())
            .or_default();
        window.push_back(occurrence.observed_at);
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
        let count = window.len();

        debug!(
            fingerprint = %short(&occurrence.fingerprint),
            count,
            "Slow-path fingerprint observed"
        );

        if count < self.config.promotion_threshold {
            return GrowthEvent::Counted { occurrences: count };
        }

        info!(
            fingerprint = %short(&occurrence.fingerprint),
            count,
            "Fingerprint crossed promotion threshold"
        );
        self.settled.insert(occurrence.fingerprint.clone());

        match self.promote(&occurrence).await {
            Ok(event) => {
                self.windows.remove(&occurrence.fingerprint);
                if let Some(store) = &self.store {
                    if let Err(e) = store.delete_occurrences(&occurrence.fingerprint).await {
                        warn!("Failed to clear promoted occurrences: {}", e);
                    }
                }
                event
            }
            Err(e) => {
                // Let a later observation retry.
                self.settled.remove(&occurrence.fingerprint);
                warn!(
                    fingerprint = %short(&occurrence.fingerprint),
                    "Promotion failed: {}", e
                );
                GrowthEvent::PromotionFailed
            }
        }
    }

    async fn promote(&self, occurrence: &FingerprintOccurrence) -> Result<GrowthEvent> {
        let embedding = self.embedder.embed(&occurrence.canonical_sql).await?;

        if let Some((template_id, similarity)) = self
            .catalog
            .nearest_neighbors(&embedding, 1)?
            .into_iter()
            .next()
        {
            if similarity >= self.config.duplicate_similarity {
                info!(
                    template_id,
                    similarity, "Promotion skipped, near-duplicate template exists"
                );
                return Ok(GrowthEvent::NearDuplicate {
                    template_id,
                    similarity,
                });
            }
        }

        let template_id = self
            .catalog
            .insert(NewTemplate {
                raw_sql: occurrence.raw_sql.clone(),
                canonical_sql: occurrence.canonical_sql.clone(),
                fingerprint: occurrence.fingerprint.clone(),
                embedding,
                description: describe(&occurrence.question),
                parameter_types: occurrence.parameter_types.clone(),
                placeholder_count: occurrence.placeholder_count,
            })
            .await?;

        info!(template_id, "Promoted recurring query shape into catalog");
        Ok(GrowthEvent::Promoted { template_id })
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<FingerprintOccurrence>) {
        if let Err(e) = self.restore(Utc::now()).await {
            warn!("Failed to restore growth window: {}", e);
        }

        let mut sweep = tokio::time::interval(self.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and restore already pruned.
        sweep.tick().await;

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(occurrence) => {
                        self.handle(occurrence).await;
                    }
                    None => break,
                },
                _ = sweep.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }
        debug!("Growth worker stopped");
    }
}

fn describe(question: &str) -> String {
    let question = question.trim();
    if question.is_empty() {
        "Promoted query shape".to_string()
    } else {
        question.chars().take(200).collect()
    }
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}
